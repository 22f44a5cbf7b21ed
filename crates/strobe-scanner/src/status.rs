//! Status reporting contract
//!
//! The engine samples its own state a few times per second and hands the
//! snapshot to a printer. Rendering lives with the caller (the CLI draws a
//! one-line display); the default printer just logs.

use tracing::info;

/// One snapshot of scan progress
#[derive(Debug, Clone, Default)]
pub struct StatusItem {
    /// Lowest transmit index across tx workers
    pub cur_count: u64,
    /// Size of the index space
    pub max_count: u64,
    /// Completed sweeps in infinite mode
    pub repeat_count: u64,
    /// Summed observed rate of the tx workers
    pub cur_pps: f64,
    pub total_sent: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_info: u64,
    /// Pending fast-timeout events
    pub tm_event_backlog: u64,
    /// Sidecar transmit ring, percent free
    pub tx_queue_ratio: f64,
    /// Most congested dispatch ring, percent free
    pub rx_queue_ratio: f64,
    /// Seconds left in the drain phase, when draining
    pub exiting_secs: Option<u64>,
    /// Free-form text from the scan module
    pub add_status: Option<String>,
}

pub trait StatusPrinter: Send {
    fn print(&mut self, item: &StatusItem);

    fn finish(&mut self) {}
}

/// Logs a compact line through `tracing`
#[derive(Debug, Default)]
pub struct LogStatus;

impl StatusPrinter for LogStatus {
    fn print(&mut self, item: &StatusItem) {
        info!(
            "{:.2}% done, rate {:.0} pps, sent {}, found {}, failed {}, tm {}, txq {:.0}% rxq {:.0}%",
            if item.max_count > 0 {
                item.cur_count as f64 * 100.0 / item.max_count as f64
            } else {
                0.0
            },
            item.cur_pps,
            item.total_sent,
            item.total_success,
            item.total_failed,
            item.tm_event_backlog,
            item.tx_queue_ratio,
            item.rx_queue_ratio,
        );
    }
}

/// Discards every snapshot; used by tests
#[derive(Debug, Default)]
pub struct NullStatus;

impl StatusPrinter for NullStatus {
    fn print(&mut self, _item: &StatusItem) {}
}
