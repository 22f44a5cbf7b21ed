//! Transmit throttler
//!
//! Classic token bucket, one instance per tx worker with the global rate
//! split evenly. The worker asks for a batch each loop iteration; tokens
//! accumulate with wall time and the carry-over is clamped so a stalled
//! worker cannot burst more than a tenth of a second of traffic when it
//! wakes up. When no token is available the call sleeps just long enough
//! for one to accrue, which is the only place a tx worker blocks besides
//! the NIC itself.

use std::time::{Duration, Instant};

/// Hard cap on one batch regardless of rate
const MAX_BATCH: u32 = 10_000;

pub struct Throttler {
    rate: f64,
    tokens: f64,
    max_tokens: f64,
    last: Instant,
    /// Smoothed observed rate for the status line
    current_rate: f64,
}

impl Throttler {
    /// `rate` is this worker's share of the packets-per-second target
    pub fn new(rate: f64) -> Self {
        debug_assert!(rate > 0.0);
        Self {
            rate,
            tokens: 0.0,
            // burst bound: 100ms worth of traffic, at least one packet
            max_tokens: (rate / 10.0).max(1.0),
            last: Instant::now(),
            current_rate: 0.0,
        }
    }

    /// Number of packets the worker may send now. Sleeps briefly when the
    /// bucket is empty, so the return value is always at least 1 unless
    /// the rate is extremely low.
    pub fn next_batch(&mut self) -> u32 {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.last = now;

            self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
            if elapsed > 0.0 {
                let inst = (self.tokens / elapsed).min(self.rate);
                self.current_rate = self.current_rate * 0.8 + inst * 0.2;
            }

            if self.tokens >= 1.0 {
                let batch = (self.tokens as u32).min(MAX_BATCH);
                self.tokens -= batch as f64;
                return batch;
            }

            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64((deficit / self.rate).min(0.01));
            std::thread::sleep(wait);
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sustained_rate() {
        let mut throttler = Throttler::new(10_000.0);
        let start = Instant::now();
        let mut sent = 0u64;
        while sent < 2_000 {
            sent += throttler.next_batch() as u64;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let rate = sent as f64 / elapsed;
        // generous bounds: scheduling jitter is real, sustained drift is not
        assert!(rate < 25_000.0, "rate {} far above target", rate);
        assert!(rate > 4_000.0, "rate {} far below target", rate);
    }

    #[test]
    fn test_burst_bounded_after_stall() {
        let mut throttler = Throttler::new(1_000.0);
        throttler.next_batch();
        std::thread::sleep(Duration::from_millis(500));
        // half a second of stall must not yield half a second of packets
        let batch = throttler.next_batch();
        assert!(batch <= 100, "burst of {} exceeds 100ms worth", batch);
    }

    #[test]
    fn test_batch_never_zero() {
        let mut throttler = Throttler::new(50.0);
        for _ in 0..5 {
            assert!(throttler.next_batch() >= 1);
        }
    }

    #[test]
    fn test_low_rate_paces() {
        let mut throttler = Throttler::new(100.0);
        throttler.next_batch();
        let start = Instant::now();
        let mut sent = 0;
        while sent < 20 {
            sent += throttler.next_batch();
        }
        // 20 packets at 100 pps is roughly 200ms
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
