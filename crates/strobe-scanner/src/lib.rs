//! StrobeScan Scanner Library
//!
//! The stateless scan engine and everything that plugs into it: the
//! ScanModule/ProbeModule contracts with their reference implementations,
//! the dedup cache, the fast-timeout wheel, the per-worker throttler, the
//! TLS state adapter, and the tx/rx/handler thread machinery.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use strobe_core::{PortList, ScanConfig, TargetSpace};
//! use strobe_core::range::{RangeList4, RangeList6};
//! use strobe_network::{channel_link, LinkType};
//! use strobe_scanner::{LogStatus, Scanner};
//!
//! let mut config = ScanConfig::default();
//! config.source.ipv4 = Some("10.0.0.1".parse().unwrap());
//!
//! let mut targets = TargetSpace::new();
//! targets.ipv4.add_spec("192.0.2.0/28").unwrap();
//! targets.ports = PortList::parse("80,443").unwrap();
//! targets.optimize(&RangeList4::new(), &RangeList6::new());
//!
//! let (link, _peer) = channel_link(LinkType::Ethernet);
//! let sink = Box::new(strobe_core::output::NullSink);
//! let mut scanner = Scanner::new(config, targets, Arc::new(link), sink).unwrap();
//! scanner.run(&mut LogStatus).unwrap();
//! ```

pub mod contract;
pub mod dedup;
pub mod engine;
pub mod fast_timeout;
pub mod modules;
pub mod probes;
pub mod status;
pub mod throttler;
pub mod tls_state;

pub use contract::{
    ModuleContext, MultiMode, ParseAction, PreHandle, ProbeModule, ProbeState, ProbeTarget,
    ProbeType, Received, ScanModule, ScanTarget, ScanTmEvent,
};
pub use dedup::DedupTable;
pub use engine::{validate_scan_scale, Counters, ScanFlags, ScanSummary, Scanner};
pub use fast_timeout::{FtHandler, FtTable, FtWheel};
pub use modules::{create_scan_module, list_scan_modules};
pub use probes::{create_probe_module, list_probe_modules};
pub use status::{LogStatus, NullStatus, StatusItem, StatusPrinter};
pub use throttler::Throttler;
pub use tls_state::{RustlsSession, TlsConn, TlsSession, TspState};
