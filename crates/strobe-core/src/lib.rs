//! StrobeScan Core Library
//!
//! Core types and algorithms for the StrobeScan stateless scanner: the
//! address/range algebra, the packed multi-protocol port namespace, the
//! composed target space, the blackrock index permutation, the recognition
//! cookie, configuration, result records, and resume state. Everything
//! here is I/O-free and thread-free; the engine crates build on top.
//!
//! # Examples
//!
//! ```
//! use strobe_core::{Blackrock, PortList, RangeList4, TargetSpace};
//! use strobe_core::range::RangeList6;
//!
//! let mut space = TargetSpace::new();
//! space.ipv4.add_spec("10.0.0.0/30").unwrap();
//! space.ports = PortList::parse("80,443").unwrap();
//! space.optimize(&RangeList4::new(), &RangeList6::new());
//! assert_eq!(space.count(), 8);
//!
//! // a linear index sweep shuffled by blackrock covers every target once
//! let br = Blackrock::new(space.count() as u64, 0x1234, 14);
//! let (addr, proto, port) = space.pick(br.shuffle(0));
//! ```

pub mod addr;
pub mod blackrock;
pub mod config;
pub mod cookie;
pub mod error;
pub mod output;
pub mod ports;
pub mod range;
pub mod resume;
pub mod targets;

pub use addr::Address;
pub use blackrock::Blackrock;
pub use config::{ScanConfig, Shard, SourceConfig, SourcePorts};
pub use cookie::{entropy, get_cookie};
pub use error::{Error, Result};
pub use output::{OutItem, OutputLevel, OutputSink, Report, ReportValue};
pub use ports::{IpProto, PortList};
pub use range::{Range4, Range6, RangeList4, RangeList6};
pub use resume::ResumeState;
pub use targets::TargetSpace;
