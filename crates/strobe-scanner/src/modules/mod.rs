//! Scan module registry

mod arp_req;
mod icmp_echo;
mod icmp_time;
mod tcp_syn;
mod udp;
mod zbanner;

pub use arp_req::ArpReqScan;
pub use icmp_echo::IcmpEchoScan;
pub use icmp_time::IcmpTimeScan;
pub use tcp_syn::TcpSynScan;
pub use udp::UdpScan;
pub use zbanner::ZBannerScan;

use crate::contract::ScanModule;
use strobe_core::{Error, Result};

/// Instantiate a scan module by name
pub fn create_scan_module(name: &str) -> Result<Box<dyn ScanModule>> {
    match name {
        "tcp-syn" => Ok(Box::new(TcpSynScan::new())),
        "zbanner" => Ok(Box::new(ZBannerScan::new())),
        "udp" => Ok(Box::new(UdpScan::new())),
        "icmp-echo" => Ok(Box::new(IcmpEchoScan::new())),
        "icmp-time" => Ok(Box::new(IcmpTimeScan::new())),
        "arp-req" => Ok(Box::new(ArpReqScan::new())),
        other => Err(Error::Config(format!("unknown scan module: {}", other))),
    }
}

pub fn list_scan_modules() -> &'static [&'static str] {
    &["tcp-syn", "zbanner", "udp", "icmp-echo", "icmp-time", "arp-req"]
}
