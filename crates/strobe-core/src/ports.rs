//! Multi-protocol port namespace
//!
//! The scanner enumerates TCP, UDP, SCTP, and raw-protocol targets with a
//! single picker by packing them into one 17-bit-ish namespace: TCP ports
//! occupy [0, 65535], UDP [65536, 131071], SCTP [131072, 196607], and
//! "other protocol" numbers sit above that. A single [`PortList`]
//! concatenates those disjoint windows; unpacking yields a `(proto, port)`
//! pair, and nothing outside this module ever sees the packed value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const UDP_START: u32 = 65_536;
const SCTP_START: u32 = 131_072;
const OTHER_START: u32 = 196_608;
const NAMESPACE_END: u32 = OTHER_START + 65_535;

/// Transport protocol of a scan target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProto {
    Tcp,
    Udp,
    Sctp,
    /// Port-less protocols (ICMP, ARP, raw IP); the "port" is a module tag
    Other,
}

impl IpProto {
    /// IANA protocol number, for result records and templates
    pub fn number(&self) -> u8 {
        match self {
            IpProto::Tcp => 6,
            IpProto::Udp => 17,
            IpProto::Sctp => 132,
            IpProto::Other => 255,
        }
    }
}

impl fmt::Display for IpProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProto::Tcp => write!(f, "tcp"),
            IpProto::Udp => write!(f, "udp"),
            IpProto::Sctp => write!(f, "sctp"),
            IpProto::Other => write!(f, "other"),
        }
    }
}

fn pack(proto: IpProto, port: u16) -> u32 {
    let base = match proto {
        IpProto::Tcp => 0,
        IpProto::Udp => UDP_START,
        IpProto::Sctp => SCTP_START,
        IpProto::Other => OTHER_START,
    };
    base + port as u32
}

fn unpack(packed: u32) -> (IpProto, u16) {
    match packed {
        p if p < UDP_START => (IpProto::Tcp, p as u16),
        p if p < SCTP_START => (IpProto::Udp, (p - UDP_START) as u16),
        p if p < OTHER_START => (IpProto::Sctp, (p - SCTP_START) as u16),
        p => (IpProto::Other, (p - OTHER_START) as u16),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    begin: u32,
    end: u32,
}

impl PortRange {
    fn count(&self) -> u64 {
        (self.end - self.begin) as u64 + 1
    }
}

/// Ordered list of packed port ranges
#[derive(Debug, Clone, Default)]
pub struct PortList {
    ranges: Vec<PortRange>,
    cumulative: Vec<u64>,
    optimized: bool,
}

impl PortList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, proto: IpProto, begin: u16, end: u16) {
        let (begin, end) = if begin <= end {
            (begin, end)
        } else {
            (end, begin)
        };
        self.ranges.push(PortRange {
            begin: pack(proto, begin),
            end: pack(proto, end),
        });
        self.optimized = false;
        self.cumulative.clear();
    }

    /// Parse a port spec. Plain entries are TCP; `u:`, `s:`, and `o:`
    /// prefixes select UDP, SCTP, and other-protocol windows:
    /// `80,443,8000-8100,u:53,u:100-200,s:36412,o:1`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut list = Self::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (proto, rest) = match part.split_once(':') {
                Some(("t", r)) | Some(("T", r)) => (IpProto::Tcp, r),
                Some(("u", r)) | Some(("U", r)) => (IpProto::Udp, r),
                Some(("s", r)) | Some(("S", r)) => (IpProto::Sctp, r),
                Some(("o", r)) | Some(("O", r)) => (IpProto::Other, r),
                Some((p, _)) => {
                    return Err(Error::InvalidPortRange(format!(
                        "unknown protocol prefix: {}",
                        p
                    )))
                }
                None => (IpProto::Tcp, part),
            };
            let (begin, end) = if let Some((lo, hi)) = rest.split_once('-') {
                let begin: u16 = lo.trim().parse().map_err(|_| {
                    Error::InvalidPortRange(format!("invalid port number: {}", lo))
                })?;
                let end: u16 = hi.trim().parse().map_err(|_| {
                    Error::InvalidPortRange(format!("invalid port number: {}", hi))
                })?;
                if end < begin {
                    return Err(Error::InvalidPortRange(format!(
                        "end port {} < start port {}",
                        end, begin
                    )));
                }
                (begin, end)
            } else {
                let port: u16 = rest.trim().parse().map_err(|_| {
                    Error::InvalidPortRange(format!("invalid port number: {}", rest))
                })?;
                (port, port)
            };
            list.add(proto, begin, end);
        }
        if list.ranges.is_empty() {
            return Err(Error::InvalidPortRange(
                "empty port specification".to_string(),
            ));
        }
        Ok(list)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn optimize(&mut self) {
        self.ranges.sort_by_key(|r| r.begin);
        let mut merged: Vec<PortRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.begin <= last.end.saturating_add(1) => {
                    if r.end > last.end {
                        last.end = r.end;
                    }
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
        self.cumulative = Vec::with_capacity(self.ranges.len());
        let mut total = 0u64;
        for r in &self.ranges {
            total += r.count();
            self.cumulative.push(total);
        }
        self.optimized = true;
    }

    pub fn count(&self) -> u64 {
        if self.optimized {
            self.cumulative.last().copied().unwrap_or(0)
        } else {
            self.ranges.iter().map(|r| r.count()).sum()
        }
    }

    /// `(proto, port)` at position `index`. Callers gate on `count()`.
    pub fn pick(&self, index: u64) -> (IpProto, u16) {
        debug_assert!(self.optimized, "pick before optimize");
        debug_assert!(index < self.count(), "pick index out of range");
        let slot = self.cumulative.partition_point(|&c| c <= index);
        let range = &self.ranges[slot];
        let before = if slot == 0 {
            0
        } else {
            self.cumulative[slot - 1]
        };
        unpack(range.begin + (index - before) as u32)
    }

    pub fn contains(&self, proto: IpProto, port: u16) -> bool {
        debug_assert!(self.optimized, "contains before optimize");
        let packed = pack(proto, port);
        let slot = self.ranges.partition_point(|r| r.end < packed);
        slot < self.ranges.len() && self.ranges[slot].begin <= packed
    }

    /// Whether the list holds anything besides other-proto tags
    pub fn has_real_ports(&self) -> bool {
        self.ranges.iter().any(|r| r.begin < OTHER_START)
    }
}

/// Highest packed value, used only by validation
pub fn namespace_end() -> u32 {
    NAMESPACE_END
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_windows() {
        assert_eq!(unpack(pack(IpProto::Tcp, 80)), (IpProto::Tcp, 80));
        assert_eq!(unpack(pack(IpProto::Udp, 53)), (IpProto::Udp, 53));
        assert_eq!(unpack(pack(IpProto::Sctp, 36412)), (IpProto::Sctp, 36412));
        assert_eq!(unpack(pack(IpProto::Other, 0)), (IpProto::Other, 0));
        assert_eq!(unpack(pack(IpProto::Udp, 65535)), (IpProto::Udp, 65535));
    }

    #[test]
    fn test_parse_default_tcp() {
        let mut list = PortList::parse("80,443,8000-8002").unwrap();
        list.optimize();
        assert_eq!(list.count(), 5);
        assert_eq!(list.pick(0), (IpProto::Tcp, 80));
        assert_eq!(list.pick(1), (IpProto::Tcp, 443));
        assert_eq!(list.pick(4), (IpProto::Tcp, 8002));
    }

    #[test]
    fn test_parse_mixed_protocols() {
        let mut list = PortList::parse("80,u:53,s:36412,o:0").unwrap();
        list.optimize();
        assert_eq!(list.count(), 4);
        // picker yields protocols in packed-window order
        assert_eq!(list.pick(0), (IpProto::Tcp, 80));
        assert_eq!(list.pick(1), (IpProto::Udp, 53));
        assert_eq!(list.pick(2), (IpProto::Sctp, 36412));
        assert_eq!(list.pick(3), (IpProto::Other, 0));
    }

    #[test]
    fn test_tcp_udp_same_number_are_distinct() {
        let mut list = PortList::parse("53,u:53").unwrap();
        list.optimize();
        assert_eq!(list.count(), 2);
        assert!(list.contains(IpProto::Tcp, 53));
        assert!(list.contains(IpProto::Udp, 53));
        assert!(!list.contains(IpProto::Sctp, 53));
    }

    #[test]
    fn test_overlapping_ranges_dedup() {
        let mut list = PortList::parse("1-100,50-150").unwrap();
        list.optimize();
        assert_eq!(list.count(), 150);
    }

    #[test]
    fn test_invalid_specs() {
        assert!(PortList::parse("").is_err());
        assert!(PortList::parse("x:80").is_err());
        assert!(PortList::parse("99999").is_err());
        assert!(PortList::parse("100-50").is_err());
    }

    #[test]
    fn test_has_real_ports() {
        let mut only_other = PortList::parse("o:0").unwrap();
        only_other.optimize();
        assert!(!only_other.has_real_ports());
        let mut mixed = PortList::parse("80,o:0").unwrap();
        mixed.optimize();
        assert!(mixed.has_real_ports());
    }
}
