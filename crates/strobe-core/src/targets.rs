//! Target space composition
//!
//! A scan enumerates the cross product of addresses and ports as a flat
//! 64-bit index space. IPv4 targets occupy indexes below
//! `ipv4_index_threshold = count_ipv4s * count_ports`; IPv6 targets sit
//! above. Within each half the address varies fastest so that consecutive
//! indexes land on different hosts even before blackrock shuffling.

use crate::addr::Address;
use crate::error::{Error, Result};
use crate::ports::{IpProto, PortList};
use crate::range::{RangeList4, RangeList6};

/// Composed (address x port) scan space, read-only after [`TargetSpace::optimize`]
#[derive(Debug, Clone, Default)]
pub struct TargetSpace {
    pub ipv4: RangeList4,
    pub ipv6: RangeList6,
    pub ports: PortList,
    count_ipv4s: u64,
    count_ipv6s: u128,
    count_ports: u64,
    ipv4_index_threshold: u64,
    optimized: bool,
}

impl TargetSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove excluded addresses, then sort/coalesce everything and build
    /// the pick tables. Must run before any `pick`/`count` on the hot path.
    pub fn optimize(&mut self, exclude_v4: &RangeList4, exclude_v6: &RangeList6) {
        self.ipv4.optimize();
        self.ipv6.optimize();
        if !exclude_v4.is_empty() {
            self.ipv4.exclude(exclude_v4);
        }
        if !exclude_v6.is_empty() {
            self.ipv6.exclude(exclude_v6);
        }
        self.ports.optimize();

        self.count_ipv4s = self.ipv4.count();
        self.count_ipv6s = self.ipv6.count();
        self.count_ports = self.ports.count();
        self.ipv4_index_threshold = self.count_ipv4s * self.count_ports;
        self.optimized = true;
    }

    pub fn count_ipv4s(&self) -> u64 {
        self.count_ipv4s
    }

    pub fn count_ipv6s(&self) -> u128 {
        self.count_ipv6s
    }

    pub fn count_ports(&self) -> u64 {
        self.count_ports
    }

    pub fn has_ipv4_targets(&self) -> bool {
        !self.ipv4.is_empty()
    }

    pub fn has_ipv6_targets(&self) -> bool {
        !self.ipv6.is_empty()
    }

    /// Total number of (ip, port) pairs; can exceed 64 bits with v6 ranges
    pub fn count(&self) -> u128 {
        debug_assert!(self.optimized);
        (self.count_ipv4s as u128 + self.count_ipv6s)
            .saturating_mul(self.count_ports as u128)
    }

    /// Number of bits needed to index the space
    pub fn bit_count(&self) -> u32 {
        let count = self.count();
        128 - count.leading_zeros()
    }

    /// Refuse spaces the 64-bit index stream cannot cover
    pub fn validate_size(&self) -> Result<()> {
        if self.count() == 0 {
            return Err(Error::Config("target space is empty".to_string()));
        }
        if self.bit_count() > 63 {
            return Err(Error::Config(format!(
                "scan range too large: {} bits, max is 63 (IPv6 subnets must be /66 or smaller)",
                self.bit_count()
            )));
        }
        Ok(())
    }

    /// Map a flat index onto a target. Callers must gate on `count()`.
    pub fn pick(&self, index: u64) -> (Address, IpProto, u16) {
        debug_assert!(self.optimized, "pick before optimize");
        if index < self.ipv4_index_threshold {
            let addr = self.ipv4.pick(index % self.count_ipv4s);
            let (proto, port) = self.ports.pick(index / self.count_ipv4s);
            (Address::from_v4_u32(addr), proto, port)
        } else {
            let index = (index - self.ipv4_index_threshold) as u128;
            let addr = self.ipv6.pick(index % self.count_ipv6s);
            let (proto, port) = self.ports.pick((index / self.count_ipv6s) as u64);
            (Address::from_v6_u128(addr), proto, port)
        }
    }

    /// Whether an address belongs to the scan, for reply filtering
    pub fn has_ip(&self, addr: Address) -> bool {
        match addr {
            Address::V4(ip) => self.ipv4.contains(u32::from(ip)),
            Address::V6(ip) => self.ipv6.contains(u128::from(ip)),
        }
    }

    pub fn has_port(&self, proto: IpProto, port: u16) -> bool {
        self.ports.contains(proto, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn space(v4: &[&str], v6: &[&str], ports: &str) -> TargetSpace {
        let mut ts = TargetSpace::new();
        for s in v4 {
            ts.ipv4.add_spec(s).unwrap();
        }
        for s in v6 {
            ts.ipv6.add_spec(s).unwrap();
        }
        ts.ports = PortList::parse(ports).unwrap();
        ts.optimize(&RangeList4::new(), &RangeList6::new());
        ts
    }

    #[test]
    fn test_threshold_split() {
        // spec scenario 6: 4 v4 + 4 v6 addresses, one port
        let ts = space(&["198.51.100.0/30"], &["2001:db8::/126"], "22");
        assert_eq!(ts.count(), 8);

        let picked: HashSet<(Address, u16)> = (0..8)
            .map(|i| {
                let (addr, proto, port) = ts.pick(i);
                assert_eq!(proto, IpProto::Tcp);
                (addr, port)
            })
            .collect();
        assert_eq!(picked.len(), 8, "picker must be bijective");
        assert_eq!(picked.iter().filter(|(a, _)| a.is_v4()).count(), 4);
        assert_eq!(picked.iter().filter(|(a, _)| a.is_v6()).count(), 4);
    }

    #[test]
    fn test_address_varies_fastest() {
        let ts = space(&["10.0.0.0/30"], &[], "80,443");
        let (a0, _, p0) = ts.pick(0);
        let (a1, _, p1) = ts.pick(1);
        assert_ne!(a0, a1);
        assert_eq!(p0, p1);
        let (_, _, p4) = ts.pick(4);
        assert_eq!(p4, 443);
    }

    #[test]
    fn test_picker_bijective_with_multiple_ports() {
        let ts = space(&["10.0.0.0/28", "192.0.2.0/29"], &[], "80,443,u:53");
        let total = ts.count() as u64;
        assert_eq!(total, (16 + 8) * 3);
        let picked: HashSet<(Address, IpProto, u16)> =
            (0..total).map(|i| ts.pick(i)).collect();
        assert_eq!(picked.len(), total as usize);
    }

    #[test]
    fn test_size_validation() {
        let ts = space(&["10.0.0.0/8"], &[], "0-65535");
        assert!(ts.validate_size().is_ok());

        let mut big = TargetSpace::new();
        big.ipv6.add_spec("2001:db8::/64").unwrap();
        big.ports = PortList::parse("80").unwrap();
        big.optimize(&RangeList4::new(), &RangeList6::new());
        assert!(big.validate_size().is_err());

        let empty = {
            let mut ts = TargetSpace::new();
            ts.ports = PortList::parse("80").unwrap();
            ts.optimize(&RangeList4::new(), &RangeList6::new());
            ts
        };
        assert!(empty.validate_size().is_err());
    }

    #[test]
    fn test_has_ip_and_port() {
        let ts = space(&["192.0.2.0/28"], &["2001:db8::/126"], "80,u:53");
        assert!(ts.has_ip("192.0.2.7".parse::<std::net::Ipv4Addr>().unwrap().into()));
        assert!(!ts.has_ip("192.0.2.16".parse::<std::net::Ipv4Addr>().unwrap().into()));
        assert!(ts.has_ip("2001:db8::2".parse::<std::net::Ipv6Addr>().unwrap().into()));
        assert!(ts.has_port(IpProto::Tcp, 80));
        assert!(ts.has_port(IpProto::Udp, 53));
        assert!(!ts.has_port(IpProto::Tcp, 53));
    }

    #[test]
    fn test_exclusion_shrinks_space() {
        let mut ts = TargetSpace::new();
        ts.ipv4.add_spec("10.0.0.0/24").unwrap();
        ts.ports = PortList::parse("80").unwrap();
        let mut excl = RangeList4::new();
        excl.add_spec("10.0.0.128/25").unwrap();
        excl.optimize();
        ts.optimize(&excl, &RangeList6::new());
        assert_eq!(ts.count(), 128);
    }
}
