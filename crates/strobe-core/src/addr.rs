//! Version-tagged IP addresses
//!
//! The scanner works with raw integer representations of addresses: `u32`
//! for IPv4 and `u128` for IPv6. `Address` keeps the version tag explicit so
//! a v4 address is never silently widened into the v6 space.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IP address that always carries its version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Address {
    /// Numeric value of a v4 address, `None` for v6
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Address::V4(ip) => Some(u32::from(*ip)),
            Address::V6(_) => None,
        }
    }

    /// Numeric value of a v6 address, `None` for v4
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Address::V6(ip) => Some(u128::from(*ip)),
            Address::V4(_) => None,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Address::V4(_))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Address::V6(_))
    }

    pub fn from_v4_u32(value: u32) -> Self {
        Address::V4(Ipv4Addr::from(value))
    }

    pub fn from_v6_u128(value: u128) -> Self {
        Address::V6(Ipv6Addr::from(value))
    }

    /// Unspecified v4 address, used as a placeholder before the source
    /// identity is resolved
    pub fn zero_v4() -> Self {
        Address::V4(Ipv4Addr::UNSPECIFIED)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => write!(f, "{}", ip),
            Address::V6(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::V4(v4),
            IpAddr::V6(v6) => Address::V6(v6),
        }
    }
}

impl From<Address> for IpAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(v4) => IpAddr::V4(v4),
            Address::V6(v6) => IpAddr::V6(v6),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::V4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::V6(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_round_trip() {
        let addr = Address::from_v4_u32(0x0A000001);
        assert_eq!(addr, Address::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.as_u32(), Some(0x0A000001));
        assert_eq!(addr.as_u128(), None);
    }

    #[test]
    fn test_v6_round_trip() {
        let value = 0x2001_0db8_0000_0000_0000_0000_0000_0001u128;
        let addr = Address::from_v6_u128(value);
        assert!(addr.is_v6());
        assert_eq!(addr.as_u128(), Some(value));
        assert_eq!(addr.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_version_never_conflated() {
        let v4 = Address::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert!(v4.as_u128().is_none());
        let v6: Address = "::ffff:192.0.2.1".parse::<Ipv6Addr>().unwrap().into();
        assert!(v6.is_v6());
        assert!(v6.as_u32().is_none());
    }
}
