//! Address range algebra
//!
//! Ranges are inclusive `[begin, end]` pairs kept in lists that are sorted,
//! disjoint, and coalesced after [`RangeList4::optimize`] /
//! [`RangeList6::optimize`]. Optimizing also builds a parallel prefix-sum
//! table so that picking the n-th address is a binary search instead of a
//! linear walk; with an Internet-wide exclude file the list can hold
//! hundreds of subranges and `pick` sits on the transmit hot path.

use crate::addr::Address;
use crate::error::{Error, Result};
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Inclusive IPv4 range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range4 {
    pub begin: u32,
    pub end: u32,
}

impl Range4 {
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    pub fn single(addr: u32) -> Self {
        Self {
            begin: addr,
            end: addr,
        }
    }

    pub fn count(&self) -> u64 {
        (self.end - self.begin) as u64 + 1
    }
}

/// Inclusive IPv6 range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range6 {
    pub begin: u128,
    pub end: u128,
}

impl Range6 {
    pub fn new(begin: u128, end: u128) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    pub fn count(&self) -> u128 {
        // [0, u128::MAX] would wrap; the scanner caps scan size at 63 bits
        // long before that matters, but saturate anyway.
        (self.end - self.begin).saturating_add(1)
    }
}

/// Ordered list of IPv4 ranges
#[derive(Debug, Clone, Default)]
pub struct RangeList4 {
    ranges: Vec<Range4>,
    /// cumulative[i] = number of addresses in ranges[..=i]; built by
    /// `optimize`
    cumulative: Vec<u64>,
    optimized: bool,
}

impl RangeList4 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inclusive range. Invalidates the optimized state.
    pub fn add(&mut self, begin: u32, end: u32) {
        let (begin, end) = if begin <= end {
            (begin, end)
        } else {
            (end, begin)
        };
        self.ranges.push(Range4::new(begin, end));
        self.optimized = false;
        self.cumulative.clear();
    }

    /// Parse one target spec: CIDR (`10.0.0.0/8`), dashed range
    /// (`10.0.0.1-10.0.0.9`), or a single address.
    pub fn add_spec(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim();
        if let Some((lo, hi)) = spec.split_once('-') {
            let begin: Ipv4Addr = lo.trim().parse()?;
            let end: Ipv4Addr = hi.trim().parse()?;
            if u32::from(begin) > u32::from(end) {
                return Err(Error::InvalidTarget(format!(
                    "range begin after end: {}",
                    spec
                )));
            }
            self.add(u32::from(begin), u32::from(end));
        } else if spec.contains('/') {
            let net: Ipv4Network = spec.parse()?;
            self.add(u32::from(net.network()), u32::from(net.broadcast()));
        } else {
            let ip: Ipv4Addr = spec.parse()?;
            self.add(u32::from(ip), u32::from(ip));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range4] {
        &self.ranges
    }

    /// Sort, coalesce overlapping/adjacent ranges, and build the prefix-sum
    /// table used by `pick`.
    pub fn optimize(&mut self) {
        self.ranges.sort_by_key(|r| r.begin);
        let mut merged: Vec<Range4> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                // adjacent counts as overlapping: [1,2] + [3,4] -> [1,4]
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

    /// Address at position `index` in the optimized list.
    ///
    /// Callers must gate on `count()`; picking from an empty list or past
    /// the end is a program error.
    pub fn pick(&self, index: u64) -> u32 {
        debug_assert!(self.optimized, "pick before optimize");
        debug_assert!(index < self.count(), "pick index out of range");
        let slot = self.cumulative.partition_point(|&c| c <= index);
        let range = &self.ranges[slot];
        let before = if slot == 0 {
            0
        } else {
            self.cumulative[slot - 1]
        };
        range.begin + (index - before) as u32
    }

    /// O(log N) membership test on the optimized list
    pub fn contains(&self, addr: u32) -> bool {
        debug_assert!(self.optimized, "contains before optimize");
        let slot = self.ranges.partition_point(|r| r.end < addr);
        slot < self.ranges.len() && self.ranges[slot].begin <= addr
    }

    /// Remove every address of `exclude` from this list. Both lists must be
    /// optimized; excluding a range wholly outside is a no-op.
    pub fn exclude(&mut self, exclude: &RangeList4) {
        debug_assert!(self.optimized && exclude.optimized);
        let mut result: Vec<Range4> = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let mut begin = r.begin;
            let end = r.end;
            let mut dead = false;
            // exclude ranges overlapping [begin, end]
            let start = exclude.ranges.partition_point(|x| x.end < begin);
            for x in &exclude.ranges[start..] {
                if x.begin > end {
                    break;
                }
                if x.begin > begin {
                    result.push(Range4::new(begin, x.begin - 1));
                }
                if x.end >= end {
                    dead = true;
                    break;
                }
                begin = x.end + 1;
            }
            if !dead {
                result.push(Range4::new(begin, end));
            }
        }
        self.ranges = result;
        self.optimize();
    }

    /// Intersection with another optimized list
    pub fn intersect(&self, other: &RangeList4) -> RangeList4 {
        debug_assert!(self.optimized && other.optimized);
        let mut out = RangeList4::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let begin = a.begin.max(b.begin);
            let end = a.end.min(b.end);
            if begin <= end {
                out.add(begin, end);
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        out.optimize();
        out
    }
}

/// Ordered list of IPv6 ranges. Counts use 128 bits; a bare `2000::/3` is
/// bigger than anything a u64 can hold.
#[derive(Debug, Clone, Default)]
pub struct RangeList6 {
    ranges: Vec<Range6>,
    cumulative: Vec<u128>,
    optimized: bool,
}

impl RangeList6 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, begin: u128, end: u128) {
        let (begin, end) = if begin <= end {
            (begin, end)
        } else {
            (end, begin)
        };
        self.ranges.push(Range6::new(begin, end));
        self.optimized = false;
        self.cumulative.clear();
    }

    pub fn add_spec(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim();
        if let Some((lo, hi)) = spec.split_once('-') {
            let begin: Ipv6Addr = lo.trim().parse()?;
            let end: Ipv6Addr = hi.trim().parse()?;
            if u128::from(begin) > u128::from(end) {
                return Err(Error::InvalidTarget(format!(
                    "range begin after end: {}",
                    spec
                )));
            }
            self.add(u128::from(begin), u128::from(end));
        } else if spec.contains('/') {
            let net: Ipv6Network = spec.parse()?;
            let begin = u128::from(net.network());
            let host_bits = 128 - net.prefix() as u32;
            let end = if host_bits == 128 {
                u128::MAX
            } else {
                begin | ((1u128 << host_bits) - 1)
            };
            self.add(begin, end);
        } else {
            let ip: Ipv6Addr = spec.parse()?;
            self.add(u128::from(ip), u128::from(ip));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range6] {
        &self.ranges
    }

    pub fn optimize(&mut self) {
        self.ranges.sort_by_key(|r| r.begin);
        let mut merged: Vec<Range6> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end != u128::MAX && r.begin <= last.end + 1 => {
                    if r.end > last.end {
                        last.end = r.end;
                    }
                }
                Some(last) if last.end == u128::MAX => {}
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
        self.cumulative = Vec::with_capacity(self.ranges.len());
        let mut total = 0u128;
        for r in &self.ranges {
            total = total.saturating_add(r.count());
            self.cumulative.push(total);
        }
        self.optimized = true;
    }

    pub fn count(&self) -> u128 {
        if self.optimized {
            self.cumulative.last().copied().unwrap_or(0)
        } else {
            self.ranges
                .iter()
                .fold(0u128, |acc, r| acc.saturating_add(r.count()))
        }
    }

    pub fn pick(&self, index: u128) -> u128 {
        debug_assert!(self.optimized, "pick before optimize");
        debug_assert!(index < self.count(), "pick index out of range");
        let slot = self.cumulative.partition_point(|&c| c <= index);
        let range = &self.ranges[slot];
        let before = if slot == 0 {
            0
        } else {
            self.cumulative[slot - 1]
        };
        range.begin + (index - before)
    }

    pub fn contains(&self, addr: u128) -> bool {
        debug_assert!(self.optimized, "contains before optimize");
        let slot = self.ranges.partition_point(|r| r.end < addr);
        slot < self.ranges.len() && self.ranges[slot].begin <= addr
    }

    pub fn exclude(&mut self, exclude: &RangeList6) {
        debug_assert!(self.optimized && exclude.optimized);
        let mut result: Vec<Range6> = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let mut begin = r.begin;
            let end = r.end;
            let mut dead = false;
            let start = exclude.ranges.partition_point(|x| x.end < begin);
            for x in &exclude.ranges[start..] {
                if x.begin > end {
                    break;
                }
                if x.begin > begin {
                    result.push(Range6::new(begin, x.begin - 1));
                }
                if x.end >= end {
                    dead = true;
                    break;
                }
                begin = x.end + 1;
            }
            if !dead {
                result.push(Range6::new(begin, end));
            }
        }
        self.ranges = result;
        self.optimize();
    }

    pub fn intersect(&self, other: &RangeList6) -> RangeList6 {
        debug_assert!(self.optimized && other.optimized);
        let mut out = RangeList6::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let begin = a.begin.max(b.begin);
            let end = a.end.min(b.end);
            if begin <= end {
                out.add(begin, end);
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        out.optimize();
        out
    }
}

/// Parse a mixed v4/v6 target spec into the right list
pub fn add_target_spec(v4: &mut RangeList4, v6: &mut RangeList6, spec: &str) -> Result<()> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::InvalidTarget("empty target spec".to_string()));
    }
    if spec.contains(':') {
        v6.add_spec(spec)
    } else {
        v4.add_spec(spec)
    }
}

/// Convenience for tests and pickers that want an [`Address`]
pub fn pick_v4(list: &RangeList4, index: u64) -> Address {
    Address::from_v4_u32(list.pick(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list4(specs: &[&str]) -> RangeList4 {
        let mut list = RangeList4::new();
        for s in specs {
            list.add_spec(s).unwrap();
        }
        list.optimize();
        list
    }

    fn list6(specs: &[&str]) -> RangeList6 {
        let mut list = RangeList6::new();
        for s in specs {
            list.add_spec(s).unwrap();
        }
        list.optimize();
        list
    }

    #[test]
    fn test_optimize_coalesces_overlaps() {
        let list = list4(&["10.0.0.0-10.0.0.10", "10.0.0.5-10.0.0.20", "10.0.0.21"]);
        assert_eq!(list.ranges().len(), 1);
        assert_eq!(list.count(), 22);
    }

    #[test]
    fn test_optimize_preserves_count_of_disjoint_input() {
        let mut raw = RangeList4::new();
        raw.add_spec("192.0.2.0/28").unwrap();
        raw.add_spec("198.51.100.0/30").unwrap();
        let before = raw.count();
        raw.optimize();
        assert_eq!(raw.count(), before);
        assert_eq!(raw.count(), 16 + 4);
    }

    #[test]
    fn test_pick_is_bijective_over_subranges() {
        let list = list4(&["10.0.0.0/30", "10.0.1.0/30"]);
        let picked: Vec<u32> = (0..list.count()).map(|i| list.pick(i)).collect();
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), picked.len());
        assert_eq!(picked[0], u32::from("10.0.0.0".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(picked[4], u32::from("10.0.1.0".parse::<Ipv4Addr>().unwrap()));
    }

    #[test]
    fn test_contains() {
        let list = list4(&["192.0.2.0/28", "198.51.100.0/30"]);
        assert!(list.contains(u32::from("192.0.2.5".parse::<Ipv4Addr>().unwrap())));
        assert!(!list.contains(u32::from("192.0.2.16".parse::<Ipv4Addr>().unwrap())));
        assert!(list.contains(u32::from("198.51.100.3".parse::<Ipv4Addr>().unwrap())));
    }

    #[test]
    fn test_exclude_splits_ranges() {
        let mut list = list4(&["10.0.0.0-10.0.0.15"]);
        let excl = list4(&["10.0.0.4-10.0.0.7"]);
        list.exclude(&excl);
        assert_eq!(list.count(), 12);
        assert!(!list.contains(u32::from("10.0.0.5".parse::<Ipv4Addr>().unwrap())));
        assert!(list.contains(u32::from("10.0.0.3".parse::<Ipv4Addr>().unwrap())));
        assert!(list.contains(u32::from("10.0.0.8".parse::<Ipv4Addr>().unwrap())));
    }

    #[test]
    fn test_exclude_outside_is_noop() {
        let mut list = list4(&["10.0.0.0/24"]);
        let excl = list4(&["172.16.0.0/24"]);
        let before = list.count();
        list.exclude(&excl);
        assert_eq!(list.count(), before);
    }

    #[test]
    fn test_exclude_count_algebra() {
        // count(S - E) + count(S intersect E) == count(S)
        let s = list4(&["10.0.0.0/24", "192.0.2.0/26", "198.51.100.7"]);
        let e = list4(&["10.0.0.128/25", "192.0.2.32-192.0.2.200", "203.0.113.0/24"]);
        let total = s.count();
        let inter = s.intersect(&e).count();
        let mut sub = s.clone();
        sub.exclude(&e);
        assert_eq!(sub.count() + inter, total);
    }

    #[test]
    fn test_v6_count_is_128_bit() {
        let list = list6(&["2001:db8::/64"]);
        assert_eq!(list.count(), 1u128 << 64);
    }

    #[test]
    fn test_v6_pick_and_exclude() {
        let mut list = list6(&["2001:db8::-2001:db8::f"]);
        assert_eq!(list.count(), 16);
        let picked = list.pick(3);
        assert_eq!(picked, u128::from("2001:db8::3".parse::<Ipv6Addr>().unwrap()));

        let excl = list6(&["2001:db8::8/125"]);
        list.exclude(&excl);
        assert_eq!(list.count(), 8);
        assert!(!list.contains(u128::from("2001:db8::9".parse::<Ipv6Addr>().unwrap())));
    }

    #[test]
    fn test_v6_exclude_count_algebra() {
        let s = list6(&["2001:db8::/120", "2001:db8:1::-2001:db8:1::ff"]);
        let e = list6(&["2001:db8::80/121", "2001:db8:1::10-2001:db8:1::2f"]);
        let total = s.count();
        let inter = s.intersect(&e).count();
        let mut sub = s.clone();
        sub.exclude(&e);
        assert_eq!(sub.count() + inter, total);
    }

    #[test]
    fn test_mixed_spec_routing() {
        let mut v4 = RangeList4::new();
        let mut v6 = RangeList6::new();
        add_target_spec(&mut v4, &mut v6, "198.51.100.0/30").unwrap();
        add_target_spec(&mut v4, &mut v6, "2001:db8::/126").unwrap();
        v4.optimize();
        v6.optimize();
        assert_eq!(v4.count(), 4);
        assert_eq!(v6.count(), 4);
    }

    #[test]
    fn test_bad_specs_rejected() {
        let mut v4 = RangeList4::new();
        assert!(v4.add_spec("10.0.0.9-10.0.0.1").is_err());
        assert!(v4.add_spec("999.0.0.1").is_err());
        let mut v6 = RangeList6::new();
        assert!(v6.add_spec("2001:db8::ff-2001:db8::1").is_err());
    }
}
