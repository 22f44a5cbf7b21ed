//! Duplicate-response filter
//!
//! A stateless scanner has no connection table, so a target that answers
//! twice would be reported twice. Instead of remembering every response we
//! keep a small associative cache of recent observations: `2^k` buckets of
//! four entries each, one array for IPv4 and one for IPv6. A hit moves the
//! entry to the bucket front so repeat offenders stay resident; a miss
//! shifts the bucket right and inserts at the front, aging out the oldest
//! slot.
//!
//! The bucket size is fixed at 4 and tuned together with the default
//! window; change one and the other needs re-tuning.
//!
//! Keys are the full 5-tuple plus a per-module `type` discriminator so
//! different observation kinds (port openness vs. banner) never collide.
//! There is no lock: the dispatcher hashes `(ip_them, port_them)` onto one
//! handler, and each handler owns the buckets its keys hash into.

use strobe_core::Address;

const BUCKET_SIZE: usize = 4;

const FNV1A_SEED: u32 = 0x811C_9DC5;
const FNV1A_PRIME: u32 = 0x0100_0193;

#[inline]
fn fnv1a_byte(byte: u8, hash: u32) -> u32 {
    (byte as u32 ^ hash).wrapping_mul(FNV1A_PRIME)
}

#[inline]
fn fnv1a_u16(value: u16, hash: u32) -> u32 {
    let hash = fnv1a_byte(value as u8, hash);
    fnv1a_byte((value >> 8) as u8, hash)
}

#[inline]
fn fnv1a_u32(value: u32, hash: u32) -> u32 {
    let mut hash = hash;
    for shift in (0..32).step_by(8) {
        hash = fnv1a_byte((value >> shift) as u8, hash);
    }
    hash
}

#[inline]
fn fnv1a_u64(value: u64, hash: u32) -> u32 {
    let mut hash = hash;
    for shift in (0..64).step_by(8) {
        hash = fnv1a_byte((value >> shift) as u8, hash);
    }
    hash
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry4 {
    ip_them: u32,
    port_them: u16,
    ip_me: u32,
    port_me: u16,
    dedup_type: u32,
    used: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry6 {
    ip_them: u128,
    ip_me: u128,
    port_them: u16,
    port_me: u16,
    dedup_type: u32,
    used: bool,
}

/// Bounded cache of recent observations
#[derive(Debug)]
pub struct DedupTable {
    buckets4: Vec<[Entry4; BUCKET_SIZE]>,
    buckets6: Vec<[Entry6; BUCKET_SIZE]>,
    mask: usize,
}

impl DedupTable {
    /// `dedup_win` is the approximate total entry count; it is rounded so
    /// the bucket count is a power of two.
    pub fn new(dedup_win: usize) -> Self {
        let buckets = (dedup_win / BUCKET_SIZE).max(1).next_power_of_two();
        Self {
            buckets4: vec![[Entry4::default(); BUCKET_SIZE]; buckets],
            buckets6: vec![[Entry6::default(); BUCKET_SIZE]; buckets],
            mask: buckets - 1,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.mask + 1
    }

    /// Test-and-insert. Returns `true` when the key was already resident.
    pub fn is_duplicate(
        &mut self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        dedup_type: u32,
    ) -> bool {
        match (ip_them, ip_me) {
            (Address::V4(them), Address::V4(me)) => self.is_duplicate_v4(
                u32::from(them),
                port_them,
                u32::from(me),
                port_me,
                dedup_type,
            ),
            (Address::V6(them), Address::V6(me)) => self.is_duplicate_v6(
                u128::from(them),
                port_them,
                u128::from(me),
                port_me,
                dedup_type,
            ),
            // mixed families never belong to the same observation
            _ => false,
        }
    }

    fn is_duplicate_v4(
        &mut self,
        ip_them: u32,
        port_them: u16,
        ip_me: u32,
        port_me: u16,
        dedup_type: u32,
    ) -> bool {
        let mut hash = FNV1A_SEED;
        hash = fnv1a_u32(ip_them, hash);
        hash = fnv1a_u16(port_them, hash);
        hash = fnv1a_u32(ip_me, hash);
        hash = fnv1a_u16(port_me, hash);
        hash = fnv1a_u32(dedup_type, hash);
        let bucket = &mut self.buckets4[hash as usize & self.mask];

        for i in 0..BUCKET_SIZE {
            let e = bucket[i];
            if e.used
                && e.ip_them == ip_them
                && e.port_them == port_them
                && e.ip_me == ip_me
                && e.port_me == port_me
                && e.dedup_type == dedup_type
            {
                // move to front so constant repeats do not age out
                if i > 0 {
                    bucket.swap(0, i);
                }
                return true;
            }
        }

        bucket.copy_within(0..BUCKET_SIZE - 1, 1);
        bucket[0] = Entry4 {
            ip_them,
            port_them,
            ip_me,
            port_me,
            dedup_type,
            used: true,
        };
        false
    }

    fn is_duplicate_v6(
        &mut self,
        ip_them: u128,
        port_them: u16,
        ip_me: u128,
        port_me: u16,
        dedup_type: u32,
    ) -> bool {
        let mut hash = FNV1A_SEED;
        hash = fnv1a_u64((ip_them >> 64) as u64, hash);
        hash = fnv1a_u64(ip_them as u64, hash);
        hash = fnv1a_u16(port_them, hash);
        hash = fnv1a_u64((ip_me >> 64) as u64, hash);
        hash = fnv1a_u64(ip_me as u64, hash);
        hash = fnv1a_u16(port_me, hash);
        hash = fnv1a_u32(dedup_type, hash);
        let bucket = &mut self.buckets6[hash as usize & self.mask];

        for i in 0..BUCKET_SIZE {
            let e = bucket[i];
            if e.used
                && e.ip_them == ip_them
                && e.port_them == port_them
                && e.ip_me == ip_me
                && e.port_me == port_me
                && e.dedup_type == dedup_type
            {
                if i > 0 {
                    bucket.swap(0, i);
                }
                return true;
            }
        }

        bucket.copy_within(0..BUCKET_SIZE - 1, 1);
        bucket[0] = Entry6 {
            ip_them,
            ip_me,
            port_them,
            port_me,
            dedup_type,
            used: true,
        };
        false
    }
}
