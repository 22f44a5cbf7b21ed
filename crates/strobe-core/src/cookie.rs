//! Recognition cookies
//!
//! The scanner keeps no per-target state, so every probe carries a keyed
//! hash of its own 4-tuple: the TCP sequence number, the ICMP id/seq pair,
//! a DNS transaction id. When a reply arrives, recomputing the hash from
//! the reply's (inverted) tuple tells us whether the reply belongs to this
//! scan run. SipHash-2-4 keeps the cookie unforgeable enough that random
//! Internet backscatter does not validate.

use crate::addr::Address;

/// SipHash-2-4 over a slice of 64-bit words.
///
/// Word-based rather than byte-based because everything we hash (addresses,
/// ports, seed) is already in registers.
fn siphash24_words(data: &[u64], key: &[u64; 2]) -> u64 {
    let mut v0 = key[0] ^ 0x736f_6d65_7073_6575;
    let mut v1 = key[1] ^ 0x646f_7261_6e64_6f6d;
    let mut v2 = key[0] ^ 0x6c79_6765_6e65_7261;
    let mut v3 = key[1] ^ 0x7465_6462_7974_6573;

    #[inline(always)]
    fn round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
        *v0 = v0.wrapping_add(*v1);
        *v1 = v1.rotate_left(13);
        *v1 ^= *v0;
        *v0 = v0.rotate_left(32);

        *v2 = v2.wrapping_add(*v3);
        *v3 = v3.rotate_left(16);
        *v3 ^= *v2;

        *v0 = v0.wrapping_add(*v3);
        *v3 = v3.rotate_left(21);
        *v3 ^= *v0;

        *v2 = v2.wrapping_add(*v1);
        *v1 = v1.rotate_left(17);
        *v1 ^= *v2;
        *v2 = v2.rotate_left(32);
    }

    for &m in data {
        v3 ^= m;
        round(&mut v0, &mut v1, &mut v2, &mut v3);
        round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    // length block: word count in the top byte
    let last = (data.len() as u64 * 8 & 0xff) << 56;
    v3 ^= last;
    round(&mut v0, &mut v1, &mut v2, &mut v3);
    round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= last;

    v2 ^= 0xff;
    for _ in 0..4 {
        round(&mut v0, &mut v1, &mut v2, &mut v3);
    }

    v0 ^ v1 ^ v2 ^ v3
}

fn addr_words(addr: Address) -> (u64, u64) {
    match addr {
        Address::V4(ip) => (u32::from(ip) as u64, 0),
        Address::V6(ip) => {
            let v = u128::from(ip);
            ((v >> 64) as u64, v as u64)
        }
    }
}

/// Keyed hash of `(ip_them, port_them, ip_me, port_me, seed)` folded to 32
/// bits. Depends on all five inputs; stable across calls.
pub fn get_cookie(
    ip_them: Address,
    port_them: u16,
    ip_me: Address,
    port_me: u16,
    seed: u64,
) -> u32 {
    let (them_hi, them_lo) = addr_words(ip_them);
    let (me_hi, me_lo) = addr_words(ip_me);
    let data = [
        them_hi,
        them_lo,
        me_hi,
        me_lo,
        (port_them as u64) << 16 | port_me as u64,
    ];
    let key = [seed, seed.rotate_left(32) ^ 0x5bf0_3635_d1d6_37cf];
    let hash = siphash24_words(&data, &key);
    (hash ^ (hash >> 32)) as u32
}

/// A seed from system entropy, for `--seed 0`
pub fn entropy() -> u64 {
    let mut seed: u64 = rand::random();
    if seed == 0 {
        seed = 1;
    }
    seed
}
