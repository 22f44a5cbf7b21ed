//! Packet stack: pktbuf pool + sidecar transmit queue + source identity
//!
//! Handlers never touch the NIC. When a scan module wants to answer a
//! reply (RST teardown, ACK with probe payload, follow-up SYN), it borrows
//! a buffer from the pool, fills it, and pushes it onto the sidecar ring;
//! the tx threads drain the ring between their own batches and return the
//! buffer to the pool. Both rings are MPMC and sized from
//! `stack_buf_count`.
//!
//! Sidecar overflow means response traffic outruns the transmit side — a
//! sizing misconfiguration, reported as fatal backpressure rather than a
//! silent drop.

use crate::pktbuf::PktBuf;
use crate::ring::Ring;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use strobe_core::{Address, Error, Result, SourcePorts};

/// Our transmit-side identity, used to label received frames
#[derive(Debug, Clone)]
pub struct SourceIdentity {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ports: SourcePorts,
}

impl SourceIdentity {
    pub fn is_my_ip(&self, addr: Address) -> bool {
        match addr {
            Address::V4(ip) => self.ipv4 == Some(ip),
            Address::V6(ip) => self.ipv6 == Some(ip),
        }
    }

    pub fn is_my_port(&self, port: u16) -> bool {
        self.ports.contains(port)
    }

    /// Source address for the given target family
    pub fn source_for(&self, them: Address) -> Option<Address> {
        match them {
            Address::V4(_) => self.ipv4.map(Address::V4),
            Address::V6(_) => self.ipv6.map(Address::V6),
        }
    }
}

#[derive(Debug)]
pub struct PacketStack {
    pool: Ring<PktBuf>,
    transmit: Ring<PktBuf>,
    overflow: AtomicBool,
    pub src: SourceIdentity,
}

impl PacketStack {
    pub fn new(src: SourceIdentity, buf_count: usize) -> Self {
        let pool = Ring::new(buf_count);
        for _ in 0..buf_count {
            // freshly created ring always has room
            let _ = pool.push(PktBuf::new());
        }
        Self {
            pool,
            transmit: Ring::new(buf_count),
            overflow: AtomicBool::new(false),
            src,
        }
    }

    /// Borrow a buffer from the pool. An exhausted pool means every buffer
    /// is queued for transmit, which is the same backpressure condition as
    /// a full sidecar.
    pub fn get_pktbuf(&self) -> Result<PktBuf> {
        self.pool.pop().ok_or_else(|| {
            self.overflow.store(true, Ordering::Release);
            Error::Backpressure("pktbuf pool exhausted; raise --stack-buf-count".to_string())
        })
    }

    /// Queue a filled buffer for transmission by the tx threads
    pub fn transmit_pktbuf(&self, buf: PktBuf) -> Result<()> {
        self.transmit.push(buf).map_err(|_| {
            self.overflow.store(true, Ordering::Release);
            Error::Backpressure(
                "sidecar transmit queue overflow; raise --stack-buf-count".to_string(),
            )
        })
    }

    /// Whether any producer ever hit a full ring; the engine treats this
    /// as a sizing misconfiguration and aborts the scan
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Next queued response packet, drained by tx threads
    pub fn pop_transmit(&self) -> Option<PktBuf> {
        self.transmit.pop()
    }

    /// Return a transmitted buffer to the pool
    pub fn release(&self, mut buf: PktBuf) {
        buf.clear();
        // pool can never overflow: every buffer originated there
        let _ = self.pool.push(buf);
    }

    pub fn transmit_percent_free(&self) -> f64 {
        self.transmit.percent_free()
    }

    pub fn has_queued(&self) -> bool {
        !self.transmit.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SourceIdentity {
        SourceIdentity {
            ipv4: Some("10.0.0.1".parse().unwrap()),
            ipv6: Some("2001:db8::100".parse().unwrap()),
            ports: SourcePorts {
                start: 40_000,
                count: 256,
            },
        }
    }

    #[test]
    fn test_borrow_transmit_release_cycle() {
        let stack = PacketStack::new(identity(), 4);
        let mut buf = stack.get_pktbuf().unwrap();
        buf.buf_mut()[0] = 0xAB;
        buf.set_len(1);
        stack.transmit_pktbuf(buf).unwrap();
        assert!(stack.has_queued());

        let sent = stack.pop_transmit().unwrap();
        assert_eq!(sent.frame(), &[0xAB]);
        stack.release(sent);
        assert!(!stack.has_queued());

        // all four buffers available again
        let bufs: Vec<_> = (0..4).map(|_| stack.get_pktbuf().unwrap()).collect();
        assert!(stack.get_pktbuf().is_err());
        drop(bufs);
    }

    #[test]
    fn test_pool_exhaustion_is_backpressure() {
        let stack = PacketStack::new(identity(), 2);
        let _a = stack.get_pktbuf().unwrap();
        let _b = stack.get_pktbuf().unwrap();
        match stack.get_pktbuf() {
            Err(Error::Backpressure(_)) => {}
            other => panic!("expected backpressure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_identity_matching() {
        let src = identity();
        assert!(src.is_my_ip("10.0.0.1".parse::<Ipv4Addr>().unwrap().into()));
        assert!(!src.is_my_ip("10.0.0.2".parse::<Ipv4Addr>().unwrap().into()));
        assert!(src.is_my_ip("2001:db8::100".parse::<Ipv6Addr>().unwrap().into()));
        assert!(src.is_my_port(40_000));
        assert!(src.is_my_port(40_255));
        assert!(!src.is_my_port(40_256));
        assert!(!src.is_my_port(39_999));
    }

    #[test]
    fn test_transmit_queue_percent_free() {
        let stack = PacketStack::new(identity(), 4);
        assert_eq!(stack.transmit_percent_free(), 100.0);
        let buf = stack.get_pktbuf().unwrap();
        stack.transmit_pktbuf(buf).unwrap();
        assert_eq!(stack.transmit_percent_free(), 75.0);
    }
}
