//! Datalink seam
//!
//! Real raw-socket / libpcap plumbing lives outside this codebase; the
//! engine only needs a frame-in / frame-out contract. `Datalink` is that
//! contract: blocking send, receive with a short timeout so the rx loop
//! can poll its shutdown flag, a link type for the parser and templates,
//! and a BPF installation hook. Tests and offline mode plug in the
//! in-memory implementations below.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use pnet::util::MacAddr;
use std::time::Duration;
use strobe_core::{Error, Result};

/// Framing of the capture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Frames start at the IP header
    Raw,
    /// BSD loopback: 4-byte host-order address family before the IP header
    Null,
}

/// Frame-level send/receive contract
pub trait Datalink: Send + Sync {
    fn link_type(&self) -> LinkType;

    /// Send one frame; blocks when the driver backpressures. Errors are
    /// transient: log, drop, continue.
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Receive one frame into `buf`; `None` on timeout. The timeout bounds
    /// how long the rx thread is deaf to its shutdown flag.
    fn recv_frame(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;

    /// Install a BPF filter; default is a no-op for handles that cannot
    /// filter
    fn set_filter(&self, _filter: &str) -> Result<()> {
        Ok(())
    }
}

/// AND-combine the scan module's filter hint with a user filter
pub fn combine_bpf(module_hint: &str, user: Option<&str>) -> String {
    match user {
        Some(user) if !user.trim().is_empty() => {
            format!("({}) and ({})", module_hint, user.trim())
        }
        _ => module_hint.to_string(),
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` into raw bytes
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mac: MacAddr = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid MAC address: {}", s)))?;
    Ok([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5])
}

/// In-memory datalink backed by channels; the peer side injects frames
/// into the scanner and observes what the scanner sends.
pub struct ChannelLink {
    outgoing: Sender<Vec<u8>>,
    incoming: Receiver<Vec<u8>>,
    link_type: LinkType,
}

/// The far end of a [`ChannelLink`], held by tests acting as the network
pub struct ChannelPeer {
    /// Frames the scanner transmitted
    pub sent: Receiver<Vec<u8>>,
    /// Inject a frame for the scanner to receive
    pub inject: Sender<Vec<u8>>,
}

/// Create a connected link/peer pair
pub fn channel_link(link_type: LinkType) -> (ChannelLink, ChannelPeer) {
    let (out_tx, out_rx) = bounded(65_536);
    let (in_tx, in_rx) = bounded(65_536);
    (
        ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
            link_type,
        },
        ChannelPeer {
            sent: out_rx,
            inject: in_tx,
        },
    )
}

impl Datalink for ChannelLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.outgoing
            .send(frame.to_vec())
            .map_err(|_| Error::Transmit("link peer closed".to_string()))
    }

    fn recv_frame(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        match self.incoming.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// Swallows every send and never receives; offline throughput mode
#[derive(Debug, Default)]
pub struct NullLink {
    link_type: LinkType,
}

impl Default for LinkType {
    fn default() -> Self {
        LinkType::Ethernet
    }
}

impl NullLink {
    pub fn new(link_type: LinkType) -> Self {
        Self { link_type }
    }
}

impl Datalink for NullLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn send_frame(&self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    fn recv_frame(&self, _buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_link_round_trip() {
        let (link, peer) = channel_link(LinkType::Ethernet);
        link.send_frame(&[1, 2, 3]).unwrap();
        assert_eq!(peer.sent.recv().unwrap(), vec![1, 2, 3]);

        peer.inject.send(vec![9, 8, 7]).unwrap();
        let mut buf = [0u8; 16];
        let len = link
            .recv_frame(&mut buf, Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[9, 8, 7]);
    }

    #[test]
    fn test_channel_link_timeout() {
        let (link, _peer) = channel_link(LinkType::Ethernet);
        let mut buf = [0u8; 16];
        let got = link.recv_frame(&mut buf, Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_null_link_swallows() {
        let link = NullLink::new(LinkType::Ethernet);
        link.send_frame(&[0; 64]).unwrap();
        let mut buf = [0u8; 16];
        assert!(link
            .recv_frame(&mut buf, Duration::from_millis(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_combine_bpf() {
        assert_eq!(combine_bpf("tcp", None), "tcp");
        assert_eq!(combine_bpf("tcp", Some("")), "tcp");
        assert_eq!(
            combine_bpf("tcp", Some("src net 10.0.0.0/8")),
            "(tcp) and (src net 10.0.0.0/8)"
        );
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:00:00:aa:bb:cc").unwrap(),
            [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC]
        );
        assert!(parse_mac("nonsense").is_err());
    }
}
