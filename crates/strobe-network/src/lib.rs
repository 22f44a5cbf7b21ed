//! StrobeScan Network Library
//!
//! Packet-level plumbing for the scan engine: prebuilt templates with
//! partial checksums, the frame preprocessor, lock-free rings, the pktbuf
//! pool and sidecar transmit stack, the datalink seam, and the optional
//! pcap sink. Everything here is family-aware (IPv4/IPv6) and free of
//! per-target state.

pub mod checksum;
pub mod datalink;
pub mod parse;
pub mod pcap;
pub mod pktbuf;
pub mod ring;
pub mod stack;
pub mod templ;

pub use datalink::{channel_link, combine_bpf, parse_mac, ChannelLink, ChannelPeer, Datalink, LinkType, NullLink};
pub use parse::{preprocess_frame, tcp_get_mss, Found, IcmpOriginal, ParsedFrame};
pub use pcap::PcapSink;
pub use pktbuf::{PktBuf, PKT_BUF_SIZE};
pub use ring::Ring;
pub use stack::{PacketStack, SourceIdentity};
pub use templ::{tcp_flags, TcpSynOptions, TemplParams, TemplateSet};
