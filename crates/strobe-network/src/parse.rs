//! Frame preprocessing
//!
//! The receive thread turns every captured frame into a [`ParsedFrame`]:
//! offsets into the original buffer plus small copies of the fields the
//! scan modules key on (addresses, ports, TCP flags and numbers, ICMP
//! type/code, the embedded tuple of ICMP errors). Malformed or truncated
//! frames parse to `None` and are dropped silently; the engine keeps a
//! debug counter, nothing else.

use crate::datalink::LinkType;
use std::net::{Ipv4Addr, Ipv6Addr};
use strobe_core::{Address, IpProto};

/// Transport recognized in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Tcp,
    Udp,
    Sctp,
    Icmp,
    Arp,
}

/// Original (inner) tuple carried by an ICMP error message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpOriginal {
    pub ip_proto: IpProto,
    pub src_ip: Address,
    pub dst_ip: Address,
    pub port_src: u16,
    pub port_dst: u16,
}

/// Parsed view of one received frame
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub found: Found,
    pub ip_proto: IpProto,
    pub src_ip: Address,
    pub dst_ip: Address,
    pub port_src: u16,
    pub port_dst: u16,
    pub transport_offset: usize,
    pub app_offset: usize,
    pub app_length: usize,
    pub ip_ttl: u8,
    pub ip_v4_id: u16,
    pub tcp_flags: u8,
    pub tcp_seqno: u32,
    pub tcp_ackno: u32,
    pub tcp_win: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub icmp_id: u16,
    pub icmp_seq: u16,
    pub icmp_original: Option<IcmpOriginal>,
    pub arp_opcode: u16,
    pub arp_sender_mac: [u8; 6],
}

impl ParsedFrame {
    fn blank(found: Found) -> Self {
        Self {
            found,
            ip_proto: IpProto::Other,
            src_ip: Address::zero_v4(),
            dst_ip: Address::zero_v4(),
            port_src: 0,
            port_dst: 0,
            transport_offset: 0,
            app_offset: 0,
            app_length: 0,
            ip_ttl: 0,
            ip_v4_id: 0,
            tcp_flags: 0,
            tcp_seqno: 0,
            tcp_ackno: 0,
            tcp_win: 0,
            icmp_type: 0,
            icmp_code: 0,
            icmp_id: 0,
            icmp_seq: 0,
            icmp_original: None,
            arp_opcode: 0,
            arp_sender_mac: [0; 6],
        }
    }

    pub fn has_tcp_flag(&self, mask: u8) -> bool {
        self.tcp_flags & mask == mask
    }
}

fn be16(frame: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *frame.get(offset)?,
        *frame.get(offset + 1)?,
    ]))
}

fn be32(frame: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *frame.get(offset)?,
        *frame.get(offset + 1)?,
        *frame.get(offset + 2)?,
        *frame.get(offset + 3)?,
    ]))
}

/// Preprocess a frame captured on the given datalink
pub fn preprocess_frame(frame: &[u8], link: LinkType) -> Option<ParsedFrame> {
    match link {
        LinkType::Ethernet => {
            let mut ethertype = be16(frame, 12)?;
            let mut net_offset = 14;
            // one 802.1Q shim
            if ethertype == 0x8100 {
                ethertype = be16(frame, 16)?;
                net_offset = 18;
            }
            match ethertype {
                0x0800 => parse_ipv4(frame, net_offset),
                0x86DD => parse_ipv6(frame, net_offset),
                0x0806 => parse_arp(frame, net_offset),
                _ => None,
            }
        }
        LinkType::Raw => match frame.first()? >> 4 {
            4 => parse_ipv4(frame, 0),
            6 => parse_ipv6(frame, 0),
            _ => None,
        },
        LinkType::Null => {
            let family = u32::from_le_bytes([
                *frame.first()?,
                *frame.get(1)?,
                *frame.get(2)?,
                *frame.get(3)?,
            ]);
            match family {
                2 => parse_ipv4(frame, 4),
                10 | 24 | 28 | 30 => parse_ipv6(frame, 4),
                _ => None,
            }
        }
    }
}

fn parse_ipv4(frame: &[u8], offset: usize) -> Option<ParsedFrame> {
    let b0 = *frame.get(offset)?;
    if b0 >> 4 != 4 {
        return None;
    }
    let ihl = ((b0 & 0x0F) as usize) * 4;
    if ihl < 20 || frame.len() < offset + ihl {
        return None;
    }
    let total_len = be16(frame, offset + 2)? as usize;
    if total_len < ihl || frame.len() < offset + total_len {
        return None;
    }
    let proto = frame[offset + 9];
    let src = Address::V4(Ipv4Addr::new(
        frame[offset + 12],
        frame[offset + 13],
        frame[offset + 14],
        frame[offset + 15],
    ));
    let dst = Address::V4(Ipv4Addr::new(
        frame[offset + 16],
        frame[offset + 17],
        frame[offset + 18],
        frame[offset + 19],
    ));

    let transport_offset = offset + ihl;
    let transport_len = total_len - ihl;
    let mut parsed = parse_transport(frame, transport_offset, transport_len, proto, false)?;
    parsed.src_ip = src;
    parsed.dst_ip = dst;
    parsed.ip_ttl = frame[offset + 8];
    parsed.ip_v4_id = be16(frame, offset + 4)?;
    Some(parsed)
}

fn parse_ipv6(frame: &[u8], offset: usize) -> Option<ParsedFrame> {
    let b0 = *frame.get(offset)?;
    if b0 >> 4 != 6 {
        return None;
    }
    if frame.len() < offset + 40 {
        return None;
    }
    let payload_len = be16(frame, offset + 4)? as usize;
    if frame.len() < offset + 40 + payload_len {
        return None;
    }
    let next_header = frame[offset + 6];
    let mut src = [0u8; 16];
    src.copy_from_slice(&frame[offset + 8..offset + 24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&frame[offset + 24..offset + 40]);

    // extension headers are rare on scan replies; only the no-op chain
    // walkers matter here
    let mut proto = next_header;
    let mut transport_offset = offset + 40;
    let mut remaining = payload_len;
    loop {
        match proto {
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                if frame.len() < transport_offset + 8 {
                    return None;
                }
                let ext_len = (frame[transport_offset + 1] as usize + 1) * 8;
                if remaining < ext_len {
                    return None;
                }
                proto = frame[transport_offset];
                transport_offset += ext_len;
                remaining -= ext_len;
            }
            _ => break,
        }
    }

    let mut parsed = parse_transport(frame, transport_offset, remaining, proto, true)?;
    parsed.src_ip = Address::V6(Ipv6Addr::from(src));
    parsed.dst_ip = Address::V6(Ipv6Addr::from(dst));
    parsed.ip_ttl = frame[offset + 7];
    Some(parsed)
}

fn parse_transport(
    frame: &[u8],
    offset: usize,
    len: usize,
    proto: u8,
    v6: bool,
) -> Option<ParsedFrame> {
    match proto {
        6 => parse_tcp(frame, offset, len),
        17 => parse_udp(frame, offset, len),
        132 => parse_sctp(frame, offset, len),
        1 if !v6 => parse_icmp(frame, offset, len, false),
        58 if v6 => parse_icmp(frame, offset, len, true),
        _ => None,
    }
}

fn parse_tcp(frame: &[u8], offset: usize, len: usize) -> Option<ParsedFrame> {
    if len < 20 {
        return None;
    }
    let doff = ((*frame.get(offset + 12)? >> 4) as usize) * 4;
    if doff < 20 || len < doff {
        return None;
    }
    let mut parsed = ParsedFrame::blank(Found::Tcp);
    parsed.ip_proto = IpProto::Tcp;
    parsed.port_src = be16(frame, offset)?;
    parsed.port_dst = be16(frame, offset + 2)?;
    parsed.tcp_seqno = be32(frame, offset + 4)?;
    parsed.tcp_ackno = be32(frame, offset + 8)?;
    parsed.tcp_flags = frame[offset + 13] & 0x3F;
    parsed.tcp_win = be16(frame, offset + 14)?;
    parsed.transport_offset = offset;
    parsed.app_offset = offset + doff;
    parsed.app_length = len - doff;
    Some(parsed)
}

fn parse_udp(frame: &[u8], offset: usize, len: usize) -> Option<ParsedFrame> {
    if len < 8 {
        return None;
    }
    let udp_len = be16(frame, offset + 4)? as usize;
    if udp_len < 8 || udp_len > len {
        return None;
    }
    let mut parsed = ParsedFrame::blank(Found::Udp);
    parsed.ip_proto = IpProto::Udp;
    parsed.port_src = be16(frame, offset)?;
    parsed.port_dst = be16(frame, offset + 2)?;
    parsed.transport_offset = offset;
    parsed.app_offset = offset + 8;
    parsed.app_length = udp_len - 8;
    Some(parsed)
}

fn parse_sctp(frame: &[u8], offset: usize, len: usize) -> Option<ParsedFrame> {
    if len < 12 {
        return None;
    }
    let mut parsed = ParsedFrame::blank(Found::Sctp);
    parsed.ip_proto = IpProto::Sctp;
    parsed.port_src = be16(frame, offset)?;
    parsed.port_dst = be16(frame, offset + 2)?;
    parsed.transport_offset = offset;
    parsed.app_offset = offset + 12;
    parsed.app_length = len - 12;
    Some(parsed)
}

fn parse_icmp(frame: &[u8], offset: usize, len: usize, v6: bool) -> Option<ParsedFrame> {
    if len < 8 {
        return None;
    }
    let mut parsed = ParsedFrame::blank(Found::Icmp);
    parsed.ip_proto = IpProto::Other;
    parsed.transport_offset = offset;
    parsed.icmp_type = frame[offset];
    parsed.icmp_code = frame[offset + 1];
    parsed.icmp_id = be16(frame, offset + 4)?;
    parsed.icmp_seq = be16(frame, offset + 6)?;
    parsed.app_offset = offset + 8;
    parsed.app_length = len - 8;

    // destination-unreachable family quotes the offending packet; recover
    // its tuple so UDP scans can classify port-unreachable
    let is_error = if v6 {
        parsed.icmp_type == 1
    } else {
        matches!(parsed.icmp_type, 3 | 11)
    };
    if is_error {
        parsed.icmp_original = parse_icmp_original(frame, offset + 8, v6);
    }
    Some(parsed)
}

fn parse_icmp_original(frame: &[u8], offset: usize, v6: bool) -> Option<IcmpOriginal> {
    if v6 {
        if frame.len() < offset + 48 {
            return None;
        }
        let proto = frame[offset + 6];
        let mut src = [0u8; 16];
        src.copy_from_slice(&frame[offset + 8..offset + 24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&frame[offset + 24..offset + 40]);
        let tp = offset + 40;
        Some(IcmpOriginal {
            ip_proto: proto_of(proto)?,
            src_ip: Address::V6(Ipv6Addr::from(src)),
            dst_ip: Address::V6(Ipv6Addr::from(dst)),
            port_src: be16(frame, tp)?,
            port_dst: be16(frame, tp + 2)?,
        })
    } else {
        let b0 = *frame.get(offset)?;
        if b0 >> 4 != 4 {
            return None;
        }
        let ihl = ((b0 & 0x0F) as usize) * 4;
        if frame.len() < offset + ihl + 4 {
            return None;
        }
        let proto = frame[offset + 9];
        let src = Address::V4(Ipv4Addr::new(
            frame[offset + 12],
            frame[offset + 13],
            frame[offset + 14],
            frame[offset + 15],
        ));
        let dst = Address::V4(Ipv4Addr::new(
            frame[offset + 16],
            frame[offset + 17],
            frame[offset + 18],
            frame[offset + 19],
        ));
        let tp = offset + ihl;
        Some(IcmpOriginal {
            ip_proto: proto_of(proto)?,
            src_ip: src,
            dst_ip: dst,
            port_src: be16(frame, tp)?,
            port_dst: be16(frame, tp + 2)?,
        })
    }
}

fn proto_of(number: u8) -> Option<IpProto> {
    match number {
        6 => Some(IpProto::Tcp),
        17 => Some(IpProto::Udp),
        132 => Some(IpProto::Sctp),
        _ => Some(IpProto::Other),
    }
}

fn parse_arp(frame: &[u8], offset: usize) -> Option<ParsedFrame> {
    if frame.len() < offset + 28 {
        return None;
    }
    // only ethernet/ipv4 ARP
    if be16(frame, offset)? != 1 || be16(frame, offset + 2)? != 0x0800 {
        return None;
    }
    let mut parsed = ParsedFrame::blank(Found::Arp);
    parsed.arp_opcode = be16(frame, offset + 6)?;
    parsed
        .arp_sender_mac
        .copy_from_slice(&frame[offset + 8..offset + 14]);
    parsed.src_ip = Address::V4(Ipv4Addr::new(
        frame[offset + 14],
        frame[offset + 15],
        frame[offset + 16],
        frame[offset + 17],
    ));
    parsed.dst_ip = Address::V4(Ipv4Addr::new(
        frame[offset + 24],
        frame[offset + 25],
        frame[offset + 26],
        frame[offset + 27],
    ));
    parsed.transport_offset = offset;
    Some(parsed)
}

/// MSS option of a SYN-ACK, walked from the parsed transport offset
pub fn tcp_get_mss(frame: &[u8], parsed: &ParsedFrame) -> Option<u16> {
    if parsed.found != Found::Tcp {
        return None;
    }
    let start = parsed.transport_offset + 20;
    let end = parsed.app_offset;
    let mut i = start;
    while i < end {
        match *frame.get(i)? {
            0 => return None,      // end of options
            1 => i += 1,           // nop
            2 => {
                if *frame.get(i + 1)? == 4 {
                    return be16(frame, i + 2);
                }
                return None;
            }
            _ => {
                let optlen = *frame.get(i + 1)? as usize;
                if optlen < 2 {
                    return None;
                }
                i += optlen;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templ::{tcp_flags, TemplParams, TemplateSet};

    fn set() -> TemplateSet {
        TemplateSet::build(&TemplParams {
            adapter_mac: [2, 0, 0, 1, 2, 3],
            router_mac_ipv4: [2, 0, 0, 9, 9, 9],
            router_mac_ipv6: [2, 0, 0, 9, 9, 9],
            src_ipv4: "10.0.0.1".parse().unwrap(),
            src_ipv6: "2001:db8::100".parse().unwrap(),
            ..TemplParams::default()
        })
    }

    fn them() -> Address {
        Address::V4("198.51.100.5".parse::<Ipv4Addr>().unwrap())
    }

    fn me() -> Address {
        Address::V4("10.0.0.1".parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_round_trip_tcp() {
        let mut buf = [0u8; 2048];
        let len = set().tcp_packet(
            them(),
            80,
            me(),
            40_000,
            0x01020304,
            0x0A0B0C0D,
            tcp_flags::ACK | tcp_flags::PSH,
            b"payload!",
            &mut buf,
        );
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Tcp);
        assert_eq!(parsed.src_ip, me());
        assert_eq!(parsed.dst_ip, them());
        assert_eq!(parsed.port_src, 40_000);
        assert_eq!(parsed.port_dst, 80);
        assert_eq!(parsed.tcp_seqno, 0x01020304);
        assert_eq!(parsed.tcp_ackno, 0x0A0B0C0D);
        assert!(parsed.has_tcp_flag(tcp_flags::ACK));
        assert!(!parsed.has_tcp_flag(tcp_flags::SYN));
        assert_eq!(parsed.app_length, 8);
        assert_eq!(&buf[parsed.app_offset..parsed.app_offset + 8], b"payload!");
    }

    #[test]
    fn test_round_trip_udp_v6() {
        let them6: Address = "2001:db8::5".parse::<Ipv6Addr>().unwrap().into();
        let me6: Address = "2001:db8::100".parse::<Ipv6Addr>().unwrap().into();
        let mut buf = [0u8; 2048];
        let len = set().udp_packet(them6, 53, me6, 40_001, b"q", &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Udp);
        assert_eq!(parsed.src_ip, me6);
        assert_eq!(parsed.dst_ip, them6);
        assert_eq!(parsed.app_length, 1);
    }

    #[test]
    fn test_round_trip_icmp() {
        let mut buf = [0u8; 2048];
        let len = set().icmp_echo_packet(them(), me(), 0x42, 0x07, 1, &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Icmp);
        assert_eq!(parsed.icmp_type, 8);
        assert_eq!(parsed.icmp_id, 0x42);
        assert_eq!(parsed.icmp_seq, 0x07);
    }

    #[test]
    fn test_round_trip_arp() {
        let mut buf = [0u8; 2048];
        let len = set().arp_request_packet(them(), &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Arp);
        assert_eq!(parsed.arp_opcode, 1);
        assert_eq!(parsed.dst_ip, them());
    }

    #[test]
    fn test_mss_extraction() {
        let mut buf = [0u8; 2048];
        let len = set().tcp_syn_packet(them(), 80, me(), 40_000, 1, &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(tcp_get_mss(&buf[..len], &parsed), Some(1460));

        let len = set().tcp_packet(them(), 80, me(), 40_000, 1, 2, tcp_flags::RST, &[], &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(tcp_get_mss(&buf[..len], &parsed), None);
    }

    #[test]
    fn test_icmp_unreachable_original_tuple() {
        // build a UDP probe, then wrap it in a synthetic ICMP
        // port-unreachable the way a target host would
        let templates = set();
        let mut probe = [0u8; 2048];
        let probe_len = templates.udp_packet(them(), 9999, me(), 40_002, b"x", &mut probe);

        let inner = &probe[14..probe_len]; // IP header onward
        let mut frame = Vec::new();
        frame.extend_from_slice(&[2, 0, 0, 1, 2, 3]); // dst mac
        frame.extend_from_slice(&[2, 0, 0, 9, 9, 9]); // src mac
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        // outer IPv4 from them to me
        let total = 20 + 8 + inner.len().min(28);
        let mut ip = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0];
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip.extend_from_slice(&[198, 51, 100, 5]);
        ip.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&[3, 3, 0, 0, 0, 0, 0, 0]); // type 3 code 3
        frame.extend_from_slice(&inner[..inner.len().min(28)]);

        let parsed = preprocess_frame(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Icmp);
        assert_eq!(parsed.icmp_type, 3);
        assert_eq!(parsed.icmp_code, 3);
        let orig = parsed.icmp_original.expect("embedded tuple");
        assert_eq!(orig.ip_proto, IpProto::Udp);
        assert_eq!(orig.src_ip, me());
        assert_eq!(orig.dst_ip, them());
        assert_eq!(orig.port_src, 40_002);
        assert_eq!(orig.port_dst, 9999);
    }

    #[test]
    fn test_truncated_frames_dropped() {
        let mut buf = [0u8; 2048];
        let len = set().tcp_syn_packet(them(), 80, me(), 40_000, 1, &mut buf);
        for cut in [0, 10, 14, 20, 33, len - 1] {
            assert!(
                preprocess_frame(&buf[..cut], LinkType::Ethernet).is_none(),
                "truncated frame of {} bytes must not parse",
                cut
            );
        }
    }

    #[test]
    fn test_unknown_ethertype_dropped() {
        let mut frame = vec![0u8; 64];
        frame[12] = 0x88;
        frame[13] = 0xB5;
        assert!(preprocess_frame(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_vlan_tagged_frame() {
        let mut p = TemplParams {
            adapter_mac: [2, 0, 0, 1, 2, 3],
            router_mac_ipv4: [2, 0, 0, 9, 9, 9],
            router_mac_ipv6: [2, 0, 0, 9, 9, 9],
            src_ipv4: "10.0.0.1".parse().unwrap(),
            src_ipv6: "2001:db8::100".parse().unwrap(),
            ..TemplParams::default()
        };
        p.vlan_id = Some(7);
        let templates = TemplateSet::build(&p);
        let mut buf = [0u8; 2048];
        let len = templates.tcp_syn_packet(them(), 80, me(), 40_000, 5, &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Tcp);
        assert_eq!(parsed.tcp_seqno, 5);
    }

    #[test]
    fn test_raw_and_null_links() {
        let mut p = TemplParams {
            src_ipv4: "10.0.0.1".parse().unwrap(),
            src_ipv6: "2001:db8::100".parse().unwrap(),
            ..TemplParams::default()
        };
        p.link = LinkType::Raw;
        let templates = TemplateSet::build(&p);
        let mut buf = [0u8; 2048];
        let len = templates.tcp_syn_packet(them(), 80, me(), 40_000, 5, &mut buf);
        assert!(preprocess_frame(&buf[..len], LinkType::Raw).is_some());

        p.link = LinkType::Null;
        let templates = TemplateSet::build(&p);
        let len = templates.tcp_syn_packet(them(), 80, me(), 40_000, 5, &mut buf);
        let parsed = preprocess_frame(&buf[..len], LinkType::Null).unwrap();
        assert_eq!(parsed.found, Found::Tcp);
    }
}
