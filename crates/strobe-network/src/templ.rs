//! Prebuilt packet templates
//!
//! Every protocol the scanner speaks gets one immutable prototype frame per
//! address family, built once at startup. The prototype has its variable
//! fields (addresses, ports, seq/ack, ids, lengths, checksums) zeroed and
//! carries two precomputed ones-complement partial sums: one over the IPv4
//! header, one over the transport header plus the fixed part of the
//! pseudo-header. Emitting a packet copies the prototype into a caller
//! buffer, writes only the variable bytes, and finishes each checksum by
//! folding the variable words into the stored partial. No checksum is ever
//! computed over the full packet on the hot path.
//!
//! IPv6 prototypes are derived from the IPv4 ones: the transport body is
//! lifted out and re-wrapped under a fresh link + IPv6 header, then the
//! partial sums are rebuilt for the new pseudo-header.

use crate::checksum::{crc32c, finish, sum_bytes, sum_u128, sum_u16, sum_u32};
use crate::datalink::LinkType;
use std::net::{Ipv4Addr, Ipv6Addr};
use strobe_core::Address;

/// TCP flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// Options applied to the SYN template
#[derive(Debug, Clone)]
pub struct TcpSynOptions {
    pub mss: Option<u16>,
    pub sackperm: bool,
    pub wscale: Option<u8>,
    pub timestamp: bool,
}

impl Default for TcpSynOptions {
    fn default() -> Self {
        Self {
            mss: Some(1460),
            sackperm: true,
            wscale: None,
            timestamp: false,
        }
    }
}

/// Everything the template builder needs to know about the wire
#[derive(Debug, Clone)]
pub struct TemplParams {
    pub link: LinkType,
    pub adapter_mac: [u8; 6],
    pub router_mac_ipv4: [u8; 6],
    pub router_mac_ipv6: [u8; 6],
    pub src_ipv4: Ipv4Addr,
    pub src_ipv6: Ipv6Addr,
    pub vlan_id: Option<u16>,
    pub ttl: u8,
    /// Window of the SYN template
    pub tcp_init_window: u16,
    /// Window of the plain TCP template (responses)
    pub tcp_window: u16,
    pub syn_options: TcpSynOptions,
}

impl Default for TemplParams {
    fn default() -> Self {
        Self {
            link: LinkType::Ethernet,
            adapter_mac: [0; 6],
            router_mac_ipv4: [0; 6],
            router_mac_ipv6: [0; 6],
            src_ipv4: Ipv4Addr::UNSPECIFIED,
            src_ipv6: Ipv6Addr::UNSPECIFIED,
            vlan_id: None,
            ttl: 64,
            tcp_init_window: 64_240,
            tcp_window: 1024,
            syn_options: TcpSynOptions::default(),
        }
    }
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// One prototype frame plus its offsets and partial sums
#[derive(Debug, Clone)]
struct Template {
    bytes: Vec<u8>,
    ip_offset: usize,
    transport_offset: usize,
    /// IPv4 header sum with id/src/dst/len/checksum zeroed; 0 for v6
    ip_partial: u32,
    /// Transport header sum with variable fields zeroed, plus the protocol
    /// number of the pseudo-header
    transport_partial: u32,
    v6: bool,
}

impl Template {
    fn transport_header_len(&self) -> usize {
        self.bytes.len() - self.transport_offset
    }
}

/// The full set, built once and shared read-only by every worker
#[derive(Debug, Clone)]
pub struct TemplateSet {
    tcp_v4: Template,
    tcp_v6: Template,
    tcp_syn_v4: Template,
    tcp_syn_v6: Template,
    udp_v4: Template,
    udp_v6: Template,
    icmp_echo_v4: Template,
    icmp_echo_v6: Template,
    icmp_ts_v4: Template,
    ndp_ns_v6: Template,
    arp_v4: Option<Template>,
    sctp_v4: Template,
    sctp_v6: Template,
}

fn push_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Link-layer header for one family. Raw datalinks have none; null
/// (loopback) frames start with a 4-byte host-order address family.
fn link_header(params: &TemplParams, ethertype: u16, dst_mac: [u8; 6]) -> Vec<u8> {
    match params.link {
        LinkType::Ethernet => {
            let mut bytes = Vec::with_capacity(18);
            bytes.extend_from_slice(&dst_mac);
            bytes.extend_from_slice(&params.adapter_mac);
            if let Some(vlan) = params.vlan_id {
                push_u16(&mut bytes, ETHERTYPE_VLAN);
                push_u16(&mut bytes, vlan & 0x0FFF);
            }
            push_u16(&mut bytes, ethertype);
            bytes
        }
        LinkType::Raw => Vec::new(),
        LinkType::Null => {
            let family: u32 = if ethertype == ETHERTYPE_IPV6 { 10 } else { 2 };
            family.to_le_bytes().to_vec()
        }
    }
}

/// IPv4 header prototype: id, total length, src, dst, checksum zeroed
fn ipv4_header(params: &TemplParams, proto: u8) -> Vec<u8> {
    let mut h = vec![0u8; 20];
    h[0] = 0x45;
    h[8] = params.ttl;
    h[9] = proto;
    h
}

/// IPv6 header prototype: payload length, src, dst zeroed
fn ipv6_header(params: &TemplParams, proto: u8, hop_limit: Option<u8>) -> Vec<u8> {
    let mut h = vec![0u8; 40];
    h[0] = 0x60;
    h[6] = proto;
    h[7] = hop_limit.unwrap_or(params.ttl);
    h
}

fn make_template(
    params: &TemplParams,
    v6: bool,
    proto: u8,
    transport: Vec<u8>,
    hop_limit: Option<u8>,
) -> Template {
    let (ethertype, router) = if v6 {
        (ETHERTYPE_IPV6, params.router_mac_ipv6)
    } else {
        (ETHERTYPE_IPV4, params.router_mac_ipv4)
    };
    let link = link_header(params, ethertype, router);
    let ip = if v6 {
        ipv6_header(params, proto, hop_limit)
    } else {
        ipv4_header(params, proto)
    };

    let ip_offset = link.len();
    let transport_offset = ip_offset + ip.len();
    let mut bytes = link;
    bytes.extend_from_slice(&ip);
    bytes.extend_from_slice(&transport);

    let ip_partial = if v6 {
        0
    } else {
        sum_bytes(&bytes[ip_offset..transport_offset])
    };
    let transport_partial = sum_bytes(&bytes[transport_offset..]) + proto as u32;

    Template {
        bytes,
        ip_offset,
        transport_offset,
        ip_partial,
        transport_partial,
        v6,
    }
}

/// Lift the transport body out of a v4 template and re-wrap it for v6
fn derive_v6(params: &TemplParams, v4: &Template, proto: u8, hop_limit: Option<u8>) -> Template {
    let transport = v4.bytes[v4.transport_offset..].to_vec();
    make_template(params, true, proto, transport, hop_limit)
}

/// TCP header with src/dst port, seq, ack, and the offset/flags word
/// zeroed. Window and options are fixed per template.
fn tcp_transport(window: u16, options: &[u8]) -> Vec<u8> {
    debug_assert!(options.len() % 4 == 0);
    let mut h = vec![0u8; 20];
    write_u16(&mut h, 14, window);
    h.extend_from_slice(options);
    h
}

fn syn_option_bytes(opts: &TcpSynOptions) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(mss) = opts.mss {
        bytes.push(2);
        bytes.push(4);
        push_u16(&mut bytes, mss);
    }
    if opts.sackperm {
        bytes.extend_from_slice(&[4, 2]);
    }
    if let Some(shift) = opts.wscale {
        bytes.extend_from_slice(&[3, 3, shift]);
    }
    if opts.timestamp {
        bytes.extend_from_slice(&[8, 10, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
    while bytes.len() % 4 != 0 {
        bytes.push(1); // NOP padding
    }
    bytes
}

impl TemplateSet {
    pub fn build(params: &TemplParams) -> Self {
        let tcp_v4 = make_template(params, false, 6, tcp_transport(params.tcp_window, &[]), None);
        let tcp_v6 = derive_v6(params, &tcp_v4, 6, None);

        let syn_opts = syn_option_bytes(&params.syn_options);
        let tcp_syn_v4 = make_template(
            params,
            false,
            6,
            tcp_transport(params.tcp_init_window, &syn_opts),
            None,
        );
        let tcp_syn_v6 = derive_v6(params, &tcp_syn_v4, 6, None);

        // UDP: ports, length, checksum zeroed
        let udp_v4 = make_template(params, false, 17, vec![0u8; 8], None);
        let udp_v6 = derive_v6(params, &udp_v4, 17, None);

        // ICMP echo: type/code fixed, checksum/id/seq zeroed
        let mut echo = vec![0u8; 8];
        echo[0] = 8; // v4 echo request
        let icmp_echo_v4 = make_template(params, false, 1, echo, None);
        let mut icmp_echo_v6 = derive_v6(params, &icmp_echo_v4, 58, None);
        {
            // v6 uses a different type number; re-fix and rebuild the sum
            let off = icmp_echo_v6.transport_offset;
            icmp_echo_v6.bytes[off] = 128;
            icmp_echo_v6.transport_partial =
                sum_bytes(&icmp_echo_v6.bytes[off..]) + 58;
        }

        // ICMP timestamp request: 3 x 32-bit timestamps stay zero
        let mut ts = vec![0u8; 20];
        ts[0] = 13;
        let icmp_ts_v4 = make_template(params, false, 1, ts, None);

        // NDP neighbor solicitation: type 135, target address zeroed,
        // source link-layer option fixed; hop limit pinned at 255
        let mut ns = vec![0u8; 24];
        ns[0] = 135;
        ns.extend_from_slice(&[1, 1]);
        ns.extend_from_slice(&params.adapter_mac);
        let ndp_ns_v6 = make_template(params, true, 58, ns, Some(255));

        // ARP request rides directly on Ethernet; raw/null datalinks
        // cannot carry it
        let arp_v4 = if params.link == LinkType::Ethernet {
            let mut bytes = link_header(params, ETHERTYPE_ARP, [0xFF; 6]);
            let arp_offset = bytes.len();
            push_u16(&mut bytes, 1); // htype ethernet
            push_u16(&mut bytes, ETHERTYPE_IPV4);
            bytes.push(6);
            bytes.push(4);
            push_u16(&mut bytes, 1); // request
            bytes.extend_from_slice(&params.adapter_mac);
            bytes.extend_from_slice(&params.src_ipv4.octets());
            bytes.extend_from_slice(&[0u8; 6]); // target hardware addr
            bytes.extend_from_slice(&[0u8; 4]); // target ip, variable
            Some(Template {
                bytes,
                ip_offset: arp_offset,
                transport_offset: arp_offset,
                ip_partial: 0,
                transport_partial: 0,
                v6: false,
            })
        } else {
            None
        };

        // SCTP INIT: common header (ports/vtag/crc zeroed) + INIT chunk
        // with the initiate tag and initial TSN zeroed
        let mut sctp = vec![0u8; 12];
        sctp.push(1); // chunk type INIT
        sctp.push(0);
        push_u16(&mut sctp, 20); // chunk length
        sctp.extend_from_slice(&[0u8; 4]); // initiate tag, variable
        sctp.extend_from_slice(&0x0001_8000u32.to_be_bytes()); // a_rwnd
        push_u16(&mut sctp, 10); // outbound streams
        push_u16(&mut sctp, 2048); // inbound streams
        sctp.extend_from_slice(&[0u8; 4]); // initial TSN, variable
        let sctp_v4 = make_template(params, false, 132, sctp, None);
        let sctp_v6 = derive_v6(params, &sctp_v4, 132, None);

        Self {
            tcp_v4,
            tcp_v6,
            tcp_syn_v4,
            tcp_syn_v6,
            udp_v4,
            udp_v6,
            icmp_echo_v4,
            icmp_echo_v6,
            icmp_ts_v4,
            ndp_ns_v6,
            arp_v4,
            sctp_v4,
            sctp_v6,
        }
    }

    /// Copy the prototype and payload into `buf`; returns the slice length
    fn lay_out(t: &Template, payload: &[u8], buf: &mut [u8]) -> usize {
        let total = t.bytes.len() + payload.len();
        buf[..t.bytes.len()].copy_from_slice(&t.bytes);
        buf[t.bytes.len()..total].copy_from_slice(payload);
        total
    }

    /// Patch the IPv4 header and finish its checksum
    fn finish_ipv4(t: &Template, buf: &mut [u8], ip_id: u16, src: u32, dst: u32, ip_len: u16) {
        let ip = t.ip_offset;
        write_u16(buf, ip + 2, ip_len);
        write_u16(buf, ip + 4, ip_id);
        write_u32(buf, ip + 12, src);
        write_u32(buf, ip + 16, dst);
        let sum = t.ip_partial + sum_u16(ip_len) + sum_u16(ip_id) + sum_u32(src) + sum_u32(dst);
        write_u16(buf, ip + 10, finish(sum));
    }

    /// Patch the IPv6 header; returns nothing, v6 has no header checksum
    fn finish_ipv6(t: &Template, buf: &mut [u8], src: u128, dst: u128, payload_len: u16) {
        let ip = t.ip_offset;
        write_u16(buf, ip + 4, payload_len);
        buf[ip + 8..ip + 24].copy_from_slice(&src.to_be_bytes());
        buf[ip + 24..ip + 40].copy_from_slice(&dst.to_be_bytes());
    }

    /// Sum of the variable pseudo-header words (addresses + length)
    fn pseudo_var_sum(t: &Template, src4: u32, dst4: u32, src6: u128, dst6: u128, len: u16) -> u32 {
        if t.v6 {
            sum_u128(src6) + sum_u128(dst6) + sum_u16(len)
        } else {
            sum_u32(src4) + sum_u32(dst4) + sum_u16(len)
        }
    }

    fn split_addrs(ip_them: Address, ip_me: Address) -> (u32, u32, u128, u128, bool) {
        match (ip_me, ip_them) {
            (Address::V4(me), Address::V4(them)) => {
                (u32::from(me), u32::from(them), 0, 0, false)
            }
            (Address::V6(me), Address::V6(them)) => {
                (0, 0, u128::from(me), u128::from(them), true)
            }
            _ => {
                debug_assert!(false, "mixed address families");
                (0, 0, 0, 0, false)
            }
        }
    }

    fn emit_tcp(
        t: &Template,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        buf: &mut [u8],
    ) -> usize {
        let (src4, dst4, src6, dst6, v6) = Self::split_addrs(ip_them, ip_me);
        if v6 != t.v6 {
            return 0;
        }
        let total = Self::lay_out(t, payload, buf);
        let tp = t.transport_offset;
        let tcp_len = (t.transport_header_len() + payload.len()) as u16;
        let doff = (t.transport_header_len() / 4) as u16;
        let offs_flags = (doff << 12) | flags as u16;

        write_u16(buf, tp, port_me);
        write_u16(buf, tp + 2, port_them);
        write_u32(buf, tp + 4, seq);
        write_u32(buf, tp + 8, ack);
        write_u16(buf, tp + 12, offs_flags);

        if t.v6 {
            Self::finish_ipv6(t, buf, src6, dst6, tcp_len);
        } else {
            let ip_id = (seq ^ (seq >> 16)) as u16;
            Self::finish_ipv4(t, buf, ip_id, src4, dst4, 20 + tcp_len);
        }

        let sum = t.transport_partial
            + Self::pseudo_var_sum(t, src4, dst4, src6, dst6, tcp_len)
            + sum_u16(port_me)
            + sum_u16(port_them)
            + sum_u32(seq)
            + sum_u32(ack)
            + sum_u16(offs_flags)
            + sum_bytes(payload);
        write_u16(buf, tp + 16, finish(sum));
        total
    }

    /// Plain TCP packet (responses: ACK, RST, ACK+payload)
    #[allow(clippy::too_many_arguments)]
    pub fn tcp_packet(
        &self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        buf: &mut [u8],
    ) -> usize {
        let t = if ip_them.is_v6() { &self.tcp_v6 } else { &self.tcp_v4 };
        Self::emit_tcp(t, ip_them, port_them, ip_me, port_me, seq, ack, flags, payload, buf)
    }

    /// SYN with the configured option block and initial window
    pub fn tcp_syn_packet(
        &self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        seq: u32,
        buf: &mut [u8],
    ) -> usize {
        let t = if ip_them.is_v6() {
            &self.tcp_syn_v6
        } else {
            &self.tcp_syn_v4
        };
        Self::emit_tcp(
            t,
            ip_them,
            port_them,
            ip_me,
            port_me,
            seq,
            0,
            tcp_flags::SYN,
            &[],
            buf,
        )
    }

    pub fn udp_packet(
        &self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        payload: &[u8],
        buf: &mut [u8],
    ) -> usize {
        let t = if ip_them.is_v6() { &self.udp_v6 } else { &self.udp_v4 };
        let (src4, dst4, src6, dst6, v6) = Self::split_addrs(ip_them, ip_me);
        if v6 != t.v6 {
            return 0;
        }
        let total = Self::lay_out(t, payload, buf);
        let tp = t.transport_offset;
        let udp_len = (8 + payload.len()) as u16;

        write_u16(buf, tp, port_me);
        write_u16(buf, tp + 2, port_them);
        write_u16(buf, tp + 4, udp_len);

        if t.v6 {
            Self::finish_ipv6(t, buf, src6, dst6, udp_len);
        } else {
            let ip_id = port_them ^ udp_len;
            Self::finish_ipv4(t, buf, ip_id, src4, dst4, 20 + udp_len);
        }

        let sum = t.transport_partial
            + Self::pseudo_var_sum(t, src4, dst4, src6, dst6, udp_len)
            + sum_u16(port_me)
            + sum_u16(port_them)
            + sum_u16(udp_len)
            + sum_bytes(payload);
        write_u16(buf, tp + 6, finish(sum));
        total
    }

    /// ICMP echo request; v4 has no pseudo-header, v6 does
    pub fn icmp_echo_packet(
        &self,
        ip_them: Address,
        ip_me: Address,
        id: u16,
        seq: u16,
        ip_id: u16,
        buf: &mut [u8],
    ) -> usize {
        let t = if ip_them.is_v6() {
            &self.icmp_echo_v6
        } else {
            &self.icmp_echo_v4
        };
        let (src4, dst4, src6, dst6, v6) = Self::split_addrs(ip_them, ip_me);
        if v6 != t.v6 {
            return 0;
        }
        let total = Self::lay_out(t, &[], buf);
        let tp = t.transport_offset;
        let icmp_len = t.transport_header_len() as u16;

        write_u16(buf, tp + 4, id);
        write_u16(buf, tp + 6, seq);

        let mut sum = t.transport_partial + sum_u16(id) + sum_u16(seq);
        if t.v6 {
            Self::finish_ipv6(t, buf, src6, dst6, icmp_len);
            sum += Self::pseudo_var_sum(t, 0, 0, src6, dst6, icmp_len);
        } else {
            Self::finish_ipv4(t, buf, ip_id, src4, dst4, 20 + icmp_len);
            // v4 ICMP checksum covers no pseudo-header; drop the proto
            // number baked into the partial
            sum -= 1;
        }
        write_u16(buf, tp + 2, finish(sum));
        total
    }

    /// ICMP timestamp request. IPv4 only; v6 targets are skipped silently.
    pub fn icmp_timestamp_packet(
        &self,
        ip_them: Address,
        ip_me: Address,
        id: u16,
        seq: u16,
        buf: &mut [u8],
    ) -> usize {
        if ip_them.is_v6() {
            return 0;
        }
        let t = &self.icmp_ts_v4;
        let (src4, dst4, ..) = Self::split_addrs(ip_them, ip_me);
        let total = Self::lay_out(t, &[], buf);
        let tp = t.transport_offset;

        write_u16(buf, tp + 4, id);
        write_u16(buf, tp + 6, seq);

        let icmp_len = t.transport_header_len() as u16;
        Self::finish_ipv4(t, buf, id ^ seq, src4, dst4, 20 + icmp_len);
        let sum = t.transport_partial + sum_u16(id) + sum_u16(seq) - 1;
        write_u16(buf, tp + 2, finish(sum));
        total
    }

    /// NDP neighbor solicitation toward the solicited-node multicast group
    pub fn ndp_ns_packet(&self, ip_them: Address, ip_me: Address, buf: &mut [u8]) -> usize {
        let target = match ip_them.as_u128() {
            Some(v) => v,
            None => return 0,
        };
        let src6 = match ip_me.as_u128() {
            Some(v) => v,
            None => return 0,
        };
        let t = &self.ndp_ns_v6;
        let total = Self::lay_out(t, &[], buf);
        let tp = t.transport_offset;

        // ff02::1:ff00:0/104 | low 24 bits of the target
        let dst6 = 0xff02_0000_0000_0000_0000_0001_ff00_0000u128 | (target & 0xFF_FFFF);
        if t.ip_offset >= 14 {
            // multicast MAC 33:33 + low 32 bits of the destination
            buf[0] = 0x33;
            buf[1] = 0x33;
            buf[2..6].copy_from_slice(&(dst6 as u32).to_be_bytes());
        }

        buf[tp + 8..tp + 24].copy_from_slice(&target.to_be_bytes());

        let icmp_len = t.transport_header_len() as u16;
        Self::finish_ipv6(t, buf, src6, dst6, icmp_len);
        let sum = t.transport_partial
            + Self::pseudo_var_sum(t, 0, 0, src6, dst6, icmp_len)
            + sum_u128(target);
        write_u16(buf, tp + 2, finish(sum));
        total
    }

    /// ARP who-has broadcast. Ethernet only; 0 on other datalinks or v6.
    pub fn arp_request_packet(&self, ip_them: Address, buf: &mut [u8]) -> usize {
        let t = match &self.arp_v4 {
            Some(t) => t,
            None => return 0,
        };
        let dst = match ip_them.as_u32() {
            Some(v) => v,
            None => return 0,
        };
        let total = Self::lay_out(t, &[], buf);
        let tpa = t.bytes.len() - 4;
        write_u32(buf, tpa, dst);
        total
    }

    /// SCTP INIT; the verification cookie doubles as initiate tag and TSN
    pub fn sctp_init_packet(
        &self,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
        tag: u32,
        buf: &mut [u8],
    ) -> usize {
        let t = if ip_them.is_v6() { &self.sctp_v6 } else { &self.sctp_v4 };
        let (src4, dst4, src6, dst6, v6) = Self::split_addrs(ip_them, ip_me);
        if v6 != t.v6 {
            return 0;
        }
        let total = Self::lay_out(t, &[], buf);
        let tp = t.transport_offset;
        let sctp_len = t.transport_header_len() as u16;

        write_u16(buf, tp, port_me);
        write_u16(buf, tp + 2, port_them);
        write_u32(buf, tp + 12 + 4, tag); // initiate tag
        write_u32(buf, tp + 12 + 16, tag); // initial TSN

        if t.v6 {
            Self::finish_ipv6(t, buf, src6, dst6, sctp_len);
        } else {
            Self::finish_ipv4(t, buf, tag as u16, src4, dst4, 20 + sctp_len);
        }

        // SCTP uses CRC-32c over the whole packet, little-endian on the wire
        write_u32(buf, tp + 8, 0);
        let crc = crc32c(&buf[tp..total]);
        buf[tp + 8..tp + 12].copy_from_slice(&crc.to_le_bytes());
        total
    }

    /// Longest prototype, for sizing packet buffers
    pub fn max_prototype_len(&self) -> usize {
        [
            self.tcp_v4.bytes.len(),
            self.tcp_v6.bytes.len(),
            self.tcp_syn_v4.bytes.len(),
            self.tcp_syn_v6.bytes.len(),
            self.udp_v6.bytes.len(),
            self.sctp_v6.bytes.len(),
            self.ndp_ns_v6.bytes.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::verify;

    fn params() -> TemplParams {
        TemplParams {
            adapter_mac: [0x02, 0x00, 0x00, 0x11, 0x22, 0x33],
            router_mac_ipv4: [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC],
            router_mac_ipv6: [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC],
            src_ipv4: Ipv4Addr::new(10, 0, 0, 1),
            src_ipv6: "2001:db8::100".parse().unwrap(),
            ..TemplParams::default()
        }
    }

    fn them_v4() -> Address {
        Address::V4(Ipv4Addr::new(198, 51, 100, 5))
    }

    fn me_v4() -> Address {
        Address::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    /// Independent verification against the stored partials: the IP header
    /// must verify on its own, the transport section together with a
    /// freshly built pseudo-header.
    fn verify_v4_tcp(frame: &[u8], ip_offset: usize) {
        let ihl = ((frame[ip_offset] & 0x0F) as usize) * 4;
        let ip = &frame[ip_offset..ip_offset + ihl];
        assert!(verify(ip, 0), "IP header checksum failed");

        let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        let tcp = &frame[ip_offset + ihl..ip_offset + total_len];
        let pseudo = sum_bytes(&ip[12..20]) + 6 + tcp.len() as u32;
        assert!(verify(tcp, pseudo), "TCP checksum failed");
    }

    #[test]
    fn test_tcp_syn_checksums_verify() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let len = set.tcp_syn_packet(them_v4(), 80, me_v4(), 40_000, 0xDEAD_BEEF, &mut buf);
        assert!(len > 0);
        verify_v4_tcp(&buf[..len], 14);
        // SYN flag and options present
        let flags = buf[14 + 20 + 13];
        assert_eq!(flags, tcp_flags::SYN);
        assert!(len > 14 + 20 + 20, "options missing from SYN template");
    }

    #[test]
    fn test_tcp_payload_checksums_verify() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let payload = b"GET / HTTP/1.0\r\n\r\n";
        let len = set.tcp_packet(
            them_v4(),
            80,
            me_v4(),
            40_007,
            0x1111_2222,
            0x3333_4444,
            tcp_flags::ACK | tcp_flags::PSH,
            payload,
            &mut buf,
        );
        assert!(len > 0);
        verify_v4_tcp(&buf[..len], 14);
        assert_eq!(&buf[len - payload.len()..len], payload);
    }

    #[test]
    fn test_template_emit_is_idempotent() {
        let set1 = TemplateSet::build(&params());
        let set2 = TemplateSet::build(&params());
        let mut a = [0u8; 2048];
        let mut b = [0u8; 2048];
        let la = set1.tcp_syn_packet(them_v4(), 443, me_v4(), 40_001, 7, &mut a);
        let lb = set2.tcp_syn_packet(them_v4(), 443, me_v4(), 40_001, 7, &mut b);
        assert_eq!(la, lb);
        assert_eq!(&a[..la], &b[..lb], "same tuple must emit identical frames");
    }

    #[test]
    fn test_udp_checksums_verify() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let len = set.udp_packet(them_v4(), 53, me_v4(), 40_002, b"\x12\x34probe", &mut buf);
        assert!(len > 0);
        let ip = &buf[14..34];
        assert!(verify(ip, 0));
        let udp_len = u16::from_be_bytes([buf[14 + 20 + 4], buf[14 + 20 + 5]]) as usize;
        let udp = &buf[34..34 + udp_len];
        let pseudo = sum_bytes(&ip[12..20]) + 17 + udp_len as u32;
        assert!(verify(udp, pseudo), "UDP checksum failed");
    }

    #[test]
    fn test_udp_v6_checksums_verify() {
        let set = TemplateSet::build(&params());
        let me: Address = "2001:db8::100".parse::<Ipv6Addr>().unwrap().into();
        let them: Address = "2001:db8::5".parse::<Ipv6Addr>().unwrap().into();
        let mut buf = [0u8; 2048];
        let len = set.udp_packet(them, 53, me, 40_003, b"hello", &mut buf);
        assert!(len > 0);
        let ip = &buf[14..54];
        let udp_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
        let udp = &buf[54..54 + udp_len];
        let pseudo = sum_bytes(&ip[8..40]) + 17 + udp_len as u32;
        assert!(verify(udp, pseudo), "UDPv6 checksum failed");
    }

    #[test]
    fn test_icmp_echo_checksums_verify() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let len = set.icmp_echo_packet(them_v4(), me_v4(), 0x42, 0x07, 0x1234, &mut buf);
        assert!(len > 0);
        let ip = &buf[14..34];
        assert!(verify(ip, 0));
        let icmp = &buf[34..len];
        assert!(verify(icmp, 0), "ICMP checksum failed");
        assert_eq!(icmp[0], 8);
        assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x42);
    }

    #[test]
    fn test_icmp_echo_v6_checksums_verify() {
        let set = TemplateSet::build(&params());
        let me: Address = "2001:db8::100".parse::<Ipv6Addr>().unwrap().into();
        let them: Address = "2001:db8::7".parse::<Ipv6Addr>().unwrap().into();
        let mut buf = [0u8; 2048];
        let len = set.icmp_echo_packet(them, me, 0x11, 0x22, 0, &mut buf);
        assert!(len > 0);
        let ip = &buf[14..54];
        let icmp = &buf[54..len];
        assert_eq!(icmp[0], 128);
        let pseudo = sum_bytes(&ip[8..40]) + 58 + icmp.len() as u32;
        assert!(verify(icmp, pseudo), "ICMPv6 checksum failed");
    }

    #[test]
    fn test_icmp_timestamp_v6_skipped() {
        let set = TemplateSet::build(&params());
        let them: Address = "2001:db8::7".parse::<Ipv6Addr>().unwrap().into();
        let me: Address = "2001:db8::100".parse::<Ipv6Addr>().unwrap().into();
        let mut buf = [0u8; 2048];
        assert_eq!(set.icmp_timestamp_packet(them, me, 1, 1, &mut buf), 0);
        assert!(set.icmp_timestamp_packet(them_v4(), me_v4(), 1, 1, &mut buf) > 0);
    }

    #[test]
    fn test_ndp_ns_solicited_node() {
        let set = TemplateSet::build(&params());
        let me: Address = "2001:db8::100".parse::<Ipv6Addr>().unwrap().into();
        let them: Address = "2001:db8::aa:bbcc".parse::<Ipv6Addr>().unwrap().into();
        let mut buf = [0u8; 2048];
        let len = set.ndp_ns_packet(them, me, &mut buf);
        assert!(len > 0);
        // multicast MAC and solicited-node destination
        assert_eq!(&buf[0..2], &[0x33, 0x33]);
        let dst = &buf[14 + 24..14 + 40];
        assert_eq!(&dst[0..2], &[0xff, 0x02]);
        assert_eq!(&dst[13..16], &[0xaa, 0xbb, 0xcc]);
        // checksum over ICMPv6 with pseudo header
        let ip = &buf[14..54];
        let icmp = &buf[54..len];
        let pseudo = sum_bytes(&ip[8..40]) + 58 + icmp.len() as u32;
        assert!(verify(icmp, pseudo), "NDP NS checksum failed");
    }

    #[test]
    fn test_arp_request_layout() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let len = set.arp_request_packet(them_v4(), &mut buf);
        assert_eq!(len, 14 + 28);
        assert_eq!(&buf[0..6], &[0xFF; 6]); // broadcast
        assert_eq!(u16::from_be_bytes([buf[12], buf[13]]), 0x0806);
        assert_eq!(&buf[len - 4..len], &[198, 51, 100, 5]);
    }

    #[test]
    fn test_sctp_init_crc() {
        let set = TemplateSet::build(&params());
        let mut buf = [0u8; 2048];
        let len = set.sctp_init_packet(them_v4(), 36412, me_v4(), 40_004, 0xCAFE_BABE, &mut buf);
        assert!(len > 0);
        let sctp = &buf[34..len];
        let wire_crc = u32::from_le_bytes([sctp[8], sctp[9], sctp[10], sctp[11]]);
        let mut copy = sctp.to_vec();
        copy[8..12].fill(0);
        assert_eq!(crc32c(&copy), wire_crc);
        assert_eq!(u32::from_be_bytes([sctp[16], sctp[17], sctp[18], sctp[19]]), 0xCAFE_BABE);
    }

    #[test]
    fn test_vlan_shim_inserted() {
        let mut p = params();
        p.vlan_id = Some(42);
        let set = TemplateSet::build(&p);
        let mut buf = [0u8; 2048];
        let len = set.tcp_syn_packet(them_v4(), 80, me_v4(), 40_000, 1, &mut buf);
        assert!(len > 0);
        assert_eq!(u16::from_be_bytes([buf[12], buf[13]]), 0x8100);
        assert_eq!(u16::from_be_bytes([buf[14], buf[15]]) & 0x0FFF, 42);
        assert_eq!(u16::from_be_bytes([buf[16], buf[17]]), 0x0800);
        verify_v4_tcp(&buf[..len], 18);
    }

    #[test]
    fn test_raw_and_null_datalinks() {
        let mut p = params();
        p.link = LinkType::Raw;
        let set = TemplateSet::build(&p);
        let mut buf = [0u8; 2048];
        let len = set.tcp_syn_packet(them_v4(), 80, me_v4(), 40_000, 1, &mut buf);
        assert!(len > 0);
        assert_eq!(buf[0] >> 4, 4, "raw frame must start at the IP header");
        verify_v4_tcp(&buf[..len], 0);
        // no ARP without Ethernet
        assert_eq!(set.arp_request_packet(them_v4(), &mut buf), 0);

        p.link = LinkType::Null;
        let set = TemplateSet::build(&p);
        let len = set.tcp_syn_packet(them_v4(), 80, me_v4(), 40_000, 1, &mut buf);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 2);
        verify_v4_tcp(&buf[..len], 4);
    }

    #[test]
    fn test_ttl_and_window_overrides() {
        let mut p = params();
        p.ttl = 128;
        p.tcp_init_window = 1024;
        let set = TemplateSet::build(&p);
        let mut buf = [0u8; 2048];
        let len = set.tcp_syn_packet(them_v4(), 80, me_v4(), 40_000, 1, &mut buf);
        assert!(len > 0);
        assert_eq!(buf[14 + 8], 128);
        assert_eq!(u16::from_be_bytes([buf[14 + 20 + 14], buf[14 + 20 + 15]]), 1024);
    }
}
