//! ZBanner: stateless banner grabbing
//!
//! Builds a complete TCP exchange without any connection table. The SYN
//! carries the cookie; when the SYN-ACK arrives the handler immediately
//! stacks an ACK carrying the probe payload (`seq = cookie + 1`); the
//! first data packet whose ACK equals `cookie + payload_len + 1` is the
//! banner, answered with an RST to tear the half-connection down.
//!
//! Multi-probe runs ride on the source port: probe `i` uses source port
//! `src_port_start + i`, and the rx side recovers the index from the
//! destination port of the reply. Port-openness observations dedup with
//! type 0, banner observations with type 1, so the same target can
//! produce one of each.

use crate::contract::{
    arg_bool, parse_module_args, ModuleContext, MultiMode, PreHandle, ProbeModule, ProbeTarget,
    ProbeType, Received, ScanModule, ScanTarget, ScanTmEvent, PROBE_PAYLOAD_MAX,
};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{get_cookie, Address, IpProto, OutItem, OutputLevel, Result, SourcePorts};
use strobe_network::{tcp_flags, tcp_get_mss, Found, PacketStack, TemplateSet};
use tracing::warn;

const DEDUP_PORT: u32 = 0;
const DEDUP_BANNER: u32 = 1;

#[derive(Debug, Default, Clone)]
struct ZBannerConf {
    no_banner_timeout: bool,
    port_timeout: bool,
    port_success: bool,
    port_failure: bool,
    record_ttl: bool,
    record_ipid: bool,
    record_win: bool,
    record_mss: bool,
}

#[derive(Default)]
pub struct ZBannerScan {
    templates: Option<Arc<TemplateSet>>,
    probe: Option<Arc<dyn ProbeModule>>,
    source_ports: SourcePorts,
    conf: ZBannerConf,
}

impl ZBannerScan {
    pub fn new() -> Self {
        Self {
            source_ports: SourcePorts { start: 0, count: 1 },
            ..Self::default()
        }
    }

    fn templates(&self) -> &TemplateSet {
        self.templates.as_ref().expect("init before use")
    }

    fn probe(&self) -> &dyn ProbeModule {
        self.probe.as_ref().expect("zbanner requires a probe").as_ref()
    }

    fn probe_target(&self, ip_them: Address, port_them: u16, ip_me: Address, port_me: u16) -> ProbeTarget {
        ProbeTarget {
            ip_proto: IpProto::Tcp,
            ip_them,
            port_them,
            ip_me,
            port_me,
            cookie: 0, // zbanner recognizes responses by seq math alone
            index: self.source_ports.index_of(port_me),
        }
    }

    /// Queue one follow-up SYN on a different source port, with its port
    /// timeout when configured
    #[allow(clippy::too_many_arguments)]
    fn stack_follow_up_syn(
        &self,
        seed: u64,
        stack: &PacketStack,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        src_port: u16,
        ft: Option<&FtWheel>,
        now: u64,
    ) {
        let cookie = get_cookie(ip_them, port_them, ip_me, src_port, seed);
        match stack.get_pktbuf() {
            Ok(mut pkt) => {
                let len = self.templates().tcp_syn_packet(
                    ip_them,
                    port_them,
                    ip_me,
                    src_port,
                    cookie,
                    pkt.buf_mut(),
                );
                pkt.set_len(len);
                if let Err(e) = stack.transmit_pktbuf(pkt) {
                    warn!("zbanner: dropping follow-up SYN: {}", e);
                    return;
                }
            }
            Err(e) => {
                warn!("zbanner: no pktbuf for follow-up SYN: {}", e);
                return;
            }
        }

        if let Some(ft) = ft {
            if self.conf.port_timeout {
                ft.add(
                    ScanTmEvent {
                        ip_proto: IpProto::Tcp,
                        ip_them,
                        ip_me,
                        port_them,
                        port_me: src_port,
                        dedup_type: DEDUP_PORT,
                        need_timeout: true,
                    },
                    now,
                );
            }
        }
    }

    /// Fan out follow-up probes 1..multi_num
    #[allow(clippy::too_many_arguments)]
    fn fan_out(
        &self,
        seed: u64,
        stack: &PacketStack,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        ft: Option<&FtWheel>,
        now: u64,
    ) {
        for idx in 1..self.probe().multi_num() {
            self.stack_follow_up_syn(
                seed,
                stack,
                ip_them,
                port_them,
                ip_me,
                self.source_ports.start + idx,
                ft,
                now,
            );
        }
    }

    fn record_flags(&self, recved: &Received, item: &mut OutItem) {
        if self.conf.record_ttl {
            item.report.set_int("ttl", recved.parsed.ip_ttl as i64);
        }
        if self.conf.record_ipid && recved.parsed.src_ip.is_v4() {
            item.report.set_int("ipid", recved.parsed.ip_v4_id as i64);
        }
        if self.conf.record_win {
            item.report.set_int("win", recved.parsed.tcp_win as i64);
        }
    }
}

impl ScanModule for ZBannerScan {
    fn name(&self) -> &'static str {
        "zbanner"
    }

    fn desc(&self) -> &'static str {
        "Stateless TCP banner grab: completes the handshake, sends the probe \
         payload, and reads the first response packet, all without per-target state."
    }

    fn required_probe_type(&self) -> ProbeType {
        ProbeType::Tcp
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "(ip && tcp && (tcp[tcpflags]|tcp-ack!=0 || tcp[tcpflags]==tcp-rst)) \
         || (ip6 && tcp && (ip6[40+13]|tcp-ack!=0 || ip6[40+13]==tcp-rst))"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        self.probe = ctx.probe.clone();
        self.source_ports = ctx.source_ports;

        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| strobe_core::Error::Config("zbanner requires --probe-module".into()))?;
        if probe.multi_num() > self.source_ports.count {
            return Err(strobe_core::Error::Config(format!(
                "probe wants {} probes per target but only {} source ports are reserved",
                probe.multi_num(),
                self.source_ports.count
            )));
        }

        if let Some(args) = &ctx.args {
            for (key, value) in parse_module_args(args) {
                match key.as_str() {
                    "no-banner-timeout" | "no-banner-tm" => {
                        self.conf.no_banner_timeout = arg_bool(&value)
                    }
                    "port-timeout" | "port-tm" => self.conf.port_timeout = arg_bool(&value),
                    "port-success" => self.conf.port_success = arg_bool(&value),
                    "port-failure" | "port-fail" => self.conf.port_failure = arg_bool(&value),
                    "record-ttl" | "ttl" => self.conf.record_ttl = arg_bool(&value),
                    "record-ipid" | "ipid" => self.conf.record_ipid = arg_bool(&value),
                    "record-win" | "win" => self.conf.record_win = arg_bool(&value),
                    "record-mss" | "mss" => self.conf.record_mss = arg_bool(&value),
                    other => warn!("zbanner: ignoring unknown arg {:?}", other),
                }
            }
        }
        Ok(())
    }

    fn transmit(
        &self,
        seed: u64,
        target: &ScanTarget,
        event: &mut ScanTmEvent,
        buf: &mut [u8],
    ) -> (usize, bool) {
        if target.ip_proto != IpProto::Tcp {
            return (0, false);
        }

        let src_port = self.source_ports.start + target.index;
        let seqno = get_cookie(target.ip_them, target.port_them, target.ip_me, src_port, seed);
        let len = self.templates().tcp_syn_packet(
            target.ip_them,
            target.port_them,
            target.ip_me,
            src_port,
            seqno,
            buf,
        );

        if self.conf.port_timeout {
            event.need_timeout = true;
            event.dedup_type = DEDUP_PORT;
            event.port_me = src_port;
        }

        let more = self.probe().multi_mode() == MultiMode::Direct
            && target.index + 1 < self.probe().multi_num();
        (len, more)
    }

    fn validate(&self, seed: u64, recved: &Received, pre: &mut PreHandle) {
        if recved.parsed.found == Found::Tcp && recved.is_myip && recved.is_myport {
            pre.go_record = true;
        } else {
            return;
        }

        let seqno_me = recved.parsed.tcp_ackno;
        let cookie = get_cookie(
            recved.parsed.src_ip,
            recved.parsed.port_src,
            recved.parsed.dst_ip,
            recved.parsed.port_dst,
            seed,
        );

        if recved.parsed.has_tcp_flag(tcp_flags::SYN | tcp_flags::ACK) {
            if cookie == seqno_me.wrapping_sub(1) {
                pre.go_dedup = true;
                pre.dedup_type = DEDUP_PORT;
            }
        } else if recved.parsed.has_tcp_flag(tcp_flags::RST) {
            if seqno_me == cookie.wrapping_add(1) || seqno_me == cookie {
                pre.go_dedup = true;
                pre.dedup_type = DEDUP_PORT;
            }
        } else if recved.parsed.has_tcp_flag(tcp_flags::ACK) && recved.parsed.app_length > 0 {
            // response data can arrive as ACK, PSH+ACK, or FIN+PSH+ACK
            let ptarget = self.probe_target(
                recved.parsed.src_ip,
                recved.parsed.port_src,
                recved.parsed.dst_ip,
                recved.parsed.port_dst,
            );
            let payload_len = self.probe().payload_length(&ptarget) as u32;
            if seqno_me == cookie.wrapping_add(payload_len).wrapping_add(1) {
                pre.go_dedup = true;
                pre.dedup_type = DEDUP_BANNER;
            }
        }
    }

    fn handle(
        &self,
        th_idx: usize,
        seed: u64,
        recved: &Received,
        item: &mut OutItem,
        stack: &PacketStack,
        ft: Option<&FtWheel>,
        now: u64,
    ) {
        let seqno_me = recved.parsed.tcp_ackno;
        let seqno_them = recved.parsed.tcp_seqno;
        let ip_them = recved.parsed.src_ip;
        let port_them = recved.parsed.port_src;
        let ip_me = recved.parsed.dst_ip;
        let port_me = recved.parsed.port_dst;

        if recved.parsed.has_tcp_flag(tcp_flags::SYN | tcp_flags::ACK) {
            if self.conf.port_success {
                item.level = OutputLevel::Success;
            }
            self.record_flags(recved, item);
            if self.conf.record_mss {
                let mss = tcp_get_mss(recved.frame, &recved.parsed).unwrap_or(0);
                item.report.set_int("mss", mss as i64);
            }

            if recved.parsed.tcp_win == 0 {
                // cannot carry a payload into a zero window
                item.classification = "fake-open".to_string();
                item.reason = "zerowin".to_string();
                return;
            }
            item.classification = "open".to_string();
            item.reason = "syn-ack".to_string();

            // complete the handshake and push the probe in one segment
            let ptarget = self.probe_target(ip_them, port_them, ip_me, port_me);
            let mut payload = [0u8; PROBE_PAYLOAD_MAX];
            let payload_len = self.probe().make_payload(&ptarget, &mut payload);

            match stack.get_pktbuf() {
                Ok(mut pkt) => {
                    let len = self.templates().tcp_packet(
                        ip_them,
                        port_them,
                        ip_me,
                        port_me,
                        seqno_me,
                        seqno_them.wrapping_add(1),
                        tcp_flags::ACK | tcp_flags::PSH,
                        &payload[..payload_len],
                        pkt.buf_mut(),
                    );
                    pkt.set_len(len);
                    if let Err(e) = stack.transmit_pktbuf(pkt) {
                        warn!("zbanner: dropping probe ACK: {}", e);
                    }
                }
                Err(e) => warn!("zbanner: no pktbuf for probe ACK: {}", e),
            }

            if let Some(ft) = ft {
                if !self.conf.no_banner_timeout {
                    ft.add(
                        ScanTmEvent {
                            ip_proto: IpProto::Tcp,
                            ip_them,
                            ip_me,
                            port_them,
                            port_me,
                            dedup_type: DEDUP_BANNER,
                            need_timeout: true,
                        },
                        now,
                    );
                }
            }

            if self.probe().multi_mode() == MultiMode::IfOpen && port_me == self.source_ports.start
            {
                self.fan_out(seed, stack, ip_them, port_them, ip_me, ft, now);
            }
        } else if recved.parsed.has_tcp_flag(tcp_flags::RST) {
            self.record_flags(recved, item);
            item.classification = "closed".to_string();
            item.reason = "rst".to_string();
            if self.conf.port_failure {
                item.level = OutputLevel::Failure;
            }
        } else {
            // banner data: tear down first, then let the probe classify
            match stack.get_pktbuf() {
                Ok(mut pkt) => {
                    let len = self.templates().tcp_packet(
                        ip_them,
                        port_them,
                        ip_me,
                        port_me,
                        seqno_me,
                        seqno_them.wrapping_add(1),
                        tcp_flags::RST,
                        &[],
                        pkt.buf_mut(),
                    );
                    pkt.set_len(len);
                    if let Err(e) = stack.transmit_pktbuf(pkt) {
                        warn!("zbanner: dropping teardown RST: {}", e);
                    }
                }
                Err(e) => warn!("zbanner: no pktbuf for teardown RST: {}", e),
            }

            let ptarget = self.probe_target(ip_them, port_them, ip_me, port_me);
            let is_multi =
                self.probe()
                    .handle_response(th_idx, &ptarget, recved.app_payload(), item);

            match self.probe().multi_mode() {
                MultiMode::AfterHandle
                    if is_multi != 0 && port_me == self.source_ports.start =>
                {
                    self.fan_out(seed, stack, ip_them, port_them, ip_me, ft, now);
                }
                MultiMode::DynamicNext if is_multi != 0 => {
                    self.stack_follow_up_syn(
                        seed,
                        stack,
                        ip_them,
                        port_them,
                        ip_me,
                        self.source_ports.start + is_multi - 1,
                        ft,
                        now,
                    );
                }
                _ => {}
            }
        }
    }

    fn timeout(
        &self,
        seed: u64,
        event: &ScanTmEvent,
        item: &mut OutItem,
        stack: &PacketStack,
        ft: Option<&FtWheel>,
        now: u64,
    ) {
        if event.dedup_type == DEDUP_PORT {
            item.classification = "closed".to_string();
            item.reason = "timeout".to_string();
            if self.conf.port_failure {
                item.level = OutputLevel::Failure;
            }
            return;
        }

        // banner timeout: the port opened but never answered the probe
        let ptarget = self.probe_target(event.ip_them, event.port_them, event.ip_me, event.port_me);
        let is_multi = self.probe().handle_timeout(&ptarget, item);

        match self.probe().multi_mode() {
            MultiMode::AfterHandle
                if is_multi != 0 && event.port_me == self.source_ports.start =>
            {
                self.fan_out(seed, stack, event.ip_them, event.port_them, event.ip_me, ft, now);
            }
            MultiMode::DynamicNext if is_multi != 0 => {
                self.stack_follow_up_syn(
                    seed,
                    stack,
                    event.ip_them,
                    event.port_them,
                    event.ip_me,
                    self.source_ports.start + is_multi - 1,
                    ft,
                    now,
                );
            }
            _ => {}
        }
    }
}
