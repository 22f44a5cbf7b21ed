//! TCP SYN scan
//!
//! The default module. One SYN per target with the recognition cookie as
//! sequence number; a SYN-ACK acknowledging `cookie + 1` means open, an
//! RST means closed, silence means closed-by-timeout. No connection is
//! ever completed.
//!
//! An RST is accepted with `ack == cookie` as well as `cookie + 1` —
//! stacks differ here — while the SYN-ACK path requires exactly
//! `cookie + 1`.

use crate::contract::{
    arg_bool, parse_module_args, ModuleContext, PreHandle, Received, ScanModule, ScanTarget,
    ScanTmEvent,
};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{get_cookie, IpProto, OutItem, OutputLevel, Result};
use strobe_network::{tcp_flags, tcp_get_mss, Found, PacketStack, TemplateSet};
use tracing::warn;

#[derive(Debug, Default, Clone)]
struct TcpSynConf {
    send_rst: bool,
    zero_fail: bool,
    record_ttl: bool,
    record_ipid: bool,
    record_win: bool,
    record_mss: bool,
}

#[derive(Default)]
pub struct TcpSynScan {
    templates: Option<Arc<TemplateSet>>,
    conf: TcpSynConf,
}

impl TcpSynScan {
    pub fn new() -> Self {
        Self::default()
    }

    fn templates(&self) -> &TemplateSet {
        self.templates.as_ref().expect("init before use")
    }
}

impl ScanModule for TcpSynScan {
    fn name(&self) -> &'static str {
        "tcp-syn"
    }

    fn desc(&self) -> &'static str {
        "Sends a TCP SYN to every target port; SYN-ACK means open, RST means closed."
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "(ip && tcp && (tcp[tcpflags]==(tcp-syn|tcp-ack) || tcp[tcpflags]==tcp-rst)) \
         || (ip6 && tcp && (ip6[40+13]==(tcp-syn|tcp-ack) || ip6[40+13]==tcp-rst))"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        if let Some(args) = &ctx.args {
            for (key, value) in parse_module_args(args) {
                match key.as_str() {
                    "send-rst" | "rst" => self.conf.send_rst = arg_bool(&value),
                    "fail-zerowin" | "zero-fail" => self.conf.zero_fail = arg_bool(&value),
                    "record-ttl" | "ttl" => self.conf.record_ttl = arg_bool(&value),
                    "record-ipid" | "ipid" => self.conf.record_ipid = arg_bool(&value),
                    "record-win" | "win" => self.conf.record_win = arg_bool(&value),
                    "record-mss" | "mss" => self.conf.record_mss = arg_bool(&value),
                    other => warn!("tcp-syn: ignoring unknown arg {:?}", other),
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

        let cookie = get_cookie(
            target.ip_them,
            target.port_them,
            target.ip_me,
            target.port_me,
            seed,
        );
        let len = self.templates().tcp_syn_packet(
            target.ip_them,
            target.port_them,
            target.ip_me,
            target.port_me,
            cookie,
            buf,
        );
        event.need_timeout = true;
        (len, false)
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
            }
        } else if recved.parsed.has_tcp_flag(tcp_flags::RST) {
            // looser than the SYN-ACK check on purpose
            if cookie == seqno_me.wrapping_sub(1) || cookie == seqno_me {
                pre.go_dedup = true;
            }
        }
    }

    fn handle(
        &self,
        _th_idx: usize,
        _seed: u64,
        recved: &Received,
        item: &mut OutItem,
        stack: &PacketStack,
        _ft: Option<&FtWheel>,
        _now: u64,
    ) {
        let win_them = recved.parsed.tcp_win;

        if recved.parsed.has_tcp_flag(tcp_flags::SYN | tcp_flags::ACK) {
            item.level = OutputLevel::Success;

            if win_them == 0 {
                item.classification = "fake-open".to_string();
                item.reason = "zerowin".to_string();
                if self.conf.zero_fail {
                    item.level = OutputLevel::Failure;
                }
            } else {
                item.classification = "open".to_string();
                item.reason = "syn-ack".to_string();
            }

            if self.conf.send_rst {
                let seqno_me = recved.parsed.tcp_ackno;
                let seqno_them = recved.parsed.tcp_seqno;
                match stack.get_pktbuf() {
                    Ok(mut pkt) => {
                        let len = self.templates().tcp_packet(
                            recved.parsed.src_ip,
                            recved.parsed.port_src,
                            recved.parsed.dst_ip,
                            recved.parsed.port_dst,
                            seqno_me,
                            seqno_them.wrapping_add(1),
                            tcp_flags::RST,
                            &[],
                            pkt.buf_mut(),
                        );
                        pkt.set_len(len);
                        if let Err(e) = stack.transmit_pktbuf(pkt) {
                            warn!("tcp-syn: dropping RST: {}", e);
                        }
                    }
                    Err(e) => warn!("tcp-syn: no pktbuf for RST: {}", e),
                }
            }

            if self.conf.record_mss {
                if let Some(mss) = tcp_get_mss(recved.frame, &recved.parsed) {
                    item.report.set_int("mss", mss as i64);
                }
            }
        } else {
            item.level = OutputLevel::Failure;
            item.classification = "closed".to_string();
            item.reason = "rst".to_string();
        }

        if self.conf.record_ttl {
            item.report.set_int("ttl", recved.parsed.ip_ttl as i64);
        }
        if self.conf.record_ipid && recved.parsed.src_ip.is_v4() {
            item.report.set_int("ipid", recved.parsed.ip_v4_id as i64);
        }
        if self.conf.record_win {
            item.report.set_int("win", win_them as i64);
        }
    }

    fn timeout(
        &self,
        _seed: u64,
        _event: &ScanTmEvent,
        item: &mut OutItem,
        _stack: &PacketStack,
        _ft: Option<&FtWheel>,
        _now: u64,
    ) {
        item.level = OutputLevel::Failure;
        item.classification = "closed".to_string();
        item.reason = "timeout".to_string();
    }
}
