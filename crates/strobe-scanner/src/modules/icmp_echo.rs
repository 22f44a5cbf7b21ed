//! ICMP echo (ping) scan
//!
//! Host discovery without ports. The echo id/seq pair is derived from the
//! cookie of the port-less tuple, so a reply proves the host answered our
//! probe rather than someone else's.

use crate::contract::{
    arg_bool, parse_module_args, ModuleContext, PreHandle, Received, ScanModule, ScanTarget,
    ScanTmEvent,
};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{get_cookie, Address, IpProto, OutItem, OutputLevel, Result};
use strobe_network::{Found, PacketStack, TemplateSet};
use tracing::warn;

#[derive(Debug, Default, Clone)]
struct IcmpEchoConf {
    record_ttl: bool,
    record_ipid: bool,
}

#[derive(Default)]
pub struct IcmpEchoScan {
    templates: Option<Arc<TemplateSet>>,
    conf: IcmpEchoConf,
}

impl IcmpEchoScan {
    pub fn new() -> Self {
        Self::default()
    }

    fn templates(&self) -> &TemplateSet {
        self.templates.as_ref().expect("init before use")
    }

    // id/seq carry only 8 cookie bits each; the pair plus the source
    // address is still selective enough for scan-rate traffic
    fn id_of(cookie: u32) -> u16 {
        ((cookie >> 16) & 0xFF) as u16
    }

    fn seq_of(cookie: u32) -> u16 {
        (cookie & 0xFF) as u16
    }
}

impl ScanModule for IcmpEchoScan {
    fn name(&self) -> &'static str {
        "icmp-echo"
    }

    fn desc(&self) -> &'static str {
        "ICMP ping sweep; an echo reply marks the host alive. Needs no ports."
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "(icmp && (icmp[0]==0 && icmp[1]==0)) || (icmp6 && (icmp6[0]==129 && icmp6[1]==0))"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        if let Some(args) = &ctx.args {
            for (key, value) in parse_module_args(args) {
                match key.as_str() {
                    "record-ttl" | "ttl" => self.conf.record_ttl = arg_bool(&value),
                    "record-ipid" | "ipid" => self.conf.record_ipid = arg_bool(&value),
                    other => warn!("icmp-echo: ignoring unknown arg {:?}", other),
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
        if target.ip_proto != IpProto::Other {
            return (0, false);
        }

        let cookie = get_cookie(target.ip_them, 0, target.ip_me, 0, seed);
        let ip_id = (cookie ^ seed as u32) as u16;
        let len = self.templates().icmp_echo_packet(
            target.ip_them,
            target.ip_me,
            Self::id_of(cookie),
            Self::seq_of(cookie),
            ip_id,
            buf,
        );

        event.need_timeout = true;
        event.port_them = 0;
        event.port_me = 0;
        (len, false)
    }

    fn validate(&self, seed: u64, recved: &Received, pre: &mut PreHandle) {
        if recved.parsed.found == Found::Icmp && recved.is_myip {
            pre.go_record = true;
        } else {
            return;
        }

        let cookie = get_cookie(recved.parsed.src_ip, 0, recved.parsed.dst_ip, 0, seed);
        let reply = match recved.parsed.src_ip {
            Address::V4(_) => recved.parsed.icmp_type == 0 && recved.parsed.icmp_code == 0,
            Address::V6(_) => recved.parsed.icmp_type == 129 && recved.parsed.icmp_code == 0,
        };
        if reply
            && recved.parsed.icmp_id == Self::id_of(cookie)
            && recved.parsed.icmp_seq == Self::seq_of(cookie)
        {
            pre.go_dedup = true;
            pre.dedup_port_them = 0;
            pre.dedup_port_me = 0;
        }
    }

    fn handle(
        &self,
        _th_idx: usize,
        _seed: u64,
        recved: &Received,
        item: &mut OutItem,
        _stack: &PacketStack,
        _ft: Option<&FtWheel>,
        _now: u64,
    ) {
        item.port_them = 0;
        item.port_me = 0;
        item.no_port = true;
        item.level = OutputLevel::Success;
        item.classification = "alive".to_string();
        item.reason = "echo reply".to_string();

        if self.conf.record_ttl {
            item.report.set_int("ttl", recved.parsed.ip_ttl as i64);
        }
        if self.conf.record_ipid && recved.parsed.src_ip.is_v4() {
            item.report.set_int("ipid", recved.parsed.ip_v4_id as i64);
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
        item.no_port = true;
        item.level = OutputLevel::Failure;
        item.classification = "down".to_string();
        item.reason = "timeout".to_string();
    }
}
