//! ARP request scan
//!
//! Local-segment host discovery: broadcast who-has requests and report the
//! MAC of every reply naming one of our scanned addresses. Works only on
//! Ethernet datalinks and only for IPv4.

use crate::contract::{ModuleContext, PreHandle, Received, ScanModule, ScanTarget, ScanTmEvent};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{IpProto, OutItem, OutputLevel, Result};
use strobe_network::{Found, PacketStack, TemplateSet};

#[derive(Default)]
pub struct ArpReqScan {
    templates: Option<Arc<TemplateSet>>,
}

impl ArpReqScan {
    pub fn new() -> Self {
        Self::default()
    }

    fn templates(&self) -> &TemplateSet {
        self.templates.as_ref().expect("init before use")
    }
}

impl ScanModule for ArpReqScan {
    fn name(&self) -> &'static str {
        "arp-req"
    }

    fn desc(&self) -> &'static str {
        "Broadcast ARP who-has for every IPv4 target; replies report the MAC."
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "arp"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        Ok(())
    }

    fn transmit(
        &self,
        _seed: u64,
        target: &ScanTarget,
        event: &mut ScanTmEvent,
        buf: &mut [u8],
    ) -> (usize, bool) {
        if target.ip_proto != IpProto::Other || target.ip_them.is_v6() {
            return (0, false);
        }

        let len = self.templates().arp_request_packet(target.ip_them, buf);
        if len > 0 {
            event.need_timeout = true;
            event.port_them = 0;
            event.port_me = 0;
        }
        (len, false)
    }

    fn validate(&self, _seed: u64, recved: &Received, pre: &mut PreHandle) {
        // an ARP reply whose target is our address
        if recved.parsed.found == Found::Arp && recved.parsed.arp_opcode == 2 && recved.is_myip {
            pre.go_record = true;
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
        item.reason = "arp reply".to_string();

        let mac = recved.parsed.arp_sender_mac;
        item.report.set_str(
            "mac",
            format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
        );
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
