//! ICMP timestamp scan
//!
//! Like the echo scan but with timestamp requests, which some hosts
//! answer even when echo is filtered. IPv4 only; ICMPv6 has no timestamp
//! message, so v6 targets are skipped silently.

use crate::contract::{ModuleContext, PreHandle, Received, ScanModule, ScanTarget, ScanTmEvent};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{get_cookie, IpProto, OutItem, OutputLevel, Result};
use strobe_network::{Found, PacketStack, TemplateSet};

#[derive(Default)]
pub struct IcmpTimeScan {
    templates: Option<Arc<TemplateSet>>,
}

impl IcmpTimeScan {
    pub fn new() -> Self {
        Self::default()
    }

    fn templates(&self) -> &TemplateSet {
        self.templates.as_ref().expect("init before use")
    }

    fn id_of(cookie: u32) -> u16 {
        ((cookie >> 16) & 0xFF) as u16
    }

    fn seq_of(cookie: u32) -> u16 {
        (cookie & 0xFF) as u16
    }
}

impl ScanModule for IcmpTimeScan {
    fn name(&self) -> &'static str {
        "icmp-time"
    }

    fn desc(&self) -> &'static str {
        "ICMP timestamp sweep, IPv4 only; a timestamp reply marks the host alive."
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "icmp && (icmp[0]==14 && icmp[1]==0)"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        Ok(())
    }

    fn transmit(
        &self,
        seed: u64,
        target: &ScanTarget,
        event: &mut ScanTmEvent,
        buf: &mut [u8],
    ) -> (usize, bool) {
        if target.ip_proto != IpProto::Other || target.ip_them.is_v6() {
            return (0, false);
        }

        let cookie = get_cookie(target.ip_them, 0, target.ip_me, 0, seed);
        let len = self.templates().icmp_timestamp_packet(
            target.ip_them,
            target.ip_me,
            Self::id_of(cookie),
            Self::seq_of(cookie),
            buf,
        );

        event.need_timeout = true;
        event.port_them = 0;
        event.port_me = 0;
        (len, false)
    }

    fn validate(&self, seed: u64, recved: &Received, pre: &mut PreHandle) {
        if recved.parsed.found == Found::Icmp && recved.is_myip && recved.parsed.src_ip.is_v4() {
            pre.go_record = true;
        } else {
            return;
        }

        let cookie = get_cookie(recved.parsed.src_ip, 0, recved.parsed.dst_ip, 0, seed);
        // timestamp reply
        if recved.parsed.icmp_type == 14
            && recved.parsed.icmp_code == 0
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
        _recved: &Received,
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
        item.reason = "timestamp reply".to_string();
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use strobe_core::{Address, SourcePorts};
    use strobe_network::TemplParams;

    fn module() -> IcmpTimeScan {
        let mut module = IcmpTimeScan::new();
        let ctx = ModuleContext {
            templates: Arc::new(TemplateSet::build(&TemplParams {
                src_ipv4: Ipv4Addr::new(10, 0, 0, 1),
                src_ipv6: "2001:db8::100".parse().unwrap(),
                ..TemplParams::default()
            })),
            source_ports: SourcePorts {
                start: 40_000,
                count: 256,
            },
            args: None,
            probe: None,
            ft_enabled: false,
        };
        module.init(&ctx).unwrap();
        module
    }

    #[test]
    fn test_v6_target_skipped_silently() {
        let module = module();
        let target = ScanTarget {
            ip_proto: IpProto::Other,
            ip_them: "2001:db8::9".parse::<Ipv6Addr>().unwrap().into(),
            port_them: 0,
            ip_me: "2001:db8::100".parse::<Ipv6Addr>().unwrap().into(),
            port_me: 0,
            index: 0,
        };
        let mut event = ScanTmEvent::from_target(&target);
        let mut buf = [0u8; 2048];
        let (len, more) = module.transmit(1, &target, &mut event, &mut buf);
        assert_eq!(len, 0);
        assert!(!more);
        assert!(!event.need_timeout);
    }

    #[test]
    fn test_v4_target_emits_request() {
        let module = module();
        let target = ScanTarget {
            ip_proto: IpProto::Other,
            ip_them: Address::V4(Ipv4Addr::new(192, 0, 2, 1)),
            port_them: 0,
            ip_me: Address::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port_me: 0,
            index: 0,
        };
        let mut event = ScanTmEvent::from_target(&target);
        let mut buf = [0u8; 2048];
        let (len, _) = module.transmit(1, &target, &mut event, &mut buf);
        assert!(len > 0);
        assert!(event.need_timeout);
        // type 13 at the ICMP offset
        assert_eq!(buf[34], 13);
    }
}
