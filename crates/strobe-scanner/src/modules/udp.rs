//! UDP scan
//!
//! The probe module crafts the payload, so one scan module covers DNS,
//! NTP, SNMP, and anything else that answers a datagram. A UDP response
//! to our source port block is handed to the probe for validation and
//! classification; an ICMP port-unreachable quoting our probe closes the
//! port; silence fires the fast timeout.

use crate::contract::{
    arg_bool, parse_module_args, ModuleContext, MultiMode, PreHandle, ProbeModule, ProbeTarget,
    ProbeType, Received, ScanModule, ScanTarget, ScanTmEvent, PROBE_PAYLOAD_MAX,
};
use crate::fast_timeout::FtWheel;
use std::sync::Arc;
use strobe_core::{get_cookie, Address, IpProto, OutItem, OutputLevel, Result, SourcePorts};
use strobe_network::{Found, IcmpOriginal, PacketStack, TemplateSet};
use tracing::warn;

#[derive(Debug, Default, Clone)]
struct UdpConf {
    record_ttl: bool,
    record_ipid: bool,
}

#[derive(Default)]
pub struct UdpScan {
    templates: Option<Arc<TemplateSet>>,
    probe: Option<Arc<dyn ProbeModule>>,
    source_ports: SourcePorts,
    conf: UdpConf,
}

impl UdpScan {
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
        self.probe.as_ref().expect("udp scan requires a probe").as_ref()
    }

    fn probe_target(
        &self,
        seed: u64,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
    ) -> ProbeTarget {
        ProbeTarget {
            ip_proto: IpProto::Udp,
            ip_them,
            port_them,
            ip_me,
            port_me,
            cookie: get_cookie(ip_them, port_them, ip_me, port_me, seed),
            index: self.source_ports.index_of(port_me),
        }
    }

    /// An ICMP unreachable that quotes one of our own probes
    fn our_unreachable(&self, recved: &Received) -> Option<IcmpOriginal> {
        if recved.parsed.found != Found::Icmp || !recved.is_myip {
            return None;
        }
        let port_unreachable = match recved.parsed.src_ip {
            Address::V4(_) => recved.parsed.icmp_type == 3 && recved.parsed.icmp_code == 3,
            Address::V6(_) => recved.parsed.icmp_type == 1 && recved.parsed.icmp_code == 4,
        };
        if !port_unreachable {
            return None;
        }
        let orig = recved.parsed.icmp_original?;
        if orig.ip_proto == IpProto::Udp
            && orig.src_ip == recved.parsed.dst_ip
            && self.source_ports.contains(orig.port_src)
        {
            Some(orig)
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stack_follow_up(
        &self,
        seed: u64,
        stack: &PacketStack,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        index: u16,
        ft: Option<&FtWheel>,
        now: u64,
    ) {
        let src_port = self.source_ports.start + index;
        let ptarget = self.probe_target(seed, ip_them, port_them, ip_me, src_port);
        let mut payload = [0u8; PROBE_PAYLOAD_MAX];
        let payload_len = self.probe().make_payload(&ptarget, &mut payload);

        match stack.get_pktbuf() {
            Ok(mut pkt) => {
                let len = self.templates().udp_packet(
                    ip_them,
                    port_them,
                    ip_me,
                    src_port,
                    &payload[..payload_len],
                    pkt.buf_mut(),
                );
                pkt.set_len(len);
                if let Err(e) = stack.transmit_pktbuf(pkt) {
                    warn!("udp: dropping follow-up probe: {}", e);
                    return;
                }
            }
            Err(e) => {
                warn!("udp: no pktbuf for follow-up probe: {}", e);
                return;
            }
        }

        if let Some(ft) = ft {
            ft.add(
                ScanTmEvent {
                    ip_proto: IpProto::Udp,
                    ip_them,
                    ip_me,
                    port_them,
                    port_me: src_port,
                    dedup_type: 0,
                    need_timeout: true,
                },
                now,
            );
        }
    }
}

impl ScanModule for UdpScan {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn desc(&self) -> &'static str {
        "Sends a probe-crafted datagram; the probe classifies responses, \
         ICMP port-unreachable closes the port."
    }

    fn required_probe_type(&self) -> ProbeType {
        ProbeType::Udp
    }

    fn support_timeout(&self) -> bool {
        true
    }

    fn bpf_filter(&self) -> &'static str {
        "udp || icmp || icmp6"
    }

    fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.templates = Some(ctx.templates.clone());
        self.probe = ctx.probe.clone();
        self.source_ports = ctx.source_ports;

        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| strobe_core::Error::Config("udp scan requires --probe-module".into()))?;
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
                    "record-ttl" | "ttl" => self.conf.record_ttl = arg_bool(&value),
                    "record-ipid" | "ipid" => self.conf.record_ipid = arg_bool(&value),
                    other => warn!("udp: ignoring unknown arg {:?}", other),
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
        if target.ip_proto != IpProto::Udp {
            return (0, false);
        }

        let src_port = self.source_ports.start + target.index;
        let ptarget = self.probe_target(seed, target.ip_them, target.port_them, target.ip_me, src_port);
        let mut payload = [0u8; PROBE_PAYLOAD_MAX];
        let payload_len = self.probe().make_payload(&ptarget, &mut payload);

        let len = self.templates().udp_packet(
            target.ip_them,
            target.port_them,
            target.ip_me,
            src_port,
            &payload[..payload_len],
            buf,
        );

        event.need_timeout = true;
        event.port_me = src_port;

        let more = self.probe().multi_mode() == MultiMode::Direct
            && target.index + 1 < self.probe().multi_num();
        (len, more)
    }

    fn validate(&self, seed: u64, recved: &Received, pre: &mut PreHandle) {
        if recved.parsed.found == Found::Udp && recved.is_myip && recved.is_myport {
            pre.go_record = true;
            let ptarget = self.probe_target(
                seed,
                recved.parsed.src_ip,
                recved.parsed.port_src,
                recved.parsed.dst_ip,
                recved.parsed.port_dst,
            );
            if self.probe().validate_response(&ptarget, recved.app_payload()) {
                pre.go_dedup = true;
            }
        } else if let Some(orig) = self.our_unreachable(recved) {
            pre.go_record = true;
            pre.go_dedup = true;
            // dedup against the probed target, not the ICMP sender
            pre.dedup_ip_them = orig.dst_ip;
            pre.dedup_port_them = orig.port_dst;
            pre.dedup_ip_me = orig.src_ip;
            pre.dedup_port_me = orig.port_src;
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
        if recved.parsed.found == Found::Udp {
            let ip_them = recved.parsed.src_ip;
            let port_them = recved.parsed.port_src;
            let ip_me = recved.parsed.dst_ip;
            let port_me = recved.parsed.port_dst;
            let ptarget = self.probe_target(seed, ip_them, port_them, ip_me, port_me);
            let is_multi =
                self.probe()
                    .handle_response(th_idx, &ptarget, recved.app_payload(), item);

            if self.conf.record_ttl {
                item.report.set_int("ttl", recved.parsed.ip_ttl as i64);
            }
            if self.conf.record_ipid && recved.parsed.src_ip.is_v4() {
                item.report.set_int("ipid", recved.parsed.ip_v4_id as i64);
            }

            match self.probe().multi_mode() {
                MultiMode::AfterHandle
                    if is_multi != 0 && port_me == self.source_ports.start =>
                {
                    for idx in 1..self.probe().multi_num() {
                        self.stack_follow_up(seed, stack, ip_them, port_them, ip_me, idx, ft, now);
                    }
                }
                MultiMode::DynamicNext if is_multi != 0 => {
                    self.stack_follow_up(
                        seed,
                        stack,
                        ip_them,
                        port_them,
                        ip_me,
                        is_multi - 1,
                        ft,
                        now,
                    );
                }
                _ => {}
            }
        } else if let Some(orig) = self.our_unreachable(recved) {
            // report the probed target, not the router that answered
            item.ip_them = orig.dst_ip;
            item.port_them = orig.port_dst;
            item.ip_me = orig.src_ip;
            item.port_me = orig.port_src;
            item.ip_proto = IpProto::Udp;
            item.level = OutputLevel::Failure;
            item.classification = "closed".to_string();
            item.reason = "port-unreachable".to_string();
        }
    }

    fn timeout(
        &self,
        seed: u64,
        event: &ScanTmEvent,
        item: &mut OutItem,
        _stack: &PacketStack,
        _ft: Option<&FtWheel>,
        _now: u64,
    ) {
        let ptarget = self.probe_target(
            seed,
            event.ip_them,
            event.port_them,
            event.ip_me,
            event.port_me,
        );
        item.level = OutputLevel::Failure;
        self.probe().handle_timeout(&ptarget, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::NullUdpProbe;
    use std::net::Ipv4Addr;
    use strobe_network::{preprocess_frame, LinkType, SourceIdentity, TemplParams};

    fn them() -> Address {
        Address::V4(Ipv4Addr::new(198, 51, 100, 5))
    }

    fn me() -> Address {
        Address::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn source_ports() -> SourcePorts {
        SourcePorts {
            start: 40_000,
            count: 256,
        }
    }

    fn module() -> UdpScan {
        let mut module = UdpScan::new();
        let ctx = ModuleContext {
            templates: Arc::new(TemplateSet::build(&TemplParams {
                src_ipv4: Ipv4Addr::new(10, 0, 0, 1),
                src_ipv6: "2001:db8::100".parse().unwrap(),
                ..TemplParams::default()
            })),
            source_ports: source_ports(),
            args: None,
            probe: Some(Arc::new(NullUdpProbe::new())),
            ft_enabled: true,
        };
        module.init(&ctx).unwrap();
        module
    }

    fn received(frame: &[u8]) -> Received<'_> {
        Received {
            parsed: preprocess_frame(frame, LinkType::Ethernet).unwrap(),
            frame,
            secs: 0,
            usecs: 0,
            is_myip: true,
            is_myport: true,
        }
    }

    #[test]
    fn test_transmit_uses_probe_payload() {
        let module = module();
        let target = ScanTarget {
            ip_proto: IpProto::Udp,
            ip_them: them(),
            port_them: 53,
            ip_me: me(),
            port_me: 0,
            index: 0,
        };
        let mut event = ScanTmEvent::from_target(&target);
        let mut buf = [0u8; 2048];
        let (len, more) = module.transmit(9, &target, &mut event, &mut buf);
        assert!(len > 0);
        assert!(!more);
        assert!(event.need_timeout);
        assert_eq!(event.port_me, 40_000);

        let parsed = preprocess_frame(&buf[..len], LinkType::Ethernet).unwrap();
        assert_eq!(parsed.found, Found::Udp);
        assert_eq!(parsed.port_src, 40_000);
        assert_eq!(parsed.port_dst, 53);
    }

    #[test]
    fn test_udp_response_reported_by_probe() {
        let module = module();
        let responder = TemplateSet::build(&TemplParams {
            src_ipv4: Ipv4Addr::new(198, 51, 100, 5),
            src_ipv6: "2001:db8::5".parse().unwrap(),
            ..TemplParams::default()
        });
        let mut buf = [0u8; 2048];
        let len = responder.udp_packet(me(), 40_000, them(), 53, b"answer", &mut buf);
        let recved = received(&buf[..len]);

        let mut pre = PreHandle::new(&recved.parsed);
        module.validate(9, &recved, &mut pre);
        assert!(pre.go_record);
        assert!(pre.go_dedup);

        let stack = PacketStack::new(
            SourceIdentity {
                ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
                ipv6: None,
                ports: source_ports(),
            },
            16,
        );
        let mut item = OutItem::new(IpProto::Udp, them(), 53, me(), 40_000);
        module.handle(0, 9, &recved, &mut item, &stack, None, 0);
        assert_eq!(item.level, OutputLevel::Success);
    }

    #[test]
    fn test_icmp_unreachable_closes_port() {
        let module = module();

        // our probe quoted inside a port-unreachable from the target
        let our = TemplateSet::build(&TemplParams {
            src_ipv4: Ipv4Addr::new(10, 0, 0, 1),
            src_ipv6: "2001:db8::100".parse().unwrap(),
            ..TemplParams::default()
        });
        let mut probe = [0u8; 2048];
        let probe_len = our.udp_packet(them(), 9999, me(), 40_000, b"probe", &mut probe);
        let inner = &probe[14..probe_len];

        let mut frame = Vec::new();
        frame.extend_from_slice(&[2, 0, 0, 1, 2, 3]);
        frame.extend_from_slice(&[2, 0, 0, 9, 9, 9]);
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let quoted = inner.len().min(28);
        let total = 20 + 8 + quoted;
        let mut ip = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0];
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip.extend_from_slice(&[198, 51, 100, 5]);
        ip.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&[3, 3, 0, 0, 0, 0, 0, 0]);
        frame.extend_from_slice(&inner[..quoted]);

        let recved = Received {
            parsed: preprocess_frame(&frame, LinkType::Ethernet).unwrap(),
            frame: &frame,
            secs: 0,
            usecs: 0,
            is_myip: true,
            is_myport: false, // ICMP has no port of ours
        };

        let mut pre = PreHandle::new(&recved.parsed);
        module.validate(9, &recved, &mut pre);
        assert!(pre.go_dedup);
        assert_eq!(pre.dedup_ip_them, them());
        assert_eq!(pre.dedup_port_them, 9999);

        let stack = PacketStack::new(
            SourceIdentity {
                ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
                ipv6: None,
                ports: source_ports(),
            },
            16,
        );
        let mut item = OutItem::new(IpProto::Other, recved.parsed.src_ip, 0, me(), 0);
        module.handle(0, 9, &recved, &mut item, &stack, None, 0);
        assert_eq!(item.classification, "closed");
        assert_eq!(item.reason, "port-unreachable");
        assert_eq!(item.ip_them, them());
        assert_eq!(item.port_them, 9999);
    }

    #[test]
    fn test_timeout_defers_to_probe() {
        let module = module();
        let stack = PacketStack::new(
            SourceIdentity {
                ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
                ipv6: None,
                ports: source_ports(),
            },
            16,
        );
        let event = ScanTmEvent {
            ip_proto: IpProto::Udp,
            ip_them: them(),
            ip_me: me(),
            port_them: 53,
            port_me: 40_000,
            dedup_type: 0,
            need_timeout: true,
        };
        let mut item = OutItem::new(IpProto::Udp, them(), 53, me(), 40_000);
        module.timeout(9, &event, &mut item, &stack, None, 0);
        assert_eq!(item.level, OutputLevel::Failure);
        assert_eq!(item.reason, "timeout");
    }
}
