//! Reference state probe
//!
//! The smallest possible multi-message probe: say one line, record
//! whatever comes back, close. Exists to exercise the state-probe surface
//! (conn_init / make_hello / parse_response / conn_close) that the TLS
//! adapter multiplexes.

use crate::contract::{ParseAction, ProbeModule, ProbeState, ProbeTarget, ProbeType};
use strobe_core::{OutItem, OutputLevel};

const BANNER_MAX: usize = 2048;

struct EchoConn {
    received: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct EchoStateProbe;

impl EchoStateProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProbeModule for EchoStateProbe {
    fn name(&self) -> &'static str {
        "echo-state"
    }

    fn desc(&self) -> &'static str {
        "Says one line over the carrier and records the first reply."
    }

    fn probe_type(&self) -> ProbeType {
        ProbeType::State
    }

    fn make_payload(&self, _target: &ProbeTarget, buf: &mut [u8]) -> usize {
        let hello = b"HELLO\r\n";
        buf[..hello.len()].copy_from_slice(hello);
        hello.len()
    }

    fn handle_response(
        &self,
        _th_idx: usize,
        _target: &ProbeTarget,
        payload: &[u8],
        item: &mut OutItem,
    ) -> u16 {
        item.level = OutputLevel::Success;
        item.classification = "responding".to_string();
        item.reason = "echo".to_string();
        item.report
            .set_bytes("banner", payload[..payload.len().min(BANNER_MAX)].to_vec());
        0
    }

    fn conn_init(&self, _target: &ProbeTarget) -> Option<ProbeState> {
        Some(ProbeState(Box::new(EchoConn { received: Vec::new() })))
    }

    fn make_hello(&self, _state: &mut ProbeState, target: &ProbeTarget) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let len = self.make_payload(target, &mut buf);
        buf[..len].to_vec()
    }

    fn parse_response(
        &self,
        state: &mut ProbeState,
        target: &ProbeTarget,
        data: &[u8],
        item: &mut OutItem,
    ) -> ParseAction {
        let conn = state
            .0
            .downcast_mut::<EchoConn>()
            .expect("state owned by this probe");
        conn.received.extend_from_slice(data);
        self.handle_response(0, target, &conn.received, item);
        ParseAction::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use strobe_core::{Address, IpProto};

    fn target() -> ProbeTarget {
        ProbeTarget {
            ip_proto: IpProto::Tcp,
            ip_them: Address::V4(Ipv4Addr::new(198, 51, 100, 5)),
            port_them: 443,
            ip_me: Address::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port_me: 40_000,
            cookie: 0,
            index: 0,
        }
    }

    #[test]
    fn test_hello_then_close_on_reply() {
        let probe = EchoStateProbe::new();
        let mut state = probe.conn_init(&target()).unwrap();
        assert_eq!(probe.make_hello(&mut state, &target()), b"HELLO\r\n");

        let mut item = OutItem::new(IpProto::Tcp, target().ip_them, 443, target().ip_me, 40_000);
        let action = probe.parse_response(&mut state, &target(), b"WORLD\r\n", &mut item);
        assert!(matches!(action, ParseAction::Close));
        assert_eq!(item.level, OutputLevel::Success);
        probe.conn_close(state, &target());
    }
}
