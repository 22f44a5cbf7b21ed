//! Empty-datagram UDP probe
//!
//! Sends nothing but the header and treats any response as proof of an
//! open port. Useful as a default when no service-specific probe fits.

use crate::contract::{ProbeModule, ProbeTarget, ProbeType};
use strobe_core::{OutItem, OutputLevel};

const BANNER_MAX: usize = 2048;

#[derive(Debug, Default)]
pub struct NullUdpProbe;

impl NullUdpProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProbeModule for NullUdpProbe {
    fn name(&self) -> &'static str {
        "null-udp"
    }

    fn desc(&self) -> &'static str {
        "Empty datagram; any response marks the port open."
    }

    fn probe_type(&self) -> ProbeType {
        ProbeType::Udp
    }

    fn make_payload(&self, _target: &ProbeTarget, _buf: &mut [u8]) -> usize {
        0
    }

    fn handle_response(
        &self,
        _th_idx: usize,
        _target: &ProbeTarget,
        payload: &[u8],
        item: &mut OutItem,
    ) -> u16 {
        item.level = OutputLevel::Success;
        item.classification = "open".to_string();
        item.reason = "udp-response".to_string();
        if !payload.is_empty() {
            item.report
                .set_bytes("banner", payload[..payload.len().min(BANNER_MAX)].to_vec());
        }
        0
    }

    fn handle_timeout(&self, _target: &ProbeTarget, item: &mut OutItem) -> u16 {
        item.classification = "no-response".to_string();
        item.reason = "timeout".to_string();
        0
    }
}
