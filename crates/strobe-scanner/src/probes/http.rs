//! Minimal HTTP GET probe
//!
//! Rides on zbanner: the payload is a bare HTTP/1.0 request, the first
//! response packet is the banner. Anything that answers is recorded;
//! responses that actually speak HTTP classify as `serving`.

use crate::contract::{ProbeModule, ProbeTarget, ProbeType};
use strobe_core::{OutItem, OutputLevel};

/// Longest banner copied into a record
const BANNER_MAX: usize = 2048;

const REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

#[derive(Debug, Default)]
pub struct HttpProbe;

impl HttpProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProbeModule for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
    }

    fn desc(&self) -> &'static str {
        "Sends a minimal HTTP/1.0 GET and records the first response packet."
    }

    fn probe_type(&self) -> ProbeType {
        ProbeType::Tcp
    }

    fn make_payload(&self, _target: &ProbeTarget, buf: &mut [u8]) -> usize {
        buf[..REQUEST.len()].copy_from_slice(REQUEST);
        REQUEST.len()
    }

    fn handle_response(
        &self,
        _th_idx: usize,
        _target: &ProbeTarget,
        payload: &[u8],
        item: &mut OutItem,
    ) -> u16 {
        item.level = OutputLevel::Success;
        if payload.starts_with(b"HTTP/") {
            item.classification = "serving".to_string();
            item.reason = "http-banner".to_string();
        } else {
            item.classification = "responding".to_string();
            item.reason = "banner".to_string();
        }
        let banner = &payload[..payload.len().min(BANNER_MAX)];
        item.report.set_bytes("banner", banner.to_vec());
        0
    }

    fn handle_timeout(&self, _target: &ProbeTarget, item: &mut OutItem) -> u16 {
        item.level = OutputLevel::Failure;
        item.classification = "no-banner".to_string();
        item.reason = "timeout".to_string();
        0
    }
}
