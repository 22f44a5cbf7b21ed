//! Scan and probe module contracts
//!
//! A scan module owns one L3/L4 exchange pattern: what the first packet
//! looks like (`transmit`, tx threads), whether a received frame belongs
//! to it and how to dedup it (`validate`, rx thread), what a validated
//! frame means and what to send back (`handle`, handler threads), and what
//! a missing reply means (`timeout`). All hooks run concurrently across
//! threads; modules keep their configuration immutable after `init`.
//!
//! Probe modules supply the L7 payloads that ride on a scan module's
//! transport. The same probe contract serves UDP payloads, ZBanner hellos,
//! and — through the state adapter — multi-message exchanges.

use crate::fast_timeout::FtWheel;
use std::any::Any;
use std::sync::Arc;
use strobe_core::{Address, IpProto, OutItem, Result, SourcePorts};
use strobe_network::{PacketStack, ParsedFrame, TemplateSet};

/// Largest payload a probe may produce in one packet
pub const PROBE_PAYLOAD_MAX: usize = 1024;

/// Default dedup-type discriminator; modules are free to use any integers
pub const DEDUP_TYPE_DEFAULT: u32 = 0;

/// One transmit slot handed to a scan module
#[derive(Debug, Clone, Copy)]
pub struct ScanTarget {
    pub ip_proto: IpProto,
    pub ip_them: Address,
    pub port_them: u16,
    pub ip_me: Address,
    pub port_me: u16,
    /// Multi-probe index within the same target, used by tx in Direct mode
    pub index: u16,
}

/// A pending no-reply event
#[derive(Debug, Clone, Copy)]
pub struct ScanTmEvent {
    pub ip_proto: IpProto,
    pub ip_them: Address,
    pub ip_me: Address,
    pub port_them: u16,
    pub port_me: u16,
    pub dedup_type: u32,
    pub need_timeout: bool,
}

impl ScanTmEvent {
    pub fn from_target(target: &ScanTarget) -> Self {
        Self {
            ip_proto: target.ip_proto,
            ip_them: target.ip_them,
            ip_me: target.ip_me,
            port_them: target.port_them,
            port_me: target.port_me,
            dedup_type: DEDUP_TYPE_DEFAULT,
            need_timeout: false,
        }
    }
}

/// A received frame plus its parse and identity labels
pub struct Received<'a> {
    pub parsed: ParsedFrame,
    pub frame: &'a [u8],
    pub secs: u64,
    pub usecs: u32,
    pub is_myip: bool,
    pub is_myport: bool,
}

impl Received<'_> {
    /// Application payload of the frame, empty when none
    pub fn app_payload(&self) -> &[u8] {
        let start = self.parsed.app_offset;
        let end = start + self.parsed.app_length;
        self.frame.get(start..end).unwrap_or(&[])
    }
}

/// Validate-stage decisions for one frame
#[derive(Debug, Clone, Copy)]
pub struct PreHandle {
    /// Keep the frame at all (record/pcap) or drop it
    pub go_record: bool,
    /// Continue into dedup + handle
    pub go_dedup: bool,
    /// Skip the dedup test but still handle
    pub no_dedup: bool,
    pub dedup_ip_them: Address,
    pub dedup_port_them: u16,
    pub dedup_ip_me: Address,
    pub dedup_port_me: u16,
    pub dedup_type: u32,
}

impl PreHandle {
    pub fn new(parsed: &ParsedFrame) -> Self {
        Self {
            go_record: false,
            go_dedup: false,
            no_dedup: false,
            dedup_ip_them: parsed.src_ip,
            dedup_port_them: parsed.port_src,
            dedup_ip_me: parsed.dst_ip,
            dedup_port_me: parsed.port_dst,
            dedup_type: DEDUP_TYPE_DEFAULT,
        }
    }
}

/// What a scan module needs at startup
pub struct ModuleContext {
    pub templates: Arc<TemplateSet>,
    pub source_ports: SourcePorts,
    pub args: Option<String>,
    pub probe: Option<Arc<dyn ProbeModule>>,
    pub ft_enabled: bool,
}

/// Probe flavor a scan module requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    None,
    Tcp,
    Udp,
    /// Multi-message L7 exchange; only usable under a stateful carrier
    State,
}

/// How a module fans out multiple probes per target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiMode {
    Null,
    /// tx emits `multi_num` packets per target index
    Direct,
    /// tx emits one; the handler emits the rest when the port is open
    IfOpen,
    /// tx emits one; the handler emits the rest after a successful handle
    AfterHandle,
    /// the handler names the next index to probe (1-based)
    DynamicNext,
}

pub trait ScanModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn desc(&self) -> &'static str {
        ""
    }

    fn required_probe_type(&self) -> ProbeType {
        ProbeType::None
    }

    fn support_timeout(&self) -> bool {
        false
    }

    /// Capture filter hint, ANDed with any user filter
    fn bpf_filter(&self) -> &'static str;

    fn init(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Fill `buf` with the packet for this target. Returns the packet
    /// length (0 = nothing to send) and whether another packet is wanted
    /// at the same target index (Direct multi-probe).
    fn transmit(
        &self,
        seed: u64,
        target: &ScanTarget,
        event: &mut ScanTmEvent,
        buf: &mut [u8],
    ) -> (usize, bool);

    /// First look at a frame, on the rx thread: record or drop, and how to
    /// dedup
    fn validate(&self, seed: u64, recved: &Received, pre: &mut PreHandle);

    /// Full handling on a handler thread; may queue response packets on
    /// the stack and re-arm timeouts on the wheel
    #[allow(clippy::too_many_arguments)]
    fn handle(
        &self,
        th_idx: usize,
        seed: u64,
        recved: &Received,
        item: &mut OutItem,
        stack: &PacketStack,
        ft: Option<&FtWheel>,
        now: u64,
    );

    /// A fast-timeout event fired without a reply
    fn timeout(
        &self,
        _seed: u64,
        _event: &ScanTmEvent,
        _item: &mut OutItem,
        _stack: &PacketStack,
        _ft: Option<&FtWheel>,
        _now: u64,
    ) {
    }

    /// Housekeeping, called each handler loop iteration
    fn poll(&self) {}

    /// Short free-form text for the status line
    fn status(&self) -> Option<String> {
        None
    }

    fn close(&self) {}
}

/// Read-only target view handed to probe callbacks
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    pub ip_proto: IpProto,
    pub ip_them: Address,
    pub port_them: u16,
    pub ip_me: Address,
    pub port_me: u16,
    pub cookie: u32,
    pub index: u16,
}

/// Opaque per-connection bag owned by a state probe
pub struct ProbeState(pub Box<dyn Any + Send>);

/// Decision of a state probe after consuming cleartext
pub enum ParseAction {
    /// Wait for more data
    Continue,
    /// Send these application bytes, then keep reading
    Send(Vec<u8>),
    /// Tear the connection down
    Close,
}

pub trait ProbeModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn desc(&self) -> &'static str {
        ""
    }

    fn probe_type(&self) -> ProbeType;

    fn multi_mode(&self) -> MultiMode {
        MultiMode::Null
    }

    /// Number of probes per target in multi modes; the source port block
    /// must span at least this many ports
    fn multi_num(&self) -> u16 {
        1
    }

    fn init(&mut self, _args: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Write the probe payload for this target; returns its length
    fn make_payload(&self, target: &ProbeTarget, buf: &mut [u8]) -> usize;

    /// Length of the payload `make_payload` would produce, needed by
    /// carriers that validate ACK numbers against the payload length
    fn payload_length(&self, target: &ProbeTarget) -> usize {
        let mut buf = [0u8; PROBE_PAYLOAD_MAX];
        self.make_payload(target, &mut buf)
    }

    /// Gate dedup on whether the response looks like ours at all
    fn validate_response(&self, _target: &ProbeTarget, _payload: &[u8]) -> bool {
        true
    }

    /// Classify a response and fill the record. The return value feeds
    /// multi-probe: 0 = done, nonzero = more wanted (for DynamicNext, the
    /// 1-based index of the next probe).
    fn handle_response(
        &self,
        th_idx: usize,
        target: &ProbeTarget,
        payload: &[u8],
        item: &mut OutItem,
    ) -> u16;

    /// No response arrived before the fast timeout
    fn handle_timeout(&self, _target: &ProbeTarget, item: &mut OutItem) -> u16 {
        item.classification = "no-response".to_string();
        item.reason = "timeout".to_string();
        0
    }

    // State-probe surface, only meaningful for `ProbeType::State`

    fn conn_init(&self, _target: &ProbeTarget) -> Option<ProbeState> {
        None
    }

    /// The application-level hello once the carrier is ready
    fn make_hello(&self, _state: &mut ProbeState, target: &ProbeTarget) -> Vec<u8> {
        let mut buf = [0u8; PROBE_PAYLOAD_MAX];
        let len = self.make_payload(target, &mut buf);
        buf[..len].to_vec()
    }

    /// Consume one cleartext chunk from the carrier
    fn parse_response(
        &self,
        _state: &mut ProbeState,
        _target: &ProbeTarget,
        _data: &[u8],
        _item: &mut OutItem,
    ) -> ParseAction {
        ParseAction::Close
    }

    fn conn_close(&self, _state: ProbeState, _target: &ProbeTarget) {}

    fn close(&self) {}
}

/// Split a module argument string like `send-rst,record-ttl,win=1024`
/// into flag/value pairs
pub fn parse_module_args(args: &str) -> Vec<(String, Option<String>)> {
    args.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (s.to_string(), None),
        })
        .collect()
}

/// Truthiness of a module argument value; a bare flag is true
pub fn arg_bool(value: &Option<String>) -> bool {
    match value.as_deref() {
        None => true,
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_module_args() {
        let args = parse_module_args("send-rst, record-ttl ,win=1024,");
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], ("send-rst".to_string(), None));
        assert_eq!(args[1], ("record-ttl".to_string(), None));
        assert_eq!(args[2], ("win".to_string(), Some("1024".to_string())));
    }

    #[test]
    fn test_arg_bool() {
        assert!(arg_bool(&None));
        assert!(arg_bool(&Some("true".to_string())));
        assert!(arg_bool(&Some("1".to_string())));
        assert!(!arg_bool(&Some("false".to_string())));
        assert!(!arg_bool(&Some("0".to_string())));
    }
}
