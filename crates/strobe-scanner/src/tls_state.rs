//! TLS state adapter
//!
//! Lets a state probe carry its exchange over TLS while the transport
//! underneath stays stateless. The adapter owns a user-space TLS session
//! with memory-BIO semantics — wire bytes are fed in, wire bytes are
//! drained out, nothing ever touches a socket — and pumps a four-state
//! machine around it:
//!
//! - `Handshake`: push wire bytes through the session until the handshake
//!   completes, draining any produced flight back toward the wire.
//! - `SayHello`: encrypt the subprobe's application hello.
//! - `RecvData`: decrypt inbound records into a growable scratch buffer
//!   and hand each cleartext chunk to the subprobe; the subprobe may
//!   answer (re-encrypted) or close.
//! - `NeedClose`: emit whatever is pending and stop.
//!
//! Any TLS error moves to `NeedClose`. The scratch buffer starts at 4 KiB
//! and doubles up to a cap; a single drain is bounded to 16 KiB so one
//! chatty peer cannot stall the handler.

use crate::contract::{ParseAction, ProbeModule, ProbeState, ProbeTarget, ProbeType};
use std::io::{Read, Write};
use std::sync::Arc;
use strobe_core::{Error, OutItem, OutputLevel, Result};
use tracing::{debug, warn};

/// Per-iteration limit on bytes pulled out of the session
pub const TLS_DRAIN_LIMIT: usize = 16_384;
/// Initial scratch buffer size
pub const TLS_DATA_INIT_SIZE: usize = 4096;
/// Default scratch buffer cap
pub const TLS_DATA_MAX_SIZE: usize = 1024 * 1024;

/// Adapter state, distinct from the TLS library's own handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TspState {
    Handshake,
    SayHello,
    RecvData,
    NeedClose,
}

/// Negotiated-session facts, for optional INFO records
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    pub version: Option<String>,
    pub cipher: Option<String>,
    pub peer_certs: Vec<Vec<u8>>,
}

/// Memory-BIO style TLS session. Any library exposing these semantics
/// works; the production implementation is [`RustlsSession`].
pub trait TlsSession: Send {
    /// Push wire bytes into the session and process them
    fn feed_incoming(&mut self, data: &[u8]) -> Result<()>;

    /// Pull pending wire bytes, at most `limit`, appending to `out`
    fn drain_outgoing(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize>;

    /// Encrypt application data
    fn send_app(&mut self, data: &[u8]) -> Result<()>;

    /// Decrypt buffered application data, appending to `out`
    fn recv_app(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize>;

    fn is_handshaking(&self) -> bool;

    fn info(&self) -> TlsSessionInfo;
}

/// What one `feed` produced
#[derive(Debug, Default)]
pub struct TlsConnOutput {
    /// Wire bytes to transmit
    pub outbound: Vec<u8>,
    /// Optional INFO records about the session
    pub records: Vec<OutItem>,
    /// The connection is finished; tear down the carrier
    pub closed: bool,
}

/// Which negotiated facts become INFO records
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsDumpConfig {
    pub version: bool,
    pub cipher: bool,
    pub cert: bool,
    /// Write session secrets to `SSLKEYLOGFILE` for offline decryption
    pub keylog: bool,
}

/// One TLS-wrapped exchange, owned by the handler thread that opened it
pub struct TlsConn<S: TlsSession> {
    session: S,
    state: TspState,
    substate: ProbeState,
    scratch: Vec<u8>,
    scratch_cap: usize,
    dump: TlsDumpConfig,
    dumped_info: bool,
}

impl<S: TlsSession> TlsConn<S> {
    pub fn open(
        session: S,
        probe: &dyn ProbeModule,
        target: &ProbeTarget,
        dump: TlsDumpConfig,
    ) -> Result<Self> {
        let substate = probe
            .conn_init(target)
            .ok_or_else(|| Error::Probe("subprobe refused the connection".to_string()))?;
        Ok(Self {
            session,
            state: TspState::Handshake,
            substate,
            scratch: Vec::with_capacity(TLS_DATA_INIT_SIZE),
            scratch_cap: TLS_DATA_MAX_SIZE,
            dump,
            dumped_info: false,
        })
    }

    pub fn state(&self) -> TspState {
        self.state
    }

    /// Initial flight (the ClientHello), before any peer bytes exist
    pub fn start(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.session.drain_outgoing(&mut out, TLS_DRAIN_LIMIT)?;
        Ok(out)
    }

    fn emit_session_records(&mut self, target: &ProbeTarget, out: &mut TlsConnOutput) {
        if self.dumped_info {
            return;
        }
        self.dumped_info = true;
        let info = self.session.info();

        let mut record = |key: &str, value: strobe_core::ReportValue| {
            let mut item = OutItem::new(
                target.ip_proto,
                target.ip_them,
                target.port_them,
                target.ip_me,
                target.port_me,
            );
            item.level = OutputLevel::Info;
            item.classification = "tls-session".to_string();
            item.reason = "handshake-done".to_string();
            match value {
                strobe_core::ReportValue::Str(s) => item.report.set_str(key, s),
                strobe_core::ReportValue::Bytes(b) => item.report.set_bytes(key, b),
                _ => {}
            }
            out.records.push(item);
        };

        if self.dump.version {
            if let Some(version) = info.version {
                record("version", strobe_core::ReportValue::Str(version));
            }
        }
        if self.dump.cipher {
            if let Some(cipher) = info.cipher {
                record("cipher", strobe_core::ReportValue::Str(cipher));
            }
        }
        if self.dump.cert {
            for cert in info.peer_certs {
                record("cert", strobe_core::ReportValue::Bytes(cert));
            }
        }
    }

    /// Feed wire bytes from the carrier and run the state machine until it
    /// needs more input
    pub fn feed(
        &mut self,
        probe: &dyn ProbeModule,
        target: &ProbeTarget,
        wire: &[u8],
        item: &mut OutItem,
    ) -> TlsConnOutput {
        let mut out = TlsConnOutput::default();

        if self.state == TspState::NeedClose {
            out.closed = true;
            return out;
        }

        if let Err(e) = self.session.feed_incoming(wire) {
            debug!("tls adapter: feed failed: {}", e);
            self.state = TspState::NeedClose;
        }

        loop {
            match self.state {
                TspState::Handshake => {
                    if let Err(e) = self.session.drain_outgoing(&mut out.outbound, TLS_DRAIN_LIMIT)
                    {
                        warn!("tls adapter: drain failed in handshake: {}", e);
                        self.state = TspState::NeedClose;
                        continue;
                    }
                    if self.session.is_handshaking() {
                        // need more bytes from the wire
                        return out;
                    }
                    self.emit_session_records(target, &mut out);
                    self.state = TspState::SayHello;
                }
                TspState::SayHello => {
                    let hello = probe.make_hello(&mut self.substate, target);
                    if !hello.is_empty() {
                        if let Err(e) = self.session.send_app(&hello) {
                            warn!("tls adapter: hello failed: {}", e);
                            self.state = TspState::NeedClose;
                            continue;
                        }
                        if let Err(e) =
                            self.session.drain_outgoing(&mut out.outbound, TLS_DRAIN_LIMIT)
                        {
                            warn!("tls adapter: drain failed after hello: {}", e);
                            self.state = TspState::NeedClose;
                            continue;
                        }
                    }
                    self.state = TspState::RecvData;
                }
                TspState::RecvData => {
                    self.scratch.clear();
                    while self.scratch.len() < self.scratch_cap {
                        match self.session.recv_app(&mut self.scratch, TLS_DRAIN_LIMIT) {
                            Ok(0) => break,
                            Ok(_) => {}
                            Err(e) => {
                                debug!("tls adapter: recv failed: {}", e);
                                self.state = TspState::NeedClose;
                                break;
                            }
                        }
                    }
                    if self.state == TspState::NeedClose {
                        continue;
                    }
                    if self.scratch.is_empty() {
                        // nothing decrypted; wait for more wire bytes
                        return out;
                    }

                    let chunk = std::mem::take(&mut self.scratch);
                    match probe.parse_response(&mut self.substate, target, &chunk, item) {
                        ParseAction::Continue => {}
                        ParseAction::Send(reply) => {
                            if let Err(e) = self.session.send_app(&reply) {
                                warn!("tls adapter: app send failed: {}", e);
                                self.state = TspState::NeedClose;
                            } else if let Err(e) =
                                self.session.drain_outgoing(&mut out.outbound, TLS_DRAIN_LIMIT)
                            {
                                warn!("tls adapter: drain failed after app send: {}", e);
                                self.state = TspState::NeedClose;
                            }
                        }
                        ParseAction::Close => self.state = TspState::NeedClose,
                    }
                    self.scratch = Vec::with_capacity(TLS_DATA_INIT_SIZE);
                }
                TspState::NeedClose => {
                    let _ = self.session.drain_outgoing(&mut out.outbound, TLS_DRAIN_LIMIT);
                    out.closed = true;
                    return out;
                }
            }
        }
    }

    /// Hand the substate back to the probe at teardown
    pub fn close(self, probe: &dyn ProbeModule, target: &ProbeTarget) {
        probe.conn_close(self.substate, target);
    }
}

// ---------------------------------------------------------------------------
// rustls-backed session

struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        // a scanner records certificates, it does not trust them
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// [`TlsSession`] over a rustls client connection
pub struct RustlsSession {
    conn: rustls::ClientConnection,
}

impl RustlsSession {
    pub fn new(server_name: &str, keylog: bool) -> Result<Self> {
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        if keylog {
            config.key_log = Arc::new(rustls::KeyLogFile::new());
        }
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| Error::Config(format!("invalid TLS server name: {}", e)))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), name)
            .map_err(|e| Error::Probe(format!("TLS client setup failed: {}", e)))?;
        Ok(Self { conn })
    }
}

impl TlsSession for RustlsSession {
    fn feed_incoming(&mut self, data: &[u8]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(data);
        while cursor.position() < data.len() as u64 {
            let read = self
                .conn
                .read_tls(&mut cursor)
                .map_err(|e| Error::Probe(format!("TLS read: {}", e)))?;
            if read == 0 {
                break;
            }
            self.conn
                .process_new_packets()
                .map_err(|e| Error::Probe(format!("TLS record: {}", e)))?;
        }
        Ok(())
    }

    fn drain_outgoing(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
        let start = out.len();
        while self.conn.wants_write() && out.len() - start < limit {
            self.conn
                .write_tls(out)
                .map_err(|e| Error::Probe(format!("TLS write: {}", e)))?;
        }
        Ok(out.len() - start)
    }

    fn send_app(&mut self, data: &[u8]) -> Result<()> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| Error::Probe(format!("TLS app write: {}", e)))
    }

    fn recv_app(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        while total < limit {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Probe(format!("TLS app read: {}", e))),
            }
        }
        Ok(total)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn info(&self) -> TlsSessionInfo {
        TlsSessionInfo {
            version: self.conn.protocol_version().map(|v| format!("{:?}", v)),
            cipher: self
                .conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            peer_certs: self
                .conn
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.0.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// the adapter as a probe module

/// State probe that wraps a subprobe in TLS. The carrier scan module sees
/// an ordinary state probe; the subprobe sees cleartext.
pub struct TlsStateProbe {
    subprobe: Option<Arc<dyn ProbeModule>>,
    dump: TlsDumpConfig,
}

struct TlsProbeConn {
    conn: TlsConn<RustlsSession>,
    started: bool,
}

impl TlsStateProbe {
    pub fn new() -> Self {
        Self {
            subprobe: None,
            dump: TlsDumpConfig::default(),
        }
    }

    fn subprobe(&self) -> &dyn ProbeModule {
        self.subprobe
            .as_deref()
            .expect("tls-state requires a subprobe")
    }
}

impl Default for TlsStateProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeModule for TlsStateProbe {
    fn name(&self) -> &'static str {
        "tls-state"
    }

    fn desc(&self) -> &'static str {
        "Wraps a subprobe's exchange in TLS over a stateless carrier."
    }

    fn probe_type(&self) -> ProbeType {
        ProbeType::State
    }

    fn init(&mut self, args: Option<&str>) -> Result<()> {
        use crate::contract::{arg_bool, parse_module_args};
        if let Some(args) = args {
            for (key, value) in parse_module_args(args) {
                match key.as_str() {
                    "subprobe" => {
                        let name = value.as_deref().ok_or_else(|| {
                            Error::Config("tls-state: subprobe needs a name".to_string())
                        })?;
                        let mut subprobe = crate::probes::create_probe_module(name)?;
                        subprobe.init(None)?;
                        self.subprobe = Some(Arc::from(subprobe));
                    }
                    "dump-version" => self.dump.version = arg_bool(&value),
                    "dump-cipher" => self.dump.cipher = arg_bool(&value),
                    "dump-cert" => self.dump.cert = arg_bool(&value),
                    "ssl-keylog" => self.dump.keylog = arg_bool(&value),
                    other => warn!("tls-state: ignoring unknown arg {:?}", other),
                }
            }
        }
        if self.subprobe.is_none() {
            return Err(Error::Config(
                "tls-state requires subprobe=<name>".to_string(),
            ));
        }
        Ok(())
    }

    fn make_payload(&self, _target: &ProbeTarget, _buf: &mut [u8]) -> usize {
        // the hello is produced per-connection by make_hello
        0
    }

    fn handle_response(
        &self,
        _th_idx: usize,
        target: &ProbeTarget,
        payload: &[u8],
        item: &mut OutItem,
    ) -> u16 {
        // used when the carrier collapses the exchange into one response
        self.subprobe().handle_response(0, target, payload, item)
    }

    fn conn_init(&self, target: &ProbeTarget) -> Option<ProbeState> {
        let server_name = target.ip_them.to_string();
        let session = match RustlsSession::new(&server_name, self.dump.keylog) {
            Ok(s) => s,
            Err(e) => {
                warn!("tls-state: session setup failed: {}", e);
                return None;
            }
        };
        let conn = TlsConn::open(session, self.subprobe(), target, self.dump).ok()?;
        Some(ProbeState(Box::new(TlsProbeConn {
            conn,
            started: false,
        })))
    }

    fn make_hello(&self, state: &mut ProbeState, _target: &ProbeTarget) -> Vec<u8> {
        let conn = state
            .0
            .downcast_mut::<TlsProbeConn>()
            .expect("state owned by tls-state");
        conn.started = true;
        conn.conn.start().unwrap_or_default()
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
            .downcast_mut::<TlsProbeConn>()
            .expect("state owned by tls-state");
        let out = conn.conn.feed(self.subprobe(), target, data, item);
        if out.closed {
            ParseAction::Close
        } else if !out.outbound.is_empty() {
            ParseAction::Send(out.outbound)
        } else {
            ParseAction::Continue
        }
    }

    fn conn_close(&self, state: ProbeState, target: &ProbeTarget) {
        if let Ok(conn) = state.0.downcast::<TlsProbeConn>() {
            conn.conn.close(self.subprobe(), target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::EchoStateProbe;
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

    /// Plaintext stand-in for a TLS library: one feed completes the
    /// "handshake", app data passes through untouched.
    struct MockSession {
        handshaking: bool,
        pending_out: Vec<u8>,
        pending_app: Vec<u8>,
        fail_feed: bool,
    }

    impl MockSession {
        fn new() -> Self {
            Self {
                handshaking: true,
                pending_out: b"client-hello".to_vec(),
                pending_app: Vec::new(),
                fail_feed: false,
            }
        }
    }

    impl TlsSession for MockSession {
        fn feed_incoming(&mut self, data: &[u8]) -> Result<()> {
            if self.fail_feed {
                return Err(Error::Probe("bad record".to_string()));
            }
            if self.handshaking {
                if !data.is_empty() {
                    self.handshaking = false;
                }
            } else {
                self.pending_app.extend_from_slice(data);
            }
            Ok(())
        }

        fn drain_outgoing(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
            let take = self.pending_out.len().min(limit);
            out.extend_from_slice(&self.pending_out[..take]);
            self.pending_out.drain(..take);
            Ok(take)
        }

        fn send_app(&mut self, data: &[u8]) -> Result<()> {
            // "encrypt" = pass through to the wire
            self.pending_out.extend_from_slice(data);
            Ok(())
        }

        fn recv_app(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<usize> {
            let take = self.pending_app.len().min(limit);
            out.extend_from_slice(&self.pending_app[..take]);
            self.pending_app.drain(..take);
            Ok(take)
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        fn info(&self) -> TlsSessionInfo {
            TlsSessionInfo {
                version: Some("TLSv1_3".to_string()),
                cipher: Some("TLS13_AES_128_GCM_SHA256".to_string()),
                peer_certs: vec![vec![0x30, 0x82]],
            }
        }
    }

    fn item() -> OutItem {
        OutItem::new(IpProto::Tcp, target().ip_them, 443, target().ip_me, 40_000)
    }

    #[test]
    fn test_pump_handshake_hello_data_close() {
        let probe = EchoStateProbe::new();
        let dump = TlsDumpConfig {
            version: true,
            cipher: true,
            cert: true,
            keylog: false,
        };
        let mut conn = TlsConn::open(MockSession::new(), &probe, &target(), dump).unwrap();
        assert_eq!(conn.state(), TspState::Handshake);

        // initial flight before any peer bytes
        assert_eq!(conn.start().unwrap(), b"client-hello");

        // server flight finishes the mock handshake; hello goes out
        let mut record = item();
        let out = conn.feed(&probe, &target(), b"server-flight", &mut record);
        assert_eq!(conn.state(), TspState::RecvData);
        assert_eq!(out.outbound, b"HELLO\r\n");
        assert!(!out.closed);
        // version + cipher + one cert
        assert_eq!(out.records.len(), 3);

        // application data: echo probe records it and closes
        let mut record = item();
        let out = conn.feed(&probe, &target(), b"WORLD\r\n", &mut record);
        assert!(out.closed);
        assert_eq!(record.level, OutputLevel::Success);
        assert!(record.report.get("banner").is_some());
        conn.close(&probe, &target());
    }

    #[test]
    fn test_session_error_forces_close() {
        let probe = EchoStateProbe::new();
        let mut session = MockSession::new();
        session.fail_feed = true;
        let mut conn =
            TlsConn::open(session, &probe, &target(), TlsDumpConfig::default()).unwrap();
        let mut record = item();
        let out = conn.feed(&probe, &target(), b"garbage", &mut record);
        assert!(out.closed);
        assert_eq!(conn.state(), TspState::NeedClose);
    }

    #[test]
    fn test_info_records_gated() {
        let probe = EchoStateProbe::new();
        let mut conn = TlsConn::open(
            MockSession::new(),
            &probe,
            &target(),
            TlsDumpConfig::default(),
        )
        .unwrap();
        let mut record = item();
        let out = conn.feed(&probe, &target(), b"server-flight", &mut record);
        assert!(out.records.is_empty(), "no dumps requested, no records");
    }

    #[test]
    fn test_rustls_session_produces_client_hello() {
        let probe = EchoStateProbe::new();
        let session = RustlsSession::new("198.51.100.5", false).unwrap();
        let mut conn =
            TlsConn::open(session, &probe, &target(), TlsDumpConfig::default()).unwrap();
        let flight = conn.start().unwrap();
        // a TLS handshake record: content type 22, version 3.x
        assert!(flight.len() > 5);
        assert_eq!(flight[0], 0x16);
        assert_eq!(flight[1], 0x03);
    }

    #[test]
    fn test_tls_state_probe_wiring() {
        let mut probe = TlsStateProbe::new();
        assert!(probe.init(Some("dump-version")).is_err(), "subprobe required");
        probe.init(Some("subprobe=echo-state,dump-version")).unwrap();
        assert_eq!(probe.probe_type(), ProbeType::State);

        let mut state = probe.conn_init(&target()).expect("connection state");
        let hello = probe.make_hello(&mut state, &target());
        assert!(!hello.is_empty());
        assert_eq!(hello[0], 0x16, "first flight is a TLS ClientHello");

        // feeding garbage to a real TLS session must close, not hang
        let mut record = item();
        let action = probe.parse_response(&mut state, &target(), b"not tls at all", &mut record);
        assert!(matches!(action, ParseAction::Close));
        probe.conn_close(state, &target());
    }
}
