//! The stateless scan engine
//!
//! Thread layout: N tx workers generate targets from a blackrock-shuffled
//! index stream and emit template packets; one rx worker captures, parses,
//! validates, and dispatches frames; M handler workers dedup, run the scan
//! module's `handle`/`timeout` hooks, and publish result records. Handlers
//! answer targets through the sidecar ring, which tx workers drain between
//! their own batches.
//!
//! Frames and timeout events for the same `(ip_them, port_them)` always
//! hash to the same handler, which is what lets the dedup cache and the
//! fast-timeout wheels run without locks.
//!
//! Shutdown is two-staged: `finish_tx` stops index generation (workers
//! keep flushing the sidecar), and after the drain window `finish_rx`
//! stops everything. Ctrl-C escalates through the same flags.

use crate::contract::{
    ModuleContext, PreHandle, ProbeModule, ProbeType, Received, ScanModule, ScanTarget,
    ScanTmEvent,
};
use crate::dedup::DedupTable;
use crate::fast_timeout::{FtHandler, FtTable};
use crate::modules::create_scan_module;
use crate::probes::create_probe_module;
use crate::status::{StatusItem, StatusPrinter};
use crate::throttler::Throttler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strobe_core::{
    Address, Blackrock, Error, OutItem, OutputLevel, OutputSink, ResumeState, Result, ScanConfig,
    SourcePorts, TargetSpace,
};
use strobe_network::{
    combine_bpf, preprocess_frame, Datalink, PacketStack, ParsedFrame, PcapSink, SourceIdentity,
    TemplParams, TemplateSet, PKT_BUF_SIZE,
};
use tracing::{debug, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_millis(350);
const RECV_TIMEOUT: Duration = Duration::from_millis(10);
const HANDLER_BATCH: usize = 64;

/// Cross-thread shutdown flags; first Ctrl-C sets tx, the drain window or
/// a second Ctrl-C sets rx
#[derive(Debug, Default)]
pub struct ScanFlags {
    finish_tx: AtomicBool,
    finish_rx: AtomicBool,
}

impl ScanFlags {
    pub fn finish_tx(&self) -> bool {
        self.finish_tx.load(Ordering::Acquire)
    }

    pub fn finish_rx(&self) -> bool {
        self.finish_rx.load(Ordering::Acquire)
    }

    pub fn set_finish_tx(&self) {
        self.finish_tx.store(true, Ordering::Release);
    }

    pub fn set_finish_rx(&self) {
        self.finish_rx.store(true, Ordering::Release);
    }
}

/// Atomic scan counters, sampled by the status loop
#[derive(Debug, Default)]
pub struct Counters {
    pub total_sent: AtomicU64,
    pub total_success: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_info: AtomicU64,
    pub parse_drops: AtomicU64,
    pub dedup_drops: AtomicU64,
    pub dispatch_drops: AtomicU64,
    pub transmit_errors: AtomicU64,
}

/// Final figures returned by [`Scanner::run`]
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub elapsed: Duration,
    pub total_sent: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_info: u64,
    pub interrupted: bool,
}

/// One validated frame on its way to a handler
struct DispatchItem {
    frame: Vec<u8>,
    parsed: ParsedFrame,
    pre: PreHandle,
    is_myip: bool,
    is_myport: bool,
    secs: u64,
}

/// Handler selector: same tuple, same handler, always
fn dispatch_hash(ip_them: Address, port_them: u16) -> usize {
    let mut hash = 0x811C_9DC5u32;
    let mut feed = |byte: u8| {
        hash = (byte as u32 ^ hash).wrapping_mul(0x0100_0193);
    };
    match ip_them {
        Address::V4(ip) => {
            for b in ip.octets() {
                feed(b);
            }
        }
        Address::V6(ip) => {
            for b in ip.octets() {
                feed(b);
            }
        }
    }
    feed(port_them as u8);
    feed((port_them >> 8) as u8);
    hash as usize
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Refuse obviously dangerous configurations: an Internet-scale sweep with
/// no exclude list is almost always a typo
pub fn validate_scan_scale(targets: &TargetSpace, has_excludes: bool) -> Result<()> {
    if targets.count_ipv4s() > 1_000_000_000 && !has_excludes {
        return Err(Error::Config(
            "range too big; specify at least one --exclude as confirmation \
             (e.g. --exclude 255.255.255.255)"
                .to_string(),
        ));
    }
    Ok(())
}

pub struct Scanner {
    config: ScanConfig,
    seed: u64,
    range: u64,
    source_ports: SourcePorts,
    targets: Arc<TargetSpace>,
    module: Arc<dyn ScanModule>,
    link: Arc<dyn Datalink>,
    stack: Arc<PacketStack>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    flags: Arc<ScanFlags>,
    counters: Arc<Counters>,
    global_now: Arc<AtomicU64>,
    ft_table: Option<Arc<FtTable>>,
}

impl Scanner {
    /// Wire everything together. Fatal errors here are configuration or
    /// bind problems; nothing has been transmitted yet.
    pub fn new(
        config: ScanConfig,
        targets: TargetSpace,
        link: Arc<dyn Datalink>,
        sink: Box<dyn OutputSink>,
    ) -> Result<Self> {
        config.validate()?;
        targets.validate_size()?;

        let seed = if config.seed == 0 {
            strobe_core::entropy()
        } else {
            config.seed
        };

        let source_ports = config.resolve_source_ports(unix_now());

        if targets.has_ipv4_targets() && config.source.ipv4.is_none() {
            return Err(Error::Bind(
                "IPv4 targets but no --source-ip set".to_string(),
            ));
        }
        if targets.has_ipv6_targets() && config.source.ipv6.is_none() {
            return Err(Error::Bind(
                "IPv6 targets but no IPv6 --source-ip set".to_string(),
            ));
        }

        let templates = Arc::new(TemplateSet::build(&TemplParams {
            link: link.link_type(),
            adapter_mac: config.source.adapter_mac.unwrap_or([0; 6]),
            router_mac_ipv4: config.source.router_mac_ipv4.unwrap_or([0; 6]),
            router_mac_ipv6: config.source.router_mac_ipv6.unwrap_or([0; 6]),
            src_ipv4: config.source.ipv4.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
            src_ipv6: config.source.ipv6.unwrap_or(std::net::Ipv6Addr::UNSPECIFIED),
            vlan_id: config.source.vlan_id,
            ttl: config.ttl.unwrap_or(64),
            tcp_init_window: config.tcp_init_window.unwrap_or(64_240),
            tcp_window: config.tcp_window.unwrap_or(1024),
            syn_options: Default::default(),
        }));

        let probe: Option<Arc<dyn ProbeModule>> = match &config.probe_module {
            Some(name) => {
                let mut probe = create_probe_module(name)?;
                probe.init(config.probe_module_args.as_deref())?;
                Some(Arc::from(probe))
            }
            None => None,
        };

        let mut module = create_scan_module(&config.scan_module)?;
        match (module.required_probe_type(), &probe) {
            (ProbeType::None, Some(_)) => {
                return Err(Error::Config(format!(
                    "scan module {} does not take a probe",
                    module.name()
                )))
            }
            (ProbeType::None, None) => {}
            (required, Some(p)) if p.probe_type() == required => {}
            (required, _) => {
                return Err(Error::Config(format!(
                    "scan module {} needs a probe of type {:?}",
                    module.name(),
                    required
                )))
            }
        }

        let ft_table = (config.is_fast_timeout() && module.support_timeout())
            .then(|| Arc::new(FtTable::new(config.ft_spec, config.rx_handler_count)));

        module.init(&ModuleContext {
            templates: templates.clone(),
            source_ports,
            args: config.scan_module_args.clone(),
            probe,
            ft_enabled: ft_table.is_some(),
        })?;
        let module: Arc<dyn ScanModule> = Arc::from(module);

        let filter = combine_bpf(module.bpf_filter(), config.bpf_filter.as_deref());
        link.set_filter(&filter)?;

        let stack = Arc::new(PacketStack::new(
            SourceIdentity {
                ipv4: config.source.ipv4,
                ipv6: config.source.ipv6,
                ports: source_ports,
            },
            config.stack_buf_count,
        ));

        let range = targets.count() as u64;

        Ok(Self {
            config,
            seed,
            range,
            source_ports,
            targets: Arc::new(targets),
            module,
            link,
            stack,
            sink: Arc::new(Mutex::new(sink)),
            flags: Arc::new(ScanFlags::default()),
            counters: Arc::new(Counters::default()),
            global_now: Arc::new(AtomicU64::new(unix_now())),
            ft_table,
        })
    }

    /// Shutdown flags, for the caller's signal handler
    pub fn flags(&self) -> Arc<ScanFlags> {
        self.flags.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run the scan to completion (or interruption). Blocks; the status
    /// printer is driven from this thread.
    pub fn run(&mut self, status: &mut dyn StatusPrinter) -> Result<ScanSummary> {
        let start = Instant::now();
        let tx_count = self.config.tx_count;
        let handler_count = self.config.rx_handler_count;

        info!(
            "scanning {} targets with {} ({} tx, {} handlers, seed {:#x})",
            self.range,
            self.module.name(),
            tx_count,
            handler_count,
            self.seed
        );

        // dispatch rings, one per handler
        let dispatch: Arc<Vec<strobe_network::Ring<DispatchItem>>> = Arc::new(
            (0..handler_count)
                .map(|_| strobe_network::Ring::new(self.config.dispatch_buf_count))
                .collect(),
        );

        let tx_indexes: Vec<Arc<AtomicU64>> =
            (0..tx_count).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let tx_repeats: Vec<Arc<AtomicU64>> =
            (0..tx_count).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let tx_rates: Vec<Arc<AtomicU64>> =
            (0..tx_count).map(|_| Arc::new(AtomicU64::new(0))).collect();

        let mut handles = Vec::new();

        // rx worker
        {
            let ctx = self.rx_context(dispatch.clone());
            handles.push(
                std::thread::Builder::new()
                    .name("rx".to_string())
                    .spawn(move || ctx.run())
                    .map_err(Error::Io)?,
            );
        }

        // handler workers
        for h in 0..handler_count {
            let ctx = self.handler_context(h, dispatch.clone());
            handles.push(
                std::thread::Builder::new()
                    .name(format!("handler-{}", h))
                    .spawn(move || ctx.run())
                    .map_err(Error::Io)?,
            );
        }

        // tx workers
        for k in 0..tx_count {
            let ctx = self.tx_context(
                k,
                tx_indexes[k].clone(),
                tx_repeats[k].clone(),
                tx_rates[k].clone(),
            );
            handles.push(
                std::thread::Builder::new()
                    .name(format!("tx-{}", k))
                    .spawn(move || ctx.run())
                    .map_err(Error::Io)?,
            );
        }

        // main loop: status, completion detection, coarse clock
        let mut fatal: Option<Error> = None;
        while !self.flags.finish_tx() {
            std::thread::sleep(STATUS_INTERVAL);
            self.global_now.store(unix_now(), Ordering::Relaxed);

            let item = self.sample_status(&tx_indexes, &tx_repeats, &tx_rates, &dispatch, None);
            status.print(&item);

            if self.stack.overflowed() {
                fatal = Some(Error::Backpressure(
                    "sidecar/pktbuf rings overflowed".to_string(),
                ));
                self.flags.set_finish_tx();
                self.flags.set_finish_rx();
                break;
            }

            let done = if self.config.infinite {
                self.config.repeat > 0 && item.repeat_count >= self.config.repeat
            } else {
                item.cur_count >= self.range
            };
            if done {
                self.flags.set_finish_tx();
            }
        }

        // persist the position of an interrupted scan
        let cur_count = tx_indexes
            .iter()
            .map(|i| i.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0);
        let interrupted = cur_count < self.range && !self.config.infinite;
        if interrupted && !self.config.no_resume && fatal.is_none() {
            if let Some(path) = &self.config.resume_file {
                let state = ResumeState {
                    seed: self.seed,
                    index: cur_count,
                    shard: self.config.shard,
                };
                match state.save(path) {
                    Ok(()) => info!("resume state saved to {}", path.display()),
                    Err(e) => warn!("failed to save resume state: {}", e),
                }
            }
        }

        // drain window: keep receiving until `wait` runs out or rx is told
        // to stop outright
        let drain_start = Instant::now();
        while !self.flags.finish_rx() {
            std::thread::sleep(STATUS_INTERVAL);
            self.global_now.store(unix_now(), Ordering::Relaxed);

            let left = self
                .config
                .wait
                .saturating_sub(drain_start.elapsed().as_secs());
            let item =
                self.sample_status(&tx_indexes, &tx_repeats, &tx_rates, &dispatch, Some(left));
            status.print(&item);

            if drain_start.elapsed().as_secs() >= self.config.wait {
                self.flags.set_finish_rx();
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        self.module.close();
        self.sink.lock().close();
        status.finish();

        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(ScanSummary {
            elapsed: start.elapsed(),
            total_sent: self.counters.total_sent.load(Ordering::Relaxed),
            total_success: self.counters.total_success.load(Ordering::Relaxed),
            total_failed: self.counters.total_failed.load(Ordering::Relaxed),
            total_info: self.counters.total_info.load(Ordering::Relaxed),
            interrupted,
        })
    }

    fn sample_status(
        &self,
        tx_indexes: &[Arc<AtomicU64>],
        tx_repeats: &[Arc<AtomicU64>],
        tx_rates: &[Arc<AtomicU64>],
        dispatch: &[strobe_network::Ring<DispatchItem>],
        exiting_secs: Option<u64>,
    ) -> StatusItem {
        let cur_count = tx_indexes
            .iter()
            .map(|i| i.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
            .min(self.range);
        let repeat_count = tx_repeats
            .iter()
            .map(|i| i.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0);
        let cur_pps: f64 = tx_rates
            .iter()
            .map(|r| f64::from_bits(r.load(Ordering::Relaxed)))
            .sum();
        let rx_queue_ratio = dispatch
            .iter()
            .map(|r| r.percent_free())
            .fold(100.0f64, f64::min);

        StatusItem {
            cur_count,
            max_count: self.range,
            repeat_count,
            cur_pps,
            total_sent: self.counters.total_sent.load(Ordering::Relaxed),
            total_success: self.counters.total_success.load(Ordering::Relaxed),
            total_failed: self.counters.total_failed.load(Ordering::Relaxed),
            total_info: self.counters.total_info.load(Ordering::Relaxed),
            tm_event_backlog: self.ft_table.as_ref().map_or(0, |t| t.event_count()),
            tx_queue_ratio: self.stack.transmit_percent_free(),
            rx_queue_ratio,
            exiting_secs,
            add_status: self.module.status(),
        }
    }

    fn tx_context(
        &self,
        worker: usize,
        my_index: Arc<AtomicU64>,
        my_repeat: Arc<AtomicU64>,
        my_rate: Arc<AtomicU64>,
    ) -> TxWorker {
        TxWorker {
            worker,
            tx_count: self.config.tx_count,
            shard: self.config.shard,
            seed: self.seed,
            range: self.range,
            resume_index: self.config.resume_index,
            infinite: self.config.infinite,
            repeat: self.config.repeat,
            blackrock: Blackrock::new(self.range, self.seed, self.config.blackrock_rounds),
            targets: self.targets.clone(),
            module: self.module.clone(),
            link: self.link.clone(),
            stack: self.stack.clone(),
            flags: self.flags.clone(),
            counters: self.counters.clone(),
            global_now: self.global_now.clone(),
            ft_table: self.ft_table.clone(),
            source_ports: self.source_ports,
            throttler: Throttler::new(self.config.rate / self.config.tx_count as f64),
            my_index,
            my_repeat,
            my_rate,
        }
    }

    fn rx_context(&self, dispatch: Arc<Vec<strobe_network::Ring<DispatchItem>>>) -> RxWorker {
        RxWorker {
            seed: self.seed,
            snaplen: self.config.snaplen,
            max_packet_len: self.config.max_packet_len,
            pcap_file: self.config.pcap_file.clone(),
            link: self.link.clone(),
            stack: self.stack.clone(),
            module: self.module.clone(),
            flags: self.flags.clone(),
            counters: self.counters.clone(),
            global_now: self.global_now.clone(),
            dispatch,
        }
    }

    fn handler_context(
        &self,
        handler: usize,
        dispatch: Arc<Vec<strobe_network::Ring<DispatchItem>>>,
    ) -> HandlerWorker {
        let dedup = (!self.config.no_dedup).then(|| {
            // the window is split across handlers since each owns its share
            // of the tuple space
            DedupTable::new((self.config.dedup_win / self.config.rx_handler_count).max(4))
        });
        HandlerWorker {
            handler,
            seed: self.seed,
            module: self.module.clone(),
            stack: self.stack.clone(),
            sink: self.sink.clone(),
            flags: self.flags.clone(),
            counters: self.counters.clone(),
            global_now: self.global_now.clone(),
            ft_table: self.ft_table.clone(),
            dedup,
            dispatch,
        }
    }
}

// ---------------------------------------------------------------------------
// tx worker

struct TxWorker {
    worker: usize,
    tx_count: usize,
    shard: strobe_core::Shard,
    seed: u64,
    range: u64,
    resume_index: u64,
    infinite: bool,
    repeat: u64,
    blackrock: Blackrock,
    targets: Arc<TargetSpace>,
    module: Arc<dyn ScanModule>,
    link: Arc<dyn Datalink>,
    stack: Arc<PacketStack>,
    flags: Arc<ScanFlags>,
    counters: Arc<Counters>,
    global_now: Arc<AtomicU64>,
    ft_table: Option<Arc<FtTable>>,
    source_ports: SourcePorts,
    throttler: Throttler,
    my_index: Arc<AtomicU64>,
    my_repeat: Arc<AtomicU64>,
    my_rate: Arc<AtomicU64>,
}

impl TxWorker {
    /// First index of this worker's interleaved slice at or after `from`
    fn first_index(&self, from: u64) -> u64 {
        let stride = self.stride();
        let phase = (self.shard.one as u64 - 1) + self.shard.of as u64 * self.worker as u64;
        let rem = from % stride;
        if rem <= phase {
            from - rem + phase
        } else {
            from - rem + stride + phase
        }
    }

    fn stride(&self) -> u64 {
        self.shard.of as u64 * self.tx_count as u64
    }

    fn run(mut self) {
        debug!("tx-{}: starting", self.worker);
        let stride = self.stride();
        let mut resume_from = self.resume_index;

        'sweeps: loop {
            let mut i = self.first_index(resume_from);
            while i < self.range && !self.flags.finish_tx() {
                let mut batch = self.throttler.next_batch();
                self.my_rate.store(
                    self.throttler.current_rate().to_bits(),
                    Ordering::Relaxed,
                );
                while batch > 0 && i < self.range {
                    self.transmit_one(i);
                    batch -= 1;
                    i += stride;
                    self.my_index.store(i.min(self.range), Ordering::Relaxed);
                }
                self.flush_sidecar();
            }
            self.my_index.store(self.range, Ordering::Relaxed);
            let repeats = self.my_repeat.fetch_add(1, Ordering::Relaxed) + 1;

            if self.flags.finish_tx() || !self.infinite {
                break 'sweeps;
            }
            if self.repeat > 0 && repeats >= self.repeat {
                break 'sweeps;
            }
            resume_from = 0;
        }

        // transmit is done, but handlers still produce responses; keep the
        // sidecar moving until rx winds down
        debug!("tx-{}: done transmitting, draining sidecar", self.worker);
        while !self.flags.finish_rx() {
            if !self.flush_sidecar() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn transmit_one(&self, index: u64) {
        let shuffled = self.blackrock.shuffle(index);
        let (ip_them, ip_proto, port_them) = self.targets.pick(shuffled);
        let Some(ip_me) = self.stack.src.source_for(ip_them) else {
            return;
        };
        // spread our identity across the port block
        let port_me = self.source_ports.start
            + ((self.seed ^ index) % self.source_ports.count as u64) as u16;

        let mut probe_index = 0u16;
        loop {
            let target = ScanTarget {
                ip_proto,
                ip_them,
                port_them,
                ip_me,
                port_me,
                index: probe_index,
            };
            let mut event = ScanTmEvent::from_target(&target);
            let mut buf = [0u8; PKT_BUF_SIZE];
            let (len, more) = self.module.transmit(self.seed, &target, &mut event, &mut buf);

            if len > 0 {
                match self.link.send_frame(&buf[..len]) {
                    Ok(()) => {
                        self.counters.total_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("tx-{}: send failed: {}", self.worker, e);
                        self.counters.transmit_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if event.need_timeout {
                if let Some(table) = &self.ft_table {
                    let h = dispatch_hash(event.ip_them, event.port_them) % table.handler_count();
                    table.add(h, event, self.global_now.load(Ordering::Relaxed));
                }
            }

            if !more {
                break;
            }
            probe_index += 1;
        }
    }

    /// Returns whether anything moved
    fn flush_sidecar(&self) -> bool {
        let mut moved = false;
        while let Some(pkt) = self.stack.pop_transmit() {
            moved = true;
            match self.link.send_frame(pkt.frame()) {
                Ok(()) => {
                    self.counters.total_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("tx-{}: sidecar send failed: {}", self.worker, e);
                    self.counters.transmit_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.stack.release(pkt);
        }
        moved
    }
}

// ---------------------------------------------------------------------------
// rx worker

struct RxWorker {
    seed: u64,
    snaplen: usize,
    max_packet_len: usize,
    pcap_file: Option<std::path::PathBuf>,
    link: Arc<dyn Datalink>,
    stack: Arc<PacketStack>,
    module: Arc<dyn ScanModule>,
    flags: Arc<ScanFlags>,
    counters: Arc<Counters>,
    global_now: Arc<AtomicU64>,
    dispatch: Arc<Vec<strobe_network::Ring<DispatchItem>>>,
}

impl RxWorker {
    fn run(self) {
        debug!("rx: starting");
        let mut buf = vec![0u8; self.snaplen.max(PKT_BUF_SIZE)];
        let mut pcap = self.pcap_file.as_ref().and_then(|path| {
            match PcapSink::create(path, self.link.link_type(), self.snaplen as u32) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!("rx: cannot open pcap file: {}", e);
                    None
                }
            }
        });

        while !self.flags.finish_rx() {
            let len = match self.link.recv_frame(&mut buf, RECV_TIMEOUT) {
                Ok(Some(len)) => len,
                Ok(None) => continue,
                Err(e) => {
                    debug!("rx: recv failed: {}", e);
                    continue;
                }
            };

            if len > self.max_packet_len {
                continue;
            }

            let Some(parsed) = preprocess_frame(&buf[..len], self.link.link_type()) else {
                self.counters.parse_drops.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let is_myip = self.stack.src.is_my_ip(parsed.dst_ip);
            let is_myport = self.stack.src.is_my_port(parsed.port_dst);
            let secs = self.global_now.load(Ordering::Relaxed);
            let recved = Received {
                parsed: parsed.clone(),
                frame: &buf[..len],
                secs,
                usecs: 0,
                is_myip,
                is_myport,
            };

            let mut pre = PreHandle::new(&recved.parsed);
            self.module.validate(self.seed, &recved, &mut pre);
            if !pre.go_record {
                continue;
            }

            if let Some(pcap) = &mut pcap {
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                if let Err(e) = pcap.write_frame(&buf[..len], ts) {
                    warn!("rx: pcap write failed: {}", e);
                }
            }

            if !pre.go_dedup {
                continue;
            }

            // same tuple, same handler: this is what makes dedup lock-free
            let h = dispatch_hash(pre.dedup_ip_them, pre.dedup_port_them) % self.dispatch.len();
            let mut item = DispatchItem {
                frame: buf[..len].to_vec(),
                parsed,
                pre,
                is_myip,
                is_myport,
                secs,
            };
            let mut spins = 0;
            loop {
                match self.dispatch[h].push(item) {
                    Ok(()) => break,
                    Err(back) => {
                        item = back;
                        spins += 1;
                        if spins > 64 {
                            self.counters.dispatch_drops.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }
        }
        debug!("rx: exiting");
    }
}

// ---------------------------------------------------------------------------
// handler worker

struct HandlerWorker {
    handler: usize,
    seed: u64,
    module: Arc<dyn ScanModule>,
    stack: Arc<PacketStack>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    flags: Arc<ScanFlags>,
    counters: Arc<Counters>,
    global_now: Arc<AtomicU64>,
    ft_table: Option<Arc<FtTable>>,
    dedup: Option<DedupTable>,
    dispatch: Arc<Vec<strobe_network::Ring<DispatchItem>>>,
}

impl HandlerWorker {
    fn run(mut self) {
        debug!("handler-{}: starting", self.handler);
        let mut ft_handler = self
            .ft_table
            .as_ref()
            .map(|table| FtHandler::new(table, self.handler));
        let wheel = self.ft_table.as_ref().map(|table| table.wheel(self.handler));

        loop {
            let now = self.global_now.load(Ordering::Relaxed);
            let mut worked = false;

            // timeout events first: they are strictly older than anything
            // in the dispatch queue
            if let Some(fh) = &mut ft_handler {
                while let Some(event) = fh.pop(now) {
                    worked = true;
                    let duplicate = self.dedup.as_mut().is_some_and(|d| {
                        d.is_duplicate(
                            event.ip_them,
                            event.port_them,
                            event.ip_me,
                            event.port_me,
                            event.dedup_type,
                        )
                    });
                    if duplicate {
                        self.counters.dedup_drops.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let mut item = OutItem::new(
                        event.ip_proto,
                        event.ip_them,
                        event.port_them,
                        event.ip_me,
                        event.port_me,
                    );
                    self.module.timeout(
                        self.seed,
                        &event,
                        &mut item,
                        &self.stack,
                        wheel.as_deref(),
                        now,
                    );
                    self.publish(item);
                }
            }

            // then a bounded batch of frames
            for _ in 0..HANDLER_BATCH {
                let Some(di) = self.dispatch[self.handler].pop() else {
                    break;
                };
                worked = true;
                self.handle_one(di, wheel.as_deref(), now);
            }

            self.module.poll();

            if !worked {
                if self.flags.finish_rx() && self.dispatch[self.handler].is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_micros(500));
            }
        }
        debug!("handler-{}: exiting", self.handler);
    }

    fn handle_one(&mut self, di: DispatchItem, wheel: Option<&crate::fast_timeout::FtWheel>, now: u64) {
        if di.pre.go_dedup && !di.pre.no_dedup {
            let duplicate = self.dedup.as_mut().is_some_and(|d| {
                d.is_duplicate(
                    di.pre.dedup_ip_them,
                    di.pre.dedup_port_them,
                    di.pre.dedup_ip_me,
                    di.pre.dedup_port_me,
                    di.pre.dedup_type,
                )
            });
            if duplicate {
                self.counters.dedup_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let recved = Received {
            parsed: di.parsed,
            frame: &di.frame,
            secs: di.secs,
            usecs: 0,
            is_myip: di.is_myip,
            is_myport: di.is_myport,
        };
        let mut item = OutItem::new(
            recved.parsed.ip_proto,
            recved.parsed.src_ip,
            recved.parsed.port_src,
            recved.parsed.dst_ip,
            recved.parsed.port_dst,
        );
        self.module.handle(
            self.handler,
            self.seed,
            &recved,
            &mut item,
            &self.stack,
            wheel,
            now,
        );
        self.publish(item);
    }

    fn publish(&self, item: OutItem) {
        if item.no_output {
            return;
        }
        match item.level {
            OutputLevel::Success => {
                self.counters.total_success.fetch_add(1, Ordering::Relaxed);
            }
            OutputLevel::Failure => {
                self.counters.total_failed.fetch_add(1, Ordering::Relaxed);
            }
            OutputLevel::Info => {
                self.counters.total_info.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sink.lock().publish(&item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_dispatch_hash_is_stable_and_spread() {
        let a = Address::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(dispatch_hash(a, 80), dispatch_hash(a, 80));
        // different tuples should not all collapse onto one handler
        let distinct: std::collections::HashSet<usize> = (0..64u16)
            .map(|p| dispatch_hash(Address::V4(Ipv4Addr::new(10, 0, 0, p as u8)), 80) % 4)
            .collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_scale_guard() {
        let mut targets = TargetSpace::new();
        targets.ipv4.add_spec("10.0.0.0/24").unwrap();
        targets.ports = strobe_core::PortList::parse("80").unwrap();
        targets.optimize(&strobe_core::RangeList4::new(), &strobe_core::RangeList6::new());
        assert!(validate_scan_scale(&targets, false).is_ok());

        let mut big = TargetSpace::new();
        big.ipv4.add_spec("0.0.0.0/1").unwrap();
        big.ports = strobe_core::PortList::parse("80").unwrap();
        big.optimize(&strobe_core::RangeList4::new(), &strobe_core::RangeList6::new());
        assert!(validate_scan_scale(&big, false).is_err());
        assert!(validate_scan_scale(&big, true).is_ok());
    }

    #[test]
    fn test_tx_slicing_covers_range_exactly_once() {
        // simulate the index walk of 2 shards x 2 workers
        let range = 1000u64;
        let mut seen = vec![0u32; range as usize];
        for shard_one in 1..=2u32 {
            for worker in 0..2usize {
                let stride = 2u64 * 2;
                let phase = (shard_one as u64 - 1) + 2 * worker as u64;
                let mut i = phase;
                while i < range {
                    seen[i as usize] += 1;
                    i += stride;
                }
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }
}
