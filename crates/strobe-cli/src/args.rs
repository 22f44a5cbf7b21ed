//! Command-line surface
//!
//! Only knobs the engine actually consumes; fancy help/echo/config-dump
//! machinery stays out. Flags mirror the config fields one-to-one.

use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use strobe_core::range::{RangeList4, RangeList6};
use strobe_core::{Error, PortList, Result, ScanConfig, Shard, TargetSpace};
use strobe_network::parse_mac;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per record
    Ndjson,
}

#[derive(Debug, Parser)]
#[command(
    name = "strobescan",
    version,
    about = "Stateless asynchronous Internet-scale port scanner"
)]
pub struct Args {
    /// Target specs: CIDR, dashed range, or single address (v4 or v6)
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Additional target specs
    #[arg(long = "range", value_name = "TARGET")]
    pub ranges: Vec<String>,

    /// Ports: `80,443,8000-8100`; prefix u:/s:/o: for UDP/SCTP/other
    #[arg(short = 'p', long, value_name = "PORTS")]
    pub ports: Option<String>,

    /// Address ranges never to scan
    #[arg(long, value_name = "TARGET")]
    pub exclude: Vec<String>,

    /// Deterministic seed; 0 draws from system entropy
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Packets per second across all tx workers
    #[arg(long, default_value_t = 100.0)]
    pub rate: f64,

    /// This instance's share of a distributed scan, `a/b`
    #[arg(long, default_value = "1/1")]
    pub shard: String,

    /// Seconds to keep receiving after transmit finishes
    #[arg(long, default_value_t = 10)]
    pub wait: u64,

    /// Entries in the duplicate-response cache
    #[arg(long = "dedup-win", default_value_t = 1_000_000)]
    pub dedup_win: usize,

    #[arg(long = "no-dedup")]
    pub no_dedup: bool,

    /// Fast-timeout delay in seconds; 0 disables no-reply events
    #[arg(long = "ft-spec", default_value_t = 0)]
    pub ft_spec: u64,

    #[arg(long = "tx-count", default_value_t = 1)]
    pub tx_count: usize,

    #[arg(long = "rx-handler-count", default_value_t = 1)]
    pub rx_handler_count: usize,

    #[arg(long = "stack-buf-count", default_value_t = 16_384)]
    pub stack_buf_count: usize,

    #[arg(long = "dispatch-buf-count", default_value_t = 16_384)]
    pub dispatch_buf_count: usize,

    #[arg(long = "blackrock-rounds", default_value_t = 14)]
    pub blackrock_rounds: u32,

    /// Source address; give once per family for mixed scans
    #[arg(long = "source-ip", value_name = "IP")]
    pub source_ip: Vec<String>,

    /// Source port block, `start` or `start-end` (at least 256 wide for
    /// multi-probe runs)
    #[arg(long = "source-port", value_name = "RANGE")]
    pub source_port: Option<String>,

    #[arg(long = "adapter-mac", value_name = "MAC")]
    pub adapter_mac: Option<String>,

    #[arg(long = "router-mac-ipv4", value_name = "MAC")]
    pub router_mac_ipv4: Option<String>,

    #[arg(long = "router-mac-ipv6", value_name = "MAC")]
    pub router_mac_ipv6: Option<String>,

    /// 802.1Q VLAN id to tag transmitted frames with
    #[arg(long)]
    pub vlan: Option<u16>,

    #[arg(long)]
    pub ttl: Option<u8>,

    #[arg(long = "tcp-init-window")]
    pub tcp_init_window: Option<u16>,

    #[arg(long = "tcp-window")]
    pub tcp_window: Option<u16>,

    #[arg(long, default_value_t = 65_535)]
    pub snaplen: usize,

    #[arg(long = "max-packet-len", default_value_t = 1514)]
    pub max_packet_len: usize,

    /// Number of sweeps in infinite mode (0 = until interrupted)
    #[arg(long, default_value_t = 0)]
    pub repeat: u64,

    #[arg(long)]
    pub infinite: bool,

    /// Transmit into a null datalink for throughput measurement
    #[arg(long)]
    pub offline: bool,

    /// Write validated frames to a pcap file
    #[arg(long, value_name = "FILE")]
    pub pcap: Option<PathBuf>,

    /// Extra BPF filter, ANDed with the scan module's own
    #[arg(long = "bpf-filter")]
    pub bpf_filter: Option<String>,

    #[arg(long = "no-resume")]
    pub no_resume: bool,

    /// Continue an interrupted scan from its resume file
    #[arg(long, value_name = "FILE")]
    pub resume: Option<PathBuf>,

    #[arg(long = "scan-module", default_value = "tcp-syn")]
    pub scan_module: String,

    #[arg(long = "scan-module-args")]
    pub scan_module_args: Option<String>,

    #[arg(long = "probe-module")]
    pub probe_module: Option<String>,

    #[arg(long = "probe-module-args")]
    pub probe_module_args: Option<String>,

    /// Load a TOML config file first; flags override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Write records here instead of stdout
    #[arg(short = 'o', long = "output-file", value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// List scan and probe modules, then exit
    #[arg(long = "list-modules")]
    pub list_modules: bool,
}

impl Args {
    /// Fold the flags into a validated engine configuration
    pub fn to_config(&self) -> Result<ScanConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                ScanConfig::from_toml(&text)?
            }
            None => ScanConfig::default(),
        };

        config.seed = self.seed;
        config.rate = self.rate;
        config.shard = self.shard.parse::<Shard>()?;
        config.wait = self.wait;
        config.dedup_win = self.dedup_win;
        config.no_dedup = self.no_dedup;
        config.ft_spec = self.ft_spec;
        config.tx_count = self.tx_count;
        config.rx_handler_count = self.rx_handler_count;
        config.stack_buf_count = self.stack_buf_count;
        config.dispatch_buf_count = self.dispatch_buf_count;
        config.blackrock_rounds = self.blackrock_rounds;
        config.ttl = self.ttl;
        config.tcp_init_window = self.tcp_init_window;
        config.tcp_window = self.tcp_window;
        config.snaplen = self.snaplen;
        config.max_packet_len = self.max_packet_len;
        config.repeat = self.repeat;
        config.infinite = self.infinite;
        config.offline = self.offline;
        config.pcap_file = self.pcap.clone();
        config.bpf_filter = self.bpf_filter.clone();
        config.no_resume = self.no_resume;
        config.scan_module = self.scan_module.clone();
        config.scan_module_args = self.scan_module_args.clone();
        config.probe_module = self.probe_module.clone();
        config.probe_module_args = self.probe_module_args.clone();
        if let Some(vlan) = self.vlan {
            config.source.vlan_id = Some(vlan);
        }

        for spec in &self.source_ip {
            match spec.parse::<IpAddr>()? {
                IpAddr::V4(ip) => config.source.ipv4 = Some(ip),
                IpAddr::V6(ip) => config.source.ipv6 = Some(ip),
            }
        }
        if let Some(spec) = &self.source_port {
            let (start, count) = parse_port_block(spec)?;
            config.source.port_start = Some(start);
            config.source.port_count = Some(count);
        }
        if let Some(mac) = &self.adapter_mac {
            config.source.adapter_mac = Some(parse_mac(mac)?);
        }
        if let Some(mac) = &self.router_mac_ipv4 {
            config.source.router_mac_ipv4 = Some(parse_mac(mac)?);
        }
        if let Some(mac) = &self.router_mac_ipv6 {
            config.source.router_mac_ipv6 = Some(parse_mac(mac)?);
        }

        if config.resume_file.is_none() && !config.no_resume {
            config.resume_file = Some(PathBuf::from("strobescan-resume.json"));
        }

        config.validate()?;
        Ok(config)
    }

    /// Assemble and optimize the target space
    pub fn build_targets(&self) -> Result<TargetSpace> {
        let mut space = TargetSpace::new();
        for spec in self.targets.iter().chain(self.ranges.iter()) {
            strobe_core::range::add_target_spec(&mut space.ipv4, &mut space.ipv6, spec)?;
        }
        if space.ipv4.is_empty() && space.ipv6.is_empty() {
            return Err(Error::Config(
                "no targets; try something like 10.0.0.0/8 or 192.168.0.100-192.168.0.200"
                    .to_string(),
            ));
        }

        // port-less modules compose through the other-proto slot
        space.ports = match &self.ports {
            Some(spec) => PortList::parse(spec)?,
            None => PortList::parse("o:0")?,
        };

        let mut exclude4 = RangeList4::new();
        let mut exclude6 = RangeList6::new();
        for spec in &self.exclude {
            strobe_core::range::add_target_spec(&mut exclude4, &mut exclude6, spec)?;
        }
        exclude4.optimize();
        exclude6.optimize();

        space.optimize(&exclude4, &exclude6);
        strobe_scanner::validate_scan_scale(&space, !self.exclude.is_empty())?;
        space.validate_size()?;
        Ok(space)
    }
}

/// `40000` or `40000-40255`
fn parse_port_block(spec: &str) -> Result<(u16, u16)> {
    if let Some((lo, hi)) = spec.split_once('-') {
        let start: u16 = lo
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid source port: {}", lo)))?;
        let end: u16 = hi
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid source port: {}", hi)))?;
        if end < start {
            return Err(Error::Config(format!("source port range reversed: {}", spec)));
        }
        Ok((start, end - start + 1))
    } else {
        let start: u16 = spec
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid source port: {}", spec)))?;
        Ok((start, strobe_core::config::DEFAULT_SOURCE_PORT_COUNT))
    }
}
