//! Scan configuration
//!
//! One [`ScanConfig`] carries every knob the engine consumes. It is built
//! by the CLI (or loaded from a TOML file), validated once, and shared
//! read-only by all workers afterwards.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Default number of source ports reserved per scan; multi-probe modes
/// encode the probe index as an offset into this block, so it must be at
/// least as large as any probe's `multi_num`.
pub const DEFAULT_SOURCE_PORT_COUNT: u16 = 256;

/// `--shard a/b`: this process scans every b-th index starting at a-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub one: u32,
    pub of: u32,
}

impl Default for Shard {
    fn default() -> Self {
        Self { one: 1, of: 1 }
    }
}

impl FromStr for Shard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (one, of) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("shard must be a/b, got: {}", s)))?;
        let one: u32 = one
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid shard index: {}", one)))?;
        let of: u32 = of
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid shard count: {}", of)))?;
        let shard = Shard { one, of };
        shard.validate()?;
        Ok(shard)
    }
}

impl Shard {
    pub fn validate(&self) -> Result<()> {
        if self.of == 0 || self.one == 0 || self.one > self.of {
            return Err(Error::Config(format!(
                "shard must satisfy 1 <= a <= b, got {}/{}",
                self.one, self.of
            )));
        }
        Ok(())
    }
}

/// Transmit-side identity: source addresses, port block, MACs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source IPv4 address; must be set for v4 targets
    pub ipv4: Option<Ipv4Addr>,
    /// Source IPv6 address; must be set for v6 targets
    pub ipv6: Option<Ipv6Addr>,
    /// First source port; when unset a block is picked at startup
    pub port_start: Option<u16>,
    /// Number of consecutive source ports
    pub port_count: Option<u16>,
    /// Our interface MAC
    pub adapter_mac: Option<[u8; 6]>,
    /// Next-hop MAC for IPv4 traffic
    pub router_mac_ipv4: Option<[u8; 6]>,
    /// Next-hop MAC for IPv6 traffic
    pub router_mac_ipv6: Option<[u8; 6]>,
    /// Insert an 802.1Q shim with this VLAN id
    pub vlan_id: Option<u16>,
}

/// Resolved source port block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourcePorts {
    pub start: u16,
    pub count: u16,
}

impl SourcePorts {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && (port - self.start) < self.count
    }

    /// Multi-probe index encoded in a source port
    pub fn index_of(&self, port: u16) -> u16 {
        debug_assert!(self.contains(self.start));
        port.wrapping_sub(self.start)
    }
}

/// Everything the scan engine consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Deterministic seed; 0 means draw from system entropy at startup
    pub seed: u64,
    /// Target packets per second across all tx workers
    pub rate: f64,
    pub shard: Shard,
    /// Seconds to keep receiving after transmit finishes
    pub wait: u64,
    /// Approximate entry count of the dedup cache
    pub dedup_win: usize,
    pub no_dedup: bool,
    /// Fast-timeout delay in seconds; 0 disables the wheel
    pub ft_spec: u64,
    pub tx_count: usize,
    pub rx_handler_count: usize,
    /// Capacity of the pktbuf pool / sidecar transmit ring (power of two)
    pub stack_buf_count: usize,
    /// Capacity of each handler dispatch ring (power of two)
    pub dispatch_buf_count: usize,
    pub blackrock_rounds: u32,
    pub source: SourceConfig,
    /// IP TTL / hop limit override
    pub ttl: Option<u8>,
    /// Window field of the SYN template
    pub tcp_init_window: Option<u16>,
    /// Window field of non-SYN TCP packets
    pub tcp_window: Option<u16>,
    pub snaplen: usize,
    pub max_packet_len: usize,
    /// Re-run the index space this many times (with `infinite`)
    pub repeat: u64,
    pub infinite: bool,
    /// Transmit into a null datalink, for throughput measurement
    pub offline: bool,
    /// Write validated frames to this pcap file
    pub pcap_file: Option<PathBuf>,
    /// User BPF filter, ANDed with the scan module's hint
    pub bpf_filter: Option<String>,
    pub no_resume: bool,
    /// Where interrupted scans persist their position
    pub resume_file: Option<PathBuf>,
    /// First index to transmit, nonzero when resuming
    pub resume_index: u64,
    pub scan_module: String,
    pub scan_module_args: Option<String>,
    pub probe_module: Option<String>,
    pub probe_module_args: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rate: 100.0,
            shard: Shard::default(),
            wait: 10,
            dedup_win: 1_000_000,
            no_dedup: false,
            ft_spec: 0,
            tx_count: 1,
            rx_handler_count: 1,
            stack_buf_count: 16_384,
            dispatch_buf_count: 16_384,
            blackrock_rounds: crate::blackrock::DEFAULT_ROUNDS,
            source: SourceConfig::default(),
            ttl: None,
            tcp_init_window: None,
            tcp_window: None,
            snaplen: 65_535,
            max_packet_len: 1514,
            repeat: 0,
            infinite: false,
            offline: false,
            pcap_file: None,
            bpf_filter: None,
            no_resume: false,
            resume_file: None,
            resume_index: 0,
            scan_module: "tcp-syn".to_string(),
            scan_module_args: None,
            probe_module: None,
            probe_module_args: None,
        }
    }
}

impl ScanConfig {
    /// Load from a TOML file
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ScanConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.shard.validate()?;
        if self.rate <= 0.0 {
            return Err(Error::Config(format!("rate must be positive: {}", self.rate)));
        }
        if self.tx_count == 0 {
            return Err(Error::Config("tx-count must be at least 1".to_string()));
        }
        if self.rx_handler_count == 0 {
            return Err(Error::Config(
                "rx-handler-count must be at least 1".to_string(),
            ));
        }
        if !self.stack_buf_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "stack-buf-count must be a power of two: {}",
                self.stack_buf_count
            )));
        }
        if !self.dispatch_buf_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "dispatch-buf-count must be a power of two: {}",
                self.dispatch_buf_count
            )));
        }
        if self.blackrock_rounds == 0 {
            return Err(Error::Config(
                "blackrock-rounds must be at least 1".to_string(),
            ));
        }
        if let Some(count) = self.source.port_count {
            if count == 0 {
                return Err(Error::Config(
                    "source port range must not be empty".to_string(),
                ));
            }
            if let Some(start) = self.source.port_start {
                if (start as u32) + (count as u32) > 65_536 {
                    return Err(Error::Config(format!(
                        "source port block {}+{} runs past 65535",
                        start, count
                    )));
                }
            }
        }
        if self.max_packet_len < 64 {
            return Err(Error::Config(format!(
                "max-packet-len too small: {}",
                self.max_packet_len
            )));
        }
        Ok(())
    }

    /// Pick the source port block. When the user did not bind one, take a
    /// block in the ephemeral range keyed to the current time, the way a
    /// fresh scan wants fresh ports.
    pub fn resolve_source_ports(&self, now_secs: u64) -> SourcePorts {
        match (self.source.port_start, self.source.port_count) {
            (Some(start), Some(count)) => SourcePorts { start, count },
            (Some(start), None) => SourcePorts {
                start,
                count: DEFAULT_SOURCE_PORT_COUNT,
            },
            _ => SourcePorts {
                start: (40_000 + now_secs % 20_000) as u16,
                count: DEFAULT_SOURCE_PORT_COUNT,
            },
        }
    }

    pub fn is_fast_timeout(&self) -> bool {
        self.ft_spec > 0
    }
}
