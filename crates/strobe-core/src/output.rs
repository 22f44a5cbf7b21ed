//! Result records
//!
//! Scan modules fill an [`OutItem`] per observation; the engine hands it by
//! value to the output sink. Records carry a free-form `report` map whose
//! insertion order is preserved so formatters print attributes the way the
//! module added them.

use crate::addr::Address;
use crate::ports::IpProto;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Severity of a result record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Info,
    Success,
    Failure,
}

impl fmt::Display for OutputLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputLevel::Info => write!(f, "info"),
            OutputLevel::Success => write!(f, "success"),
            OutputLevel::Failure => write!(f, "failure"),
        }
    }
}

/// One attribute value in a report map
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Raw bytes, serialized as a lossy string by formatters
    Bytes(Vec<u8>),
}

/// Insertion-ordered attribute map
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Report {
    entries: Vec<(String, ReportValue)>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.set(key, ReportValue::Str(value.into()));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, ReportValue::Int(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.set(key, ReportValue::Float(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, ReportValue::Bool(value));
    }

    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.set(key, ReportValue::Bytes(value));
    }

    fn set(&mut self, key: &str, value: ReportValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&ReportValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReportValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One result record
#[derive(Debug, Clone, Serialize)]
pub struct OutItem {
    pub time: DateTime<Utc>,
    pub level: OutputLevel,
    pub ip_proto: IpProto,
    pub ip_them: Address,
    pub port_them: u16,
    pub ip_me: Address,
    pub port_me: u16,
    pub classification: String,
    pub reason: String,
    pub report: Report,
    /// Module asked for the record to be suppressed
    #[serde(skip)]
    pub no_output: bool,
    /// Port fields are meaningless (icmp, arp)
    #[serde(skip)]
    pub no_port: bool,
}

impl OutItem {
    /// A fresh INFO-level record for the given tuple; modules raise the
    /// level and fill classification/reason in `handle`.
    pub fn new(
        ip_proto: IpProto,
        ip_them: Address,
        port_them: u16,
        ip_me: Address,
        port_me: u16,
    ) -> Self {
        Self {
            time: Utc::now(),
            level: OutputLevel::Info,
            ip_proto,
            ip_them,
            port_them,
            ip_me,
            port_me,
            classification: String::new(),
            reason: String::new(),
            report: Report::new(),
            no_output: false,
            no_port: false,
        }
    }
}

/// Where records go. Implementations serialize internally; the engine
/// wraps the sink in a mutex since output I/O is the accepted bottleneck.
pub trait OutputSink: Send {
    fn publish(&mut self, item: &OutItem);

    /// Flush buffered output, called at scan teardown
    fn close(&mut self) {}
}

/// Sink that drops everything, for offline runs and tests
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn publish(&mut self, _item: &OutItem) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_report_preserves_insertion_order() {
        let mut report = Report::new();
        report.set_int("ttl", 64);
        report.set_str("banner", "SSH-2.0-OpenSSH_9.6");
        report.set_bool("tls", false);
        let keys: Vec<&str> = report.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["ttl", "banner", "tls"]);
    }

    #[test]
    fn test_report_overwrite_keeps_position() {
        let mut report = Report::new();
        report.set_int("win", 64240);
        report.set_int("mss", 1460);
        report.set_int("win", 0);
        let keys: Vec<&str> = report.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["win", "mss"]);
        assert_eq!(report.get("win"), Some(&ReportValue::Int(0)));
    }

    #[test]
    fn test_item_serializes_to_json() {
        let mut item = OutItem::new(
            IpProto::Tcp,
            Address::V4(Ipv4Addr::new(198, 51, 100, 5)),
            80,
            Address::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40_000,
        );
        item.level = OutputLevel::Success;
        item.classification = "open".to_string();
        item.reason = "syn-ack".to_string();
        item.report.set_int("win", 64_240);

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["level"], "success");
        assert_eq!(json["classification"], "open");
        assert_eq!(json["port_them"], 80);
        assert_eq!(json["report"][0][0], "win");
    }
}
