//! Output sinks
//!
//! Two formats: human-readable text lines and newline-delimited JSON. The
//! engine serializes access; the sinks only format and write.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use strobe_core::{OutItem, OutputSink, ReportValue, Result};

enum Target {
    Stdout(io::Stdout),
    File(BufWriter<File>),
}

impl Target {
    fn create(path: Option<&Path>) -> Result<Self> {
        Ok(match path {
            Some(path) => Target::File(BufWriter::new(File::create(path)?)),
            None => Target::Stdout(io::stdout()),
        })
    }

    fn write_line(&mut self, line: &str) {
        let result = match self {
            Target::Stdout(out) => writeln!(out, "{}", line),
            Target::File(out) => writeln!(out, "{}", line),
        };
        if let Err(e) = result {
            tracing::warn!("output write failed: {}", e);
        }
    }

    fn flush(&mut self) {
        let _ = match self {
            Target::Stdout(out) => out.flush(),
            Target::File(out) => out.flush(),
        };
    }
}

fn value_display(value: &ReportValue) -> String {
    match value {
        ReportValue::Str(s) => s.clone(),
        ReportValue::Int(i) => i.to_string(),
        ReportValue::Float(f) => f.to_string(),
        ReportValue::Bool(b) => b.to_string(),
        ReportValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// `[+] 2026-08-01T00:00:00Z tcp 198.51.100.5:80 open syn-ack "win=64240"`
pub struct TextSink {
    target: Target,
}

impl TextSink {
    pub fn create(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            target: Target::create(path)?,
        })
    }
}

impl OutputSink for TextSink {
    fn publish(&mut self, item: &OutItem) {
        let marker = match item.level {
            strobe_core::OutputLevel::Success => "+",
            strobe_core::OutputLevel::Failure => "x",
            strobe_core::OutputLevel::Info => "*",
        };
        let mut line = if item.no_port {
            format!(
                "[{}] {} {} {} {} {}",
                marker,
                item.time.format("%Y-%m-%dT%H:%M:%SZ"),
                item.ip_proto,
                item.ip_them,
                item.classification,
                item.reason,
            )
        } else {
            format!(
                "[{}] {} {} {}:{} {} {}",
                marker,
                item.time.format("%Y-%m-%dT%H:%M:%SZ"),
                item.ip_proto,
                item.ip_them,
                item.port_them,
                item.classification,
                item.reason,
            )
        };
        for (key, value) in item.report.iter() {
            line.push_str(&format!(" {}={:?}", key, value_display(value)));
        }
        self.target.write_line(&line);
    }

    fn close(&mut self) {
        self.target.flush();
    }
}

/// One serialized record per line
pub struct NdjsonSink {
    target: Target,
}

impl NdjsonSink {
    pub fn create(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            target: Target::create(path)?,
        })
    }
}

impl OutputSink for NdjsonSink {
    fn publish(&mut self, item: &OutItem) {
        match serde_json::to_string(item) {
            Ok(line) => self.target.write_line(&line),
            Err(e) => tracing::warn!("record serialization failed: {}", e),
        }
    }

    fn close(&mut self) {
        self.target.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use strobe_core::{Address, IpProto, OutputLevel};

    fn item() -> OutItem {
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
        item
    }

    #[test]
    fn test_text_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut sink = TextSink::create(Some(&path)).unwrap();
        sink.publish(&item());
        sink.close();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[+] "));
        assert!(text.contains("198.51.100.5:80"));
        assert!(text.contains("open syn-ack"));
        assert!(text.contains("win=\"64240\""));
    }

    #[test]
    fn test_ndjson_sink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let mut sink = NdjsonSink::create(Some(&path)).unwrap();
        sink.publish(&item());
        sink.publish(&item());
        sink.close();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["classification"], "open");
        assert_eq!(parsed["port_them"], 80);
        assert_eq!(parsed["level"], "success");
    }
}
