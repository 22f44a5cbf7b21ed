//! Optional pcap output
//!
//! Frames that pass a scan module's `validate` can be appended to a
//! standard pcap file with microsecond timestamps. The link-layer type of
//! the file matches the capture handle so the frames replay cleanly.

use crate::datalink::LinkType;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, TsResolution};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use strobe_core::{Error, Result};

pub struct PcapSink {
    writer: PcapWriter<File>,
}

impl PcapSink {
    pub fn create(path: &Path, link: LinkType, snaplen: u32) -> Result<Self> {
        let datalink = match link {
            LinkType::Ethernet => DataLink::ETHERNET,
            LinkType::Raw => DataLink::RAW,
            LinkType::Null => DataLink::NULL,
        };
        let header = PcapHeader {
            snaplen,
            datalink,
            ts_resolution: TsResolution::MicroSecond,
            ..Default::default()
        };
        let file = File::create(path)?;
        let writer = PcapWriter::with_header(file, header)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(Self { writer })
    }

    /// Append one frame with its capture timestamp
    pub fn write_frame(&mut self, frame: &[u8], timestamp: Duration) -> Result<()> {
        let packet = PcapPacket::new(timestamp, frame.len() as u32, frame);
        self.writer
            .write_packet(&packet)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::PcapReader;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pcap");

        let mut sink = PcapSink::create(&path, LinkType::Ethernet, 65_535).unwrap();
        sink.write_frame(&[0xAAu8; 60], Duration::new(100, 250_000)).unwrap();
        sink.write_frame(&[0xBBu8; 42], Duration::new(101, 0)).unwrap();
        drop(sink);

        let file = File::open(&path).unwrap();
        let mut reader = PcapReader::new(file).unwrap();
        let first = reader.next_packet().unwrap().unwrap();
        assert_eq!(first.data.len(), 60);
        assert_eq!(first.timestamp, Duration::new(100, 250_000));
        let second = reader.next_packet().unwrap().unwrap();
        assert_eq!(second.data.len(), 42);
        assert!(reader.next_packet().is_none());
    }
}
