//! Packet source boundary.
//!
//! Capture acquisition itself lives outside this crate; what the dissectors
//! need is an ordered, replayable sequence of [`PacketRecord`]s per session.
//! [`PacketSource`] is that seam, and [`JsonPacketSource`] reads the
//! pre-recorded JSON-lines packet files the capture side writes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::event::PacketRecord;

/// Source of captured packets. The dissector is agnostic to its origin.
pub trait PacketSource {
    /// Next packet in capture order, or `None` at end of stream.
    fn next_packet(&mut self) -> Result<Option<PacketRecord>>;
}

/// Reads one `PacketRecord` JSON object per line from a capture file.
pub struct JsonPacketSource {
    reader: BufReader<File>,
    path: PathBuf,
    line_no: u64,
}

impl JsonPacketSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path,
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PacketSource for JsonPacketSource {
    fn next_packet(&mut self) -> Result<Option<PacketRecord>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut record: PacketRecord =
                serde_json::from_str(trimmed).map_err(crate::error::SinkError::from)?;
            if record.source_file.is_empty() {
                record.source_file = self.path.display().to_string();
            }
            if record.position == 0 {
                record.position = self.line_no;
            }
            return Ok(Some(record));
        }
    }
}
