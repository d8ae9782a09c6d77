//! JSON-line sink with byte-threshold file rotation.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::SinkError;
use crate::event::{PersistedEvent, SqlEvent};

use super::{EventSink, EventSource};

pub const DEFAULT_ROTATE_BYTES: u64 = 64 * 1024 * 1024;

fn part_path(prefix: &Path, index: u32) -> PathBuf {
    let stem = prefix.to_string_lossy();
    PathBuf::from(format!("{stem}-{index}.json"))
}

/// Writes one JSON object per line to `<prefix>-<index>.json`, opening a new
/// file once the current one passes the byte threshold. The file is created
/// lazily so an eventless run leaves nothing behind.
pub struct RotatingJsonSink {
    prefix: PathBuf,
    rotate_bytes: u64,
    index: u32,
    current_bytes: u64,
    writer: Option<BufWriter<File>>,
}

impl RotatingJsonSink {
    pub fn new(prefix: impl Into<PathBuf>, rotate_bytes: u64) -> Self {
        Self {
            prefix: prefix.into(),
            rotate_bytes,
            index: 0,
            current_bytes: 0,
            writer: None,
        }
    }

    fn open_next(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.writer.is_none() {
            let path = part_path(&self.prefix, self.index);
            debug!(path = %path.display(), "opening json part file");
            self.writer = Some(BufWriter::new(File::create(&path)?));
            self.current_bytes = 0;
        }
        Ok(self.writer.as_mut().unwrap())
    }

    /// Close the current part and move to the next index when writing
    /// `incoming` more bytes would push the file past the threshold.
    fn rotate_if_needed(&mut self, incoming: u64) -> Result<(), SinkError> {
        if self.writer.is_some() && self.current_bytes + incoming > self.rotate_bytes {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
            }
            self.index += 1;
        }
        Ok(())
    }
}

impl EventSink for RotatingJsonSink {
    fn write(&mut self, event: &SqlEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(&PersistedEvent::from(event))?;
        let incoming = line.len() as u64 + 1;
        self.rotate_if_needed(incoming)?;
        let writer = self.open_next()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        self.current_bytes += incoming;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for RotatingJsonSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Reads a rotated JSON-line file set back in write order, following
/// `<prefix>-0.json`, `<prefix>-1.json`, ... until a part is missing.
pub struct JsonEventReader {
    prefix: PathBuf,
    index: u32,
    reader: Option<BufReader<File>>,
}

impl JsonEventReader {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            index: 0,
            reader: None,
        }
    }

    fn advance(&mut self) -> Result<bool, SinkError> {
        let path = part_path(&self.prefix, self.index);
        if !path.exists() {
            return Ok(false);
        }
        info!(path = %path.display(), "reading json part file");
        self.reader = Some(BufReader::new(File::open(&path)?));
        self.index += 1;
        Ok(true)
    }
}

impl EventSource for JsonEventReader {
    fn next_event(&mut self) -> Result<Option<SqlEvent>, SinkError> {
        loop {
            if self.reader.is_none() && !self.advance()? {
                return Ok(None);
            }
            let mut line = String::new();
            let read = self.reader.as_mut().unwrap().read_line(&mut line)?;
            if read == 0 {
                self.reader = None;
                continue;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let persisted: PersistedEvent = serde_json::from_str(trimmed)?;
            return Ok(Some(persisted.into_event()));
        }
    }
}

/// Remove any part files left by a previous run under the same prefix.
pub fn remove_previous(prefix: &Path) -> Result<u32, SinkError> {
    let mut removed = 0;
    for index in 0.. {
        let path = part_path(prefix, index);
        if !path.exists() {
            break;
        }
        fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}
