use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{MalformedRecord, SourceError};
use crate::models::domain::PacketRecord;
use crate::parser::{decode_canonical, decode_tshark, FrameSplitter};
use crate::source::{StopToken, TrafficSource};

const MAX_GAP: Duration = Duration::from_secs(1);
const SPLIT_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// A `tshark -T json` export: one JSON array of packet objects.
    TsharkExport,
    /// One canonical record per line.
    JsonLines,
}

/// Replays a recording in file order, optionally at its original pace.
pub struct Replay {
    path: PathBuf,
    reader: BufReader<File>,
    format: Format,
    splitter: FrameSplitter,
    pending: VecDeque<serde_json::Value>,
    pacing: bool,
    previous: Option<f64>,
    line: Vec<u8>,
    line_no: u64,
    replayed: u64,
}

impl Replay {
    pub fn open(path: &Path, pacing: bool) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                SourceError::SourceUnavailable(format!("recording {} not found", path.display()))
            }
            io::ErrorKind::PermissionDenied => {
                SourceError::PermissionDenied(format!("cannot read {}", path.display()))
            }
            _ => SourceError::Io(err),
        })?;
        let mut reader = BufReader::new(file);
        let format = detect_format(&mut reader)?;
        info!(path = %path.display(), ?format, pacing, "replaying recording");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            format,
            splitter: FrameSplitter::new(SPLIT_LIMIT),
            pending: VecDeque::new(),
            pacing,
            previous: None,
            line: Vec::new(),
            line_no: 0,
            replayed: 0,
        })
    }

    // Next decoded record in file order; Ok(None) at end of file.
    fn read_record(&mut self) -> Result<Option<PacketRecord>, SourceError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(decode_tshark(&frame)?));
            }
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            match self.format {
                Format::TsharkExport => {
                    let text = String::from_utf8_lossy(&self.line);
                    let frames = self.splitter.push(&text);
                    self.pending.extend(frames);
                }
                Format::JsonLines => {
                    let text = match std::str::from_utf8(&self.line) {
                        Ok(text) => text.trim(),
                        Err(err) => {
                            debug!(line = self.line_no, %err, "skipping recording line");
                            let err = MalformedRecord::invalid("record", format!("not UTF-8: {err}"));
                            return Err(err.into());
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    return decode_canonical(text).map(Some).map_err(|err| {
                        debug!(line = self.line_no, %err, "skipping recording line");
                        SourceError::from(err)
                    });
                }
            }
        }
    }

    fn pace(&mut self, timestamp: f64, stop: &StopToken) -> bool {
        let gap = match self.previous.replace(timestamp) {
            Some(previous) if timestamp > previous => {
                Duration::from_secs_f64(timestamp - previous).min(MAX_GAP)
            }
            _ => Duration::ZERO,
        };
        !gap.is_zero() && stop.sleep(gap)
    }
}

impl TrafficSource for Replay {
    fn describe(&self) -> String {
        format!("replay of {}", self.path.display())
    }

    fn next_record(&mut self, stop: &StopToken) -> Result<Option<PacketRecord>, SourceError> {
        if stop.is_stopped() {
            return Ok(None);
        }
        let Some(record) = self.read_record()? else {
            info!(path = %self.path.display(), replayed = self.replayed, "recording finished");
            return Ok(None);
        };
        if self.pacing && self.pace(record.timestamp, stop) {
            return Ok(None);
        }
        self.replayed += 1;
        Ok(Some(record))
    }
}

fn detect_format<R: Read>(reader: &mut BufReader<R>) -> io::Result<Format> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(Format::JsonLines);
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => {
                return Ok(if buf[i] == b'[' {
                    Format::TsharkExport
                } else {
                    Format::JsonLines
                })
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}
