// src/sniff.rs
use std::collections::VecDeque;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::SourceError;
use crate::models::domain::PacketRecord;
use crate::parser::{decode_tshark, FrameSplitter};
use crate::source::{StopToken, TrafficSource};

const READ_CHUNK: usize = 8 * 1024;
// chunks in flight between the pipe readers and the ingest worker
const CHANNEL_DEPTH: usize = 16;
const STDERR_LINE_MAX: usize = 4 * 1024;
const STDERR_DRAIN: Duration = Duration::from_millis(200);
const TERM_GRACE: Duration = Duration::from_millis(500);

enum Chunk {
    Stdout(String),
    Stderr(String),
    Closed,
}

/// Live capture through a spawned tshark process.
pub struct LiveCapture {
    interface: String,
    child: Option<Child>,
    chunks: Receiver<Chunk>,
    splitter: FrameSplitter,
    pending: VecDeque<Value>,
    stderr_line: String,
    last_stderr: Option<String>,
    delivered: u64,
}

impl LiveCapture {
    pub fn spawn(config: &Config, interface: &str) -> Result<Self, SourceError> {
        let mut command = capture_command(config, interface);
        let mut child = command
            .spawn()
            .map_err(|err| classify_spawn_error(err, &config.tshark))?;

        let (sender, chunks) = bounded(CHANNEL_DEPTH);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::SourceUnavailable("capture output pipes unavailable".into()));
        };
        start_reader(stdout, sender.clone(), Chunk::Stdout, true);
        start_reader(stderr, sender, Chunk::Stderr, false);

        info!(interface, pid = child.id(), "capture process started");
        Ok(Self {
            interface: interface.to_string(),
            child: Some(child),
            chunks,
            splitter: FrameSplitter::new(config.buffer_limit),
            pending: VecDeque::new(),
            stderr_line: String::new(),
            last_stderr: None,
            delivered: 0,
        })
    }

    // Feeds stderr text through line assembly. Returns the first line that
    // means the capture cannot run.
    fn absorb_stderr(&mut self, text: &str) -> Option<SourceError> {
        for piece in text.split_inclusive('\n') {
            // overlong lines are clipped
            if self.stderr_line.len() + piece.len() <= STDERR_LINE_MAX {
                self.stderr_line.push_str(piece);
            }
            if !piece.ends_with('\n') {
                continue;
            }
            let line = std::mem::take(&mut self.stderr_line);
            let line = line.trim_end();
            if let Some(err) = classify_stderr(line, &self.interface) {
                return Some(err);
            }
            if !line.is_empty() {
                debug!(interface = %self.interface, "{line}");
                self.last_stderr = Some(line.to_string());
            }
        }
        None
    }

    fn finish(&mut self) -> Result<Option<PacketRecord>, SourceError> {
        // stderr may still be in flight after stdout closed
        while let Ok(chunk) = self.chunks.recv_timeout(STDERR_DRAIN) {
            if let Chunk::Stderr(text) = chunk {
                if let Some(err) = self.absorb_stderr(&text) {
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        let status = self.child.take().map(|mut child| child.wait());
        if !self.stderr_line.is_empty() {
            let rest = std::mem::take(&mut self.stderr_line);
            self.last_stderr = Some(rest.trim_end().to_string());
        }
        match status {
            Some(Ok(status)) if !status.success() && self.delivered == 0 => {
                let detail = self
                    .last_stderr
                    .take()
                    .unwrap_or_else(|| format!("capture exited with {status}"));
                Err(SourceError::SourceUnavailable(detail))
            }
            _ => {
                info!(interface = %self.interface, delivered = self.delivered, "capture output ended");
                Ok(None)
            }
        }
    }
}

impl TrafficSource for LiveCapture {
    fn describe(&self) -> String {
        format!("live capture on {}", self.interface)
    }

    fn next_record(&mut self, stop: &StopToken) -> Result<Option<PacketRecord>, SourceError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                let record = decode_tshark(&frame)?;
                self.delivered += 1;
                return Ok(Some(record));
            }
            select! {
                recv(stop.receiver()) -> _ => {
                    self.shutdown();
                    return Ok(None);
                }
                recv(self.chunks) -> chunk => match chunk {
                    Ok(Chunk::Stdout(text)) => self.pending.extend(self.splitter.push(&text)),
                    Ok(Chunk::Stderr(text)) => {
                        if let Some(err) = self.absorb_stderr(&text) {
                            self.shutdown();
                            return Err(err);
                        }
                    }
                    Ok(Chunk::Closed) | Err(_) => return self.finish(),
                },
            }
        }
    }

    /// Stops the capture process and reaps it.
    ///
    /// SIGTERM goes first: under `--sudo` the child is sudo, which relays
    /// SIGTERM to tshark but cannot relay SIGKILL. The kill after the grace
    /// period only reaches sudo itself.
    fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !(terminate(&child) && exited_within(&mut child, TERM_GRACE)) {
                if let Err(err) = child.kill() {
                    debug!(%err, "capture process already gone");
                }
            }
            let _ = child.wait();
            info!(interface = %self.interface, "capture process stopped");
        }
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_command(config: &Config, interface: &str) -> Command {
    let mut command = if config.sudo {
        let mut sudo = Command::new("sudo");
        sudo.arg(&config.tshark);
        sudo
    } else {
        Command::new(&config.tshark)
    };
    command
        .args(["-i", interface, "-T", "json", "-l", "-n", "-f", "ip"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // own process group, so terminal signals reach us and not the capture,
    // and sudo relays the SIGTERM we send
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: the child has not been reaped, so its pid is still ours.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

fn exited_within(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            _ => return false,
        }
    }
}

// Reader threads end on EOF; only stdout reports it since that ends the feed.
// Reads are fixed-size and the channel is bounded, so a stalled worker backs
// up into the pipe rather than into memory.
fn start_reader<R>(mut stream: R, sender: Sender<Chunk>, wrap: fn(String) -> Chunk, report_close: bool)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut carry = Vec::new();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decode_chunk(&mut carry, &buf[..n]);
                    if !text.is_empty() && sender.send(wrap(text)).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(%err, "capture pipe read failed");
                    break;
                }
            }
        }
        if !carry.is_empty() {
            warn!(bytes = carry.len(), "capture output ended inside a UTF-8 sequence");
        }
        if report_close {
            let _ = sender.send(Chunk::Closed);
        }
    });
}

// Decodes `bytes` after any held-back tail, holding back a trailing sequence
// that is still incomplete. Invalid bytes become U+FFFD.
fn decode_chunk(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let cut = carry.len() - incomplete_tail(carry);
    let text = String::from_utf8_lossy(&carry[..cut]).into_owned();
    carry.drain(..cut);
    text
}

fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

fn classify_spawn_error(err: io::Error, program: &str) -> SourceError {
    match err.kind() {
        io::ErrorKind::NotFound => SourceError::SourceUnavailable(format!("{program} not found")),
        io::ErrorKind::PermissionDenied => {
            SourceError::PermissionDenied(format!("not allowed to run {program}"))
        }
        _ => SourceError::Io(err),
    }
}

fn classify_stderr(line: &str, interface: &str) -> Option<SourceError> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("don't have permission") {
        return Some(SourceError::PermissionDenied(line.trim().to_string()));
    }
    if lower.contains("no such device")
        || lower.contains("there is no device named")
        || lower.contains("no interfaces found")
    {
        return Some(SourceError::SourceUnavailable(format!(
            "interface {interface}: {}",
            line.trim()
        )));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_is_classified() {
        let denied = classify_stderr(
            "tshark: You don't have permission to capture on that device (socket: Operation not permitted)",
            "eth0",
        );
        assert!(matches!(denied, Some(SourceError::PermissionDenied(_))));

        let missing = classify_stderr("tshark: There is no device named \"eth9\".", "eth9");
        assert!(matches!(missing, Some(SourceError::SourceUnavailable(_))));

        assert!(classify_stderr("Capturing on 'eth0'", "eth0").is_none());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let config = Config {
            tshark: "/nonexistent/flowgraph-tshark".into(),
            ..Config::default()
        };
        let err = LiveCapture::spawn(&config, "eth0").err().unwrap();
        assert!(matches!(err, SourceError::SourceUnavailable(_)));
    }

    #[test]
    fn command_line_matches_capture_contract() {
        let config = Config {
            sudo: true,
            ..Config::default()
        };
        let command = capture_command(&config, "wlan0");
        assert_eq!(command.get_program(), "sudo");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["tshark", "-i", "wlan0", "-T", "json", "-l", "-n", "-f", "ip"]);
    }

    #[test]
    fn reader_sends_bounded_chunks_and_keeps_characters_whole() {
        let text = format!("a{}", "é".repeat(50_000));
        let (sender, chunks) = bounded(CHANNEL_DEPTH);
        start_reader(io::Cursor::new(text.clone().into_bytes()), sender, Chunk::Stdout, true);

        let mut received = String::new();
        loop {
            match chunks.recv().unwrap() {
                Chunk::Stdout(chunk) => {
                    assert!(chunk.len() <= READ_CHUNK + 3, "chunk of {} bytes", chunk.len());
                    received.push_str(&chunk);
                }
                Chunk::Stderr(_) => unreachable!(),
                Chunk::Closed => break,
            }
        }
        assert_eq!(received, text);
    }

    #[test]
    fn split_characters_are_held_until_complete() {
        let mut carry = Vec::new();
        let euro = "€".as_bytes();
        assert_eq!(decode_chunk(&mut carry, &euro[..1]), "");
        assert_eq!(decode_chunk(&mut carry, &euro[1..2]), "");
        assert_eq!(decode_chunk(&mut carry, &euro[2..]), "€");
        assert_eq!(decode_chunk(&mut carry, b"ok\xff!"), "ok\u{fffd}!");
        assert!(carry.is_empty());
    }

    #[cfg(unix)]
    fn fake_tshark(dir: &std::path::Path, body: &str) -> Config {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-tshark");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh\necho \"Capturing on '$2'\" >&2\n{body}").unwrap();
        drop(file);
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        Config {
            tshark: script.display().to_string(),
            ..Config::default()
        }
    }

    // a freshly written script can briefly fail with ETXTBSY
    #[cfg(unix)]
    fn spawn_retrying(config: &Config) -> LiveCapture {
        let mut attempts = 0;
        loop {
            match LiveCapture::spawn(config, "lo") {
                Err(SourceError::Io(_)) if attempts < 20 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(50));
                }
                other => break other.unwrap(),
            }
        }
    }

    #[cfg(unix)]
    fn dns_export(dir: &std::path::Path, copies: usize) -> std::path::PathBuf {
        let packet = serde_json::json!({"_source": {"layers": {
            "frame": {"frame.time_epoch": "10.0"},
            "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2", "ip.len": "60"},
            "udp": {"udp.srcport": "5000", "udp.dstport": "53"}
        }}});
        let body = serde_json::to_string_pretty(&vec![packet; copies]).unwrap();
        let output = dir.join("capture.json");
        std::fs::write(&output, body).unwrap();
        output
    }

    #[cfg(unix)]
    #[test]
    fn streams_records_from_capture_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dns_export(dir.path(), 2);
        let config = fake_tshark(dir.path(), &format!("cat '{}'", output.display()));

        let mut capture = spawn_retrying(&config);
        let (_signal, stop) = StopToken::pair();
        let first = capture.next_record(&stop).unwrap().unwrap();
        assert_eq!(first.dest_port, Some(53));
        assert!(capture.next_record(&stop).unwrap().is_some());
        assert!(capture.next_record(&stop).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn newline_free_output_stays_within_buffer_limit() {
        let dir = tempfile::tempdir().unwrap();
        let output = dns_export(dir.path(), 1);
        let body = format!(
            "head -c 4000000 /dev/zero | tr '\\000' x\nprintf '\\n'\ncat '{}'",
            output.display()
        );
        let config = Config {
            buffer_limit: 1000,
            ..fake_tshark(dir.path(), &body)
        };

        let mut capture = spawn_retrying(&config);
        let (_signal, stop) = StopToken::pair();
        let record = capture.next_record(&stop).unwrap().unwrap();
        assert_eq!(record.dest_port, Some(53));
        assert!(capture.splitter.pending() <= config.buffer_limit);
        assert!(capture.splitter.resyncs() >= 1);
        assert!(capture.next_record(&stop).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn stop_terminates_a_silent_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_tshark(dir.path(), "exec sleep 30");

        let mut capture = spawn_retrying(&config);
        let started = Instant::now();
        capture.shutdown();
        assert!(capture.child.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
