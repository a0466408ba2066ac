//! Container standard streams.
//!
//! Each container owns two [`BroadcastWriter`]s (stdout, stderr) that fan
//! process output out to attached readers and to the container's
//! JSON-lines log, plus a stdin pipe whose read end goes to one run.
//!
//! Log lines look like:
//!
//! ```text
//! {"log":"hello\n","stream":"stdout","time":"2024-05-01T12:00:00.000000001Z"}
//! ```

use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tracing::warn;

/// Chunks buffered per attached reader before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Buffer size of the stdin pipe.
const STDIN_PIPE_SIZE: usize = 64 * 1024;

#[derive(Serialize)]
struct LogEntry<'a> {
    log: &'a str,
    stream: &'a str,
    time: String,
}

/// Fan-out writer for one output stream.
#[derive(Debug)]
pub struct BroadcastWriter {
    stream: &'static str,
    sender: broadcast::Sender<Vec<u8>>,
    log: Mutex<Option<File>>,
}

impl BroadcastWriter {
    pub fn new(stream: &'static str) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            stream,
            sender,
            log: Mutex::new(None),
        }
    }

    fn log_file(&self) -> MutexGuard<'_, Option<File>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends output to `path` from now on.
    pub fn set_log(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.log_file() = Some(file);
        Ok(())
    }

    /// Attaches a reader receiving every chunk written from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }

    /// Publishes a chunk of output.
    ///
    /// Having no attached readers is not an error. A failing log write is
    /// reported and the log is dropped, output keeps flowing to readers.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let _ = self.sender.send(data.to_vec());

        let mut log = self.log_file();
        if let Some(file) = log.as_mut() {
            let entry = LogEntry {
                log: &String::from_utf8_lossy(data),
                stream: self.stream,
                time: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            };
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            if let Err(e) = file.write_all(&line) {
                warn!("dropping {} log after write error: {}", self.stream, e);
                *log = None;
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    /// Closes the log file.
    pub fn clean(&self) {
        *self.log_file() = None;
    }
}

/// Streams of one container.
#[derive(Debug)]
pub struct StreamConfig {
    pub stdout: Arc<BroadcastWriter>,
    pub stderr: Arc<BroadcastWriter>,
    /// Write end of the current stdin pipe.
    stdin: Mutex<Option<DuplexStream>>,
    /// Read end, until the next run takes it.
    stdin_reader: Mutex<Option<DuplexStream>>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self {
            stdout: Arc::new(BroadcastWriter::new("stdout")),
            stderr: Arc::new(BroadcastWriter::new("stderr")),
            stdin: Mutex::new(None),
            stdin_reader: Mutex::new(None),
        }
    }

    fn stdin_slot(&self) -> MutexGuard<'_, Option<DuplexStream>> {
        self.stdin.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stdin_reader_slot(&self) -> MutexGuard<'_, Option<DuplexStream>> {
        self.stdin_reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends both output streams to the JSON log at `path`.
    pub fn set_log(&self, path: &Path) -> Result<()> {
        self.stdout.set_log(path)?;
        self.stderr.set_log(path)
    }

    /// Creates a fresh stdin pipe, replacing any previous one.
    pub fn open_stdin_pipe(&self) {
        let (writer, reader) = tokio::io::duplex(STDIN_PIPE_SIZE);
        *self.stdin_slot() = Some(writer);
        *self.stdin_reader_slot() = Some(reader);
    }

    /// Read end of the stdin pipe for the next run, opening a pipe if the
    /// previous run consumed it.
    pub fn take_stdin_reader(&self) -> DuplexStream {
        if let Some(reader) = self.stdin_reader_slot().take() {
            return reader;
        }
        let (writer, reader) = tokio::io::duplex(STDIN_PIPE_SIZE);
        *self.stdin_slot() = Some(writer);
        reader
    }

    /// Takes the write end of the stdin pipe for an attaching client.
    pub fn take_stdin(&self) -> Option<DuplexStream> {
        self.stdin_slot().take()
    }

    /// Closes stdin and the logs.
    pub fn close(&self) {
        self.stdin_slot().take();
        self.stdin_reader_slot().take();
        self.stdout.clean();
        self.stderr.clean();
    }
}
