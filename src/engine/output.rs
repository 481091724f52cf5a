//! Capture of everything a host's shell session prints.
//!
//! An [`OutputMultiplexer`] is an append-only log of the text chunks read
//! from one shell channel. Every accepted chunk is forwarded, synchronously
//! and in order, to each attached [`OutputSink`] (the session file, another
//! log, a test probe). One multiplexer exists per host and is passed
//! explicitly to whoever needs it; there is no global instance.
//!
//! Chunks that are empty or contain only whitespace are dropped.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use super::error::{EngineError, Result};
use super::host::Host;

/// Timestamp layout of session file names (millisecond precision).
const SESSION_FILE_TIMESTAMP: &str = "%Y-%m-%d@%H:%M:%S%.3f";

/// A destination that receives a copy of every captured chunk.
pub trait OutputSink: Send + Sync {
    fn write_chunk(&self, chunk: &str) -> io::Result<()>;
}

/// Append-only capture of a shell session with fan-out to sinks.
#[derive(Default)]
pub struct OutputMultiplexer {
    logs: Mutex<Vec<String>>,
    replicas: Mutex<Vec<Arc<dyn OutputSink>>>,
}

impl OutputMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every subsequently appended chunk to `sink`.
    pub fn echo_to(&self, sink: Arc<dyn OutputSink>) {
        lock(&self.replicas).push(sink);
    }

    /// Append a chunk, returning whether it was kept.
    pub fn append(&self, chunk: &str) -> bool {
        if chunk.trim().is_empty() {
            return false;
        }

        lock(&self.logs).push(chunk.to_string());

        let replicas = lock(&self.replicas).clone();
        for sink in replicas {
            if let Err(e) = sink.write_chunk(chunk) {
                warn!("Failed to echo shell output to sink: {}", e);
            }
        }

        true
    }

    /// Independent copy of the captured chunks.
    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.logs).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.logs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.replicas).len()
    }
}

// A poisoned lock only means a sink panicked mid-write; the captured data is
// still a valid prefix, so keep using it.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lets one host's capture be replicated into another log.
impl OutputSink for OutputMultiplexer {
    fn write_chunk(&self, chunk: &str) -> io::Result<()> {
        self.append(chunk);
        Ok(())
    }
}

/// Writes captured output to a session file.
pub struct FileSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileSink {
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file: Mutex::new(file),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputSink for FileSink {
    fn write_chunk(&self, chunk: &str) -> io::Result<()> {
        let mut file = lock(&self.file);
        file.write_all(chunk.as_bytes())?;
        file.flush()
    }
}

/// Forwards captured output to the tracing subscriber at debug level.
pub struct TracingSink {
    host: String,
}

impl TracingSink {
    pub fn new(host: &Host) -> Self {
        Self {
            host: host.to_string(),
        }
    }
}

impl OutputSink for TracingSink {
    fn write_chunk(&self, chunk: &str) -> io::Result<()> {
        debug!(host = %self.host, "{}", chunk.trim_end());
        Ok(())
    }
}

/// Path of the session file for `host` started at `started_at`.
pub(crate) fn session_file_path(
    sessions_dir: &Path,
    subsystem: &str,
    host: &Host,
    started_at: DateTime<Local>,
) -> PathBuf {
    let file_name = format!(
        "{}-{}.txt",
        host,
        started_at.format(SESSION_FILE_TIMESTAMP)
    );
    sessions_dir.join(subsystem).join(file_name)
}

/// Create the per-host session file, including its parent directories.
pub(crate) fn create_session_file(
    sessions_dir: &Path,
    subsystem: &str,
    host: &Host,
) -> Result<FileSink> {
    let path = session_file_path(sessions_dir, subsystem, host, Local::now());

    let setup_error = |source| EngineError::SetupIo {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(setup_error)?;
    }
    let file = File::create(&path).map_err(setup_error)?;

    debug!(host = %host, path = %path.display(), "Created session output file");
    Ok(FileSink::new(file, path))
}
