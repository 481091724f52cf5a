//! Byte stream beneath an interactive shell.
//!
//! [`ShellTransport`] is the seam between the shell protocol and russh: the
//! protocol only ever sends lines and receives chunks. [`RusshTransport`]
//! drives a pty channel; tests drive a scripted in-memory shell.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tracing::debug;

use super::error::{EngineError, Result};

#[async_trait]
pub trait ShellTransport: Send {
    /// Write raw bytes to the remote shell.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Next chunk of output, or `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Write handle for a pty channel.
///
/// Wraps `russh::ChannelWriteHalf` so the connection can close the channel
/// while the shell owns the read half.
pub struct ChannelWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    pub async fn write(&self, data: &[u8]) -> std::result::Result<(), String> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| format!("Failed to write to shell: {}", e))
    }

    pub async fn close(&self) -> std::result::Result<(), String> {
        self.write_half
            .close()
            .await
            .map_err(|e| format!("Failed to close shell channel: {}", e))
    }
}

/// Shell transport over a russh pty channel.
pub struct RusshTransport {
    reader: ChannelReadHalf,
    writer: Arc<ChannelWriter>,
    open: Arc<AtomicBool>,
}

impl RusshTransport {
    pub fn new(reader: ChannelReadHalf, writer: Arc<ChannelWriter>, open: Arc<AtomicBool>) -> Self {
        Self {
            reader,
            writer,
            open,
        }
    }
}

#[async_trait]
impl ShellTransport for RusshTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(EngineError::Channel("channel is closed".to_string()));
        }
        self.writer.write(data).await.map_err(EngineError::Channel)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.reader.wait().await {
                Some(ChannelMsg::Data { data }) => return Some(data.to_vec()),
                // A pty merges stderr into the stream; keep it if a server sends it apart
                Some(ChannelMsg::ExtendedData { data, .. }) => return Some(data.to_vec()),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("Shell channel reached end of stream");
                    self.open.store(false, Ordering::Release);
                    return None;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Remote shell exited with status {}", exit_status);
                }
                Some(_) => {}
            }
        }
    }
}
