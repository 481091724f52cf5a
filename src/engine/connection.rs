//! SSH session and interactive channel for one host.
//!
//! ## Connection Lifecycle
//!
//! 1. **Connect**: TCP connect and SSH handshake, bounded by the connection
//!    timeout. Server keys are checked by [`SshClientHandler`].
//! 2. **Authenticate**: the host's [`AuthChain`] (password, then identity).
//! 3. **Open the shell**: one session channel with a pty and a login shell.
//!    Its read half becomes the [`RusshTransport`] driven by the shell
//!    protocol; its write half stays here so [`HostConnection::close`] can
//!    end the channel before the session.
//!
//! No step is ever retried; every failure is an [`EngineError::Connection`].
//!
//! The [`Connector`] and [`HostLink`] traits let a host pipeline run against
//! something other than a live SSH server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::{Channel, Disconnect, client};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::EngineConfig;
use super::error::{EngineError, Result};
use super::host::Host;
use super::session::SshClientHandler;
use super::transport::{ChannelWriter, RusshTransport, ShellTransport};

/// Terminal type requested for the pty.
const PTY_TERM: &str = "vt100";
/// Wide enough that long command lines are not wrapped by the terminal.
const PTY_COLUMNS: u32 = 400;
const PTY_ROWS: u32 = 50;

/// Liveness and teardown of an open host session.
#[async_trait]
pub trait HostLink: Send {
    fn is_connected(&self) -> bool;

    /// Tear down the channel, then the session. Safe to call repeatedly.
    async fn close(&mut self) -> Result<bool>;
}

/// Opens a session and its shell stream for a host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        host: &Arc<Host>,
        config: &EngineConfig,
    ) -> Result<(Box<dyn HostLink>, Box<dyn ShellTransport>)>;
}

/// Connector for real SSH servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        host: &Arc<Host>,
        config: &EngineConfig,
    ) -> Result<(Box<dyn HostLink>, Box<dyn ShellTransport>)> {
        let mut connection = HostConnection::new(host.clone());
        let transport = connection.connect(config).await?;
        Ok((Box::new(connection), Box::new(transport)))
    }
}

/// Build the russh client configuration.
///
/// The session lives as long as the deployment, so there is no inactivity
/// timeout; keepalives detect dead peers (30 seconds, at most 3 missed).
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

pub struct HostConnection {
    host: Arc<Host>,
    handle: Option<client::Handle<SshClientHandler>>,
    writer: Option<Arc<ChannelWriter>>,
    open: Arc<AtomicBool>,
}

impl HostConnection {
    /// An unconnected session for `host`.
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            handle: None,
            writer: None,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Connect, authenticate and open the interactive shell channel.
    pub async fn connect(&mut self, config: &EngineConfig) -> Result<RusshTransport> {
        let timeout = config.connection_timeout;
        let host = self.host.clone();
        let failed = |reason: String| EngineError::Connection {
            host: host.to_string(),
            reason,
        };

        let known_hosts = config.known_hosts.clone().filter(|path| {
            let exists = path.exists();
            if !exists {
                warn!(
                    host = %host,
                    "Known hosts file {} not found, accepting any host key",
                    path.display()
                );
            }
            exists
        });
        let handler = SshClientHandler::new(&host.hostname, host.ssh_port, known_hosts);

        let connect_future = client::connect(
            build_client_config(),
            (host.hostname.as_str(), host.ssh_port),
            handler,
        );
        let mut handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| failed(format!("connection timed out after {:?}", timeout)))?
            .map_err(|e| failed(format!("failed to connect: {}", e)))?;

        let chain = AuthChain::for_host(&host, config);
        let authenticated =
            tokio::time::timeout(timeout, chain.authenticate(&mut handle, &host.username))
                .await
                .map_err(|_| failed(format!("authentication timed out after {:?}", timeout)))?
                .map_err(&failed)?;
        if !authenticated {
            return Err(failed("authentication failed".to_string()));
        }

        let channel = tokio::time::timeout(timeout, open_shell(&handle))
            .await
            .map_err(|_| failed(format!("opening shell timed out after {:?}", timeout)))?
            .map_err(&failed)?;

        let (reader, write_half) = channel.split();
        let writer = Arc::new(ChannelWriter::new(write_half));
        self.open.store(true, Ordering::Release);
        self.writer = Some(writer.clone());
        self.handle = Some(handle);

        info!(host = %host, "Connected");
        Ok(RusshTransport::new(reader, writer, self.open.clone()))
    }
}

async fn open_shell(
    handle: &client::Handle<SshClientHandler>,
) -> std::result::Result<Channel<client::Msg>, String> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| format!("failed to open channel: {}", e))?;

    channel
        .request_pty(true, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
        .await
        .map_err(|e| format!("failed to request pty: {}", e))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| format!("failed to start shell: {}", e))?;

    Ok(channel)
}

#[async_trait]
impl HostLink for HostConnection {
    fn is_connected(&self) -> bool {
        let session_open = self.handle.as_ref().is_some_and(|h| !h.is_closed());
        session_open && self.open.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<bool> {
        let mut clean = true;

        if let Some(writer) = self.writer.take() {
            self.open.store(false, Ordering::Release);
            // The remote side may already have closed the channel
            if let Err(e) = writer.close().await {
                debug!(host = %self.host, "{}", e);
            }
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "deployment finished", "en")
                .await
            {
                warn!(host = %self.host, "Failed to disconnect cleanly: {}", e);
                clean = false;
            }
            info!(host = %self.host, "Disconnected");
        }

        Ok(clean && !self.is_connected())
    }
}
