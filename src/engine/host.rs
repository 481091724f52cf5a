//! Host identity, credentials and the upload capability.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::error::{EngineError, Result};

/// Width of the fixed display form used to align host-scoped log lines.
const FIXED_DISPLAY_WIDTH: usize = 28;

fn default_ssh_port() -> u16 {
    22
}

/// Pushes asset bundles to a host.
///
/// The engine never implements a transfer protocol itself; whatever is
/// registered here is called verbatim by the transfer command.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, host: &Host, bundle: &AssetBundle) -> std::result::Result<(), String>;
}

/// One local file or directory and its destination on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTransfer {
    pub local: PathBuf,
    pub remote: String,
}

/// A set of assets pushed to a host in one transfer command.
#[derive(Debug, Clone)]
pub struct AssetBundle {
    pub transfers: Vec<AssetTransfer>,
    pub done_message: Option<String>,
    pub fail_message: Option<String>,
}

impl AssetBundle {
    pub fn new(transfers: Vec<AssetTransfer>) -> Self {
        Self {
            transfers,
            done_message: None,
            fail_message: None,
        }
    }

    /// Short human readable summary, used as the transfer command's text.
    pub fn summary(&self) -> String {
        match self.transfers.as_slice() {
            [] => "upload (empty bundle)".to_string(),
            [single] => format!("upload {} -> {}", single.local.display(), single.remote),
            many => format!("upload {} assets", many.len()),
        }
    }
}

/// A remote machine and its resolved credentials.
#[derive(Clone, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-host identity file, overriding the engine-wide one.
    #[serde(default)]
    pub identity: Option<PathBuf>,
    #[serde(skip)]
    uploader: Option<Arc<dyn Uploader>>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            ssh_port: default_ssh_port(),
            password: None,
            identity: None,
            uploader: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Display form padded to a fixed width, for aligned log prefixes.
    pub fn to_fixed_string(&self) -> String {
        format!("{:<width$}", self.to_string(), width = FIXED_DISPLAY_WIDTH)
    }

    /// Upload a bundle through the registered capability.
    pub async fn upload(&self, bundle: &AssetBundle) -> Result<()> {
        let uploader = self.uploader.as_ref().ok_or_else(|| EngineError::Upload {
            host: self.to_string(),
            reason: "no upload capability registered for this host".to_string(),
        })?;

        uploader
            .upload(self, bundle)
            .await
            .map_err(|reason| EngineError::Upload {
                host: self.to_string(),
                reason,
            })
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.ssh_port)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("ssh_port", &self.ssh_port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("identity", &self.identity)
            .field("uploader", &self.uploader.is_some())
            .finish()
    }
}
