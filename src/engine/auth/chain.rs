//! Ordered fallback over several strategies.

use std::path::PathBuf;

use async_trait::async_trait;
use russh::client;
use tracing::{debug, warn};

use crate::engine::config::EngineConfig;
use crate::engine::host::Host;
use crate::engine::session::SshClientHandler;

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

/// Tries strategies in the order they were added until one succeeds.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Chain for `host`: its password, then its identity file or the
    /// engine-wide one.
    ///
    /// A configured identity file that does not exist is skipped with a
    /// warning.
    pub fn for_host(host: &Host, config: &EngineConfig) -> Self {
        let mut chain = Self::new();

        if let Some(password) = &host.password {
            chain = chain.with_password(password.clone());
        }

        if let Some(identity) = host.identity.as_ref().or(config.identity.as_ref()) {
            if identity.exists() {
                chain = chain.with_key(identity.clone());
            } else {
                warn!(host = %host, "Identity file {} not found, skipping", identity.display());
            }
        }

        chain
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_path)));
        self
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No credentials available (no password and no identity file)".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
