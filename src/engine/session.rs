//! russh client handler with permissive known-hosts checking.
//!
//! When a known_hosts file is configured and present, server keys are
//! checked against it:
//!
//! - a key matching a recorded entry is accepted;
//! - a host with no entry is accepted with a warning;
//! - a key that differs from the recorded one is rejected.
//!
//! Without a known_hosts file every key is accepted, similar to
//! `StrictHostKeyChecking=no` in OpenSSH.

use std::path::PathBuf;

use russh::keys::known_hosts::check_known_hosts_path;
use russh::{client, keys};
use tracing::{debug, error, warn};

pub struct SshClientHandler {
    hostname: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl SshClientHandler {
    pub fn new(hostname: impl Into<String>, port: u16, known_hosts: Option<PathBuf>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            known_hosts,
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            return Ok(true);
        };

        match check_known_hosts_path(&self.hostname, self.port, server_public_key, path) {
            Ok(true) => {
                debug!(host = %self.hostname, port = self.port, "Host key verified");
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    host = %self.hostname,
                    port = self.port,
                    "Host key not found in {}, accepting",
                    path.display()
                );
                Ok(true)
            }
            Err(keys::Error::KeyChanged { line }) => {
                error!(
                    host = %self.hostname,
                    port = self.port,
                    line = line,
                    "Host key does not match {}",
                    path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    host = %self.hostname,
                    "Unable to check {}: {}, accepting host key",
                    path.display(),
                    e
                );
                Ok(true)
            }
        }
    }
}
