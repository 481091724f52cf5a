//! Identity file (public key) authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::engine::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Public key authentication with a passphrase-less identity file.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        debug!(user = %username, "Offering identity {}", self.key_path.display());
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| {
            format!(
                "Failed to load identity {}: {}",
                self.key_path.display(),
                e
            )
        })?;

        // RSA keys need the strongest hash the server supports
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_auth_keeps_path() {
        let auth = KeyAuth::new("/home/deploy/.ssh/id_ed25519");
        assert_eq!(auth.key_path, PathBuf::from("/home/deploy/.ssh/id_ed25519"));
        assert_eq!(auth.name(), "key");
    }
}
