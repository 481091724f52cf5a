//! The authentication strategy seam.

use async_trait::async_trait;
use russh::client;

use crate::engine::session::SshClientHandler;

/// One way of proving the user's identity to the server.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate.
    ///
    /// `Ok(false)` means the server rejected the credentials; `Err` means
    /// the attempt itself could not be made.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}
