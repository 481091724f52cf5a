//! SSH authentication strategies.
//!
//! A host authenticates with whatever credentials it has, tried in order:
//! its password first, then the resolved identity file.

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
