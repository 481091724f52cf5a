//! Remote deployment engine.
//!
//! This module is organized into the following submodules:
//!
//! - `host`: Host identity, credentials and upload capability
//! - `config`: Timeouts and paths resolved from parameters and environment
//! - `error`: Error taxonomy and host fatality
//! - `output`: Shell output capture and fan-out to sinks
//! - `session`, `auth`, `connection`: SSH session and shell channel
//! - `transport`, `prompt`, `shell`: Interactive shell automation
//! - `queue`: Per-host serialized task execution
//! - `command`, `registry`: Commands and stopping started components
//! - `handler`: Per-host pipeline
//! - `fleet`: Parallel fan-out over many hosts
//! - `notify`: Host-scoped notifications
//! - `types`: Deployment plan file and reports

pub(crate) mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod fleet;
pub mod handler;
pub mod host;
pub mod notify;
pub mod output;
pub mod prompt;
pub mod queue;
pub mod registry;
pub(crate) mod session;
pub mod shell;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use command::{Command, CommandDescriptor, ShellCommand, Transfer};
pub use config::EngineConfig;
pub use connection::{Connector, SshConnector};
pub use error::{EngineError, Result};
pub use fleet::Fleet;
pub use handler::HostHandler;
pub use host::{AssetBundle, AssetTransfer, Host, Uploader};
pub use notify::{NotificationLevel, Notifier, TracingNotifier};
pub use output::{OutputMultiplexer, OutputSink};
pub use registry::{CommandTokenStrategy, StopStrategy};
pub use types::{DeploymentPlan, HostReport, PlannedCommand};
