//! Error taxonomy for the remote execution engine.
//!
//! Every failure raised by a host pipeline is an [`EngineError`]. Errors are
//! scoped to the host that produced them: a fatal error stops that host's
//! pipeline and nothing else.
//!
//! # Host-fatal errors
//!
//! Some errors leave the shell session in a state the engine cannot automate
//! any further (the transport is gone, the shell is not one we know how to
//! drive, the session artifact cannot be written). [`EngineError::is_fatal_for_host`]
//! identifies them. Once one is seen the host's handler refuses new commands
//! and the fleet stops handing the host out.
//!
//! No error is ever retried by the engine itself.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Transport or authentication failure while connecting.
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// The remote login shell is not one the prompt protocol supports.
    #[error("Shell not supported on {host}: '{shell}'")]
    UnsupportedShell { host: String, shell: String },

    /// A bounded wait for a shell pattern exceeded its deadline.
    #[error("Timed out after {}ms waiting for pattern '{pattern}' on {host}", .after.as_millis())]
    Timeout {
        host: String,
        pattern: String,
        after: Duration,
    },

    /// A submitted command failed its remote interaction.
    #[error("Command '{command}' failed on {host}: {source}")]
    CommandExecution {
        host: String,
        command: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The session output artifact could not be created.
    #[error("Unable to create session output file {}: {source}", .path.display())]
    SetupIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The interactive channel reported EOF or was closed.
    #[error("Shell channel to {host} closed unexpectedly")]
    ChannelClosed { host: String },

    /// Writing to the interactive channel failed.
    #[error("Shell channel error: {0}")]
    Channel(String),

    /// The host's upload capability reported a failure.
    #[error("Upload to {host} failed: {reason}")]
    Upload { host: String, reason: String },

    /// Submission was attempted on a queue that has been shut down.
    #[error("Task queue for {queue} is shut down")]
    QueueClosed { queue: String },

    /// A task was discarded before producing a result (shutdown or panic).
    #[error("Task '{task}' was dropped before completion")]
    TaskDropped { task: String },

    /// An operation needs a pipeline stage that has not been reached yet.
    #[error("Host {host} is not ready: {reason}")]
    NotReady { host: String, reason: String },

    /// Stopping executions failed part way; `stopped` components were stopped.
    #[error("Stopping executions on {host} incomplete after {stopped} stopped: {source}")]
    StopIncomplete {
        host: String,
        stopped: usize,
        #[source]
        source: Box<EngineError>,
    },

    /// A required configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether this error ends all automation on the host that raised it.
    pub fn is_fatal_for_host(&self) -> bool {
        match self {
            EngineError::Connection { .. }
            | EngineError::UnsupportedShell { .. }
            | EngineError::SetupIo { .. }
            | EngineError::ChannelClosed { .. } => true,
            EngineError::CommandExecution { source, .. }
            | EngineError::StopIncomplete { source, .. } => source.is_fatal_for_host(),
            _ => false,
        }
    }

    /// Components stopped before a stop run failed, if this is such a failure.
    pub fn stopped_before_failure(&self) -> Option<usize> {
        match self {
            EngineError::StopIncomplete { stopped, .. } => Some(*stopped),
            EngineError::CommandExecution { source, .. } => source.stopped_before_failure(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
