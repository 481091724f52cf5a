//! Deployment plan file and per-host results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::command::CommandDescriptor;
use super::error::EngineError;
use super::host::Host;

/// A deployment described as JSON.
///
/// ```json
/// {
///   "subsystem": "backend",
///   "hosts": [{ "hostname": "web-1", "username": "deploy" }],
///   "commands": [
///     { "host": "web-1", "command": "svcA --serve &", "execution": true }
///   ],
///   "stop_on_exit": true
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct DeploymentPlan {
    pub subsystem: String,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub commands: Vec<PlannedCommand>,
    /// Stop every started execution before disconnecting.
    #[serde(default)]
    pub stop_on_exit: bool,
    /// Launcher prefix pattern (regex) stripped from commands when deriving
    /// component names, e.g. `frascati run (-r [0-9]+ )?`.
    #[serde(default)]
    pub launcher: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedCommand {
    /// Hostname, or `user@host:port` when a hostname is used more than once.
    pub host: String,
    pub command: String,
    #[serde(default)]
    pub execution: bool,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub done_message: Option<String>,
    #[serde(default)]
    pub fail_message: Option<String>,
    /// Pattern the output must contain before the prompt returns.
    #[serde(default)]
    pub expect: Option<String>,
}

impl PlannedCommand {
    pub fn descriptor(&self) -> CommandDescriptor {
        let mut descriptor = CommandDescriptor::new(&self.command);
        if self.execution {
            descriptor = descriptor.as_execution();
        }
        if let Some(component) = &self.component {
            descriptor = descriptor.with_component(component);
        }
        if let Some(message) = &self.done_message {
            descriptor = descriptor.with_done_message(message);
        }
        if let Some(message) = &self.fail_message {
            descriptor = descriptor.with_fail_message(message);
        }
        descriptor
    }
}

/// Outcome of bringing one host up.
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReport {
    pub fn ready(host: impl Into<String>, output_file: PathBuf) -> Self {
        Self {
            host: host.into(),
            ready: true,
            output_file: Some(output_file),
            error: None,
        }
    }

    pub fn failed(host: impl Into<String>, error: &EngineError) -> Self {
        Self {
            host: host.into(),
            ready: false,
            output_file: None,
            error: Some(error.to_string()),
        }
    }
}
