//! Configuration resolution for the deployment engine.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value, where one exists (lowest priority)
//!
//! The two timeouts have no built-in default: they must come from the caller
//! or the environment.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DEPLOY_CONNECTION_TIMEOUT_MS` | required | Connect and initial prompt timeout in milliseconds |
//! | `DEPLOY_EXECUTION_TIMEOUT_MS` | required | Timeout of every shell wait in milliseconds |
//! | `DEPLOY_IDENTITY` | `$HOME/.ssh/id_rsa` | Private key used for authentication |
//! | `DEPLOY_KNOWN_HOSTS` | `$HOME/.ssh/known_hosts` | Known hosts file used to check server keys |
//! | `DEPLOY_SESSIONS_DIR` | `sessions` | Root directory of per-host session output files |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::error::{EngineError, Result};

/// Environment variable name for the connection timeout
pub(crate) const CONNECTION_TIMEOUT_ENV_VAR: &str = "DEPLOY_CONNECTION_TIMEOUT_MS";

/// Environment variable name for the execution timeout
pub(crate) const EXECUTION_TIMEOUT_ENV_VAR: &str = "DEPLOY_EXECUTION_TIMEOUT_MS";

/// Environment variable name for the identity file
pub(crate) const IDENTITY_ENV_VAR: &str = "DEPLOY_IDENTITY";

/// Environment variable name for the known hosts file
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "DEPLOY_KNOWN_HOSTS";

/// Environment variable name for the sessions directory
pub(crate) const SESSIONS_DIR_ENV_VAR: &str = "DEPLOY_SESSIONS_DIR";

/// Default root directory for session output files
pub(crate) const DEFAULT_SESSIONS_DIR: &str = "sessions";

/// Resolved engine settings shared read-only by every host pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounds connect, channel setup and the first prompt after login.
    pub connection_timeout: Duration,
    /// Bounds every other wait-for-pattern operation.
    pub execution_timeout: Duration,
    pub identity: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub sessions_dir: PathBuf,
}

impl EngineConfig {
    /// Create a configuration with explicit timeouts and default paths.
    pub fn new(connection_timeout: Duration, execution_timeout: Duration) -> Self {
        Self {
            connection_timeout,
            execution_timeout,
            identity: resolve_identity(None),
            known_hosts: resolve_known_hosts(None),
            sessions_dir: resolve_sessions_dir(None),
        }
    }

    /// Resolve every value from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            connection_timeout: resolve_connection_timeout(None)?,
            execution_timeout: resolve_execution_timeout(None)?,
            identity: resolve_identity(None),
            known_hosts: resolve_known_hosts(None),
            sessions_dir: resolve_sessions_dir(None),
        })
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_known_hosts(mut self, known_hosts: Option<PathBuf>) -> Self {
        self.known_hosts = known_hosts;
        self
    }

    pub fn with_sessions_dir(mut self, sessions_dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = sessions_dir.into();
        self
    }
}

/// Resolve a required millisecond value with priority: parameter -> env var.
fn resolve_required_millis(param: Option<u64>, env_var: &str) -> Result<Duration> {
    // Priority 1: Use parameter if provided
    if let Some(millis) = param {
        return Ok(Duration::from_millis(millis));
    }

    // Priority 2: Use environment variable if set and valid
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| {
                EngineError::Config(format!("{} must be an integer (ms): {}", env_var, e))
            }),
        Err(_) => Err(EngineError::Config(format!("{} is not set", env_var))),
    }
}

/// Resolve the connection timeout with priority: parameter -> env var
pub(crate) fn resolve_connection_timeout(timeout_param: Option<u64>) -> Result<Duration> {
    resolve_required_millis(timeout_param, CONNECTION_TIMEOUT_ENV_VAR)
}

/// Resolve the execution timeout with priority: parameter -> env var
pub(crate) fn resolve_execution_timeout(timeout_param: Option<u64>) -> Result<Duration> {
    resolve_required_millis(timeout_param, EXECUTION_TIMEOUT_ENV_VAR)
}

/// Resolve a path with priority: parameter -> env var -> file under `$HOME/.ssh`
fn resolve_ssh_path(param: Option<PathBuf>, env_var: &str, file_name: &str) -> Option<PathBuf> {
    if param.is_some() {
        return param;
    }

    if let Ok(value) = env::var(env_var)
        && !value.trim().is_empty()
    {
        return Some(PathBuf::from(value));
    }

    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".ssh").join(file_name))
}

/// Resolve the identity file with priority: parameter -> env var -> `$HOME/.ssh/id_rsa`
pub(crate) fn resolve_identity(identity_param: Option<PathBuf>) -> Option<PathBuf> {
    resolve_ssh_path(identity_param, IDENTITY_ENV_VAR, "id_rsa")
}

/// Resolve the known hosts file with priority: parameter -> env var -> `$HOME/.ssh/known_hosts`
pub(crate) fn resolve_known_hosts(known_hosts_param: Option<PathBuf>) -> Option<PathBuf> {
    resolve_ssh_path(known_hosts_param, KNOWN_HOSTS_ENV_VAR, "known_hosts")
}

/// Resolve the sessions directory with priority: parameter -> env var -> default
pub(crate) fn resolve_sessions_dir(dir_param: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = dir_param {
        return dir;
    }

    if let Ok(value) = env::var(SESSIONS_DIR_ENV_VAR)
        && !value.trim().is_empty()
    {
        return PathBuf::from(value);
    }

    PathBuf::from(DEFAULT_SESSIONS_DIR)
}
