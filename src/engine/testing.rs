//! In-memory stand-ins for remote hosts, used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::command::ExecutionContext;
use super::config::EngineConfig;
use super::connection::{Connector, HostLink};
use super::error::{EngineError, Result};
use super::host::{AssetBundle, Host, Uploader};
use super::notify::{NotificationLevel, Notifier};
use super::output::{OutputMultiplexer, OutputSink};
use super::prompt::{ECHO_OFF, ENGINE_PROMPT_TEXT, SHELL_QUERY};
use super::registry::ExecutionRegistry;
use super::shell::InteractiveShell;
use super::transport::ShellTransport;

pub const GREETING: &str = "Last login: Mon Mar  4 09:12:44 2024\r\ndeploy@web-1:~$ ";

struct RemoteState {
    shell: String,
    greeting: bool,
    sent: Vec<String>,
    running: Vec<String>,
    unkillable: Vec<String>,
    silent_on: Vec<String>,
    late_on: Vec<String>,
    // Replies withheld until the next line arrives
    held: Vec<String>,
    hang_up_on: Option<String>,
    reply_delay: Duration,
}

/// Scripted behaviour of a remote login shell.
///
/// Answers the bootstrap steps like a real bash or zsh would, keeps a fake
/// process table for stop probes, and echoes every other command as
/// `ok: <command>` followed by the engine prompt.
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

struct Reply {
    chunks: Vec<String>,
    hang_up: bool,
}

impl FakeRemote {
    pub fn bash() -> Self {
        Self::with_shell("bash")
    }

    pub fn with_shell(shell: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                shell: shell.to_string(),
                greeting: true,
                sent: Vec::new(),
                running: Vec::new(),
                unkillable: Vec::new(),
                silent_on: Vec::new(),
                late_on: Vec::new(),
                held: Vec::new(),
                hang_up_on: None,
                reply_delay: Duration::ZERO,
            })),
        }
    }

    fn update(self, f: impl FnOnce(&mut RemoteState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn without_greeting(self) -> Self {
        self.update(|s| s.greeting = false)
    }

    pub fn running(self, components: &[&str]) -> Self {
        self.update(|s| s.running = components.iter().map(|c| c.to_string()).collect())
    }

    /// Processes that survive `pkill`.
    pub fn unkillable(self, components: &[&str]) -> Self {
        self.update(|s| s.unkillable = components.iter().map(|c| c.to_string()).collect())
    }

    /// Answer commands starting with `prefix` only once the next line is sent.
    pub fn late_on(self, prefix: &str) -> Self {
        self.update(|s| s.late_on.push(prefix.to_string()))
    }

    /// Never answer commands starting with `prefix`.
    pub fn silent_on(self, prefix: &str) -> Self {
        self.update(|s| s.silent_on.push(prefix.to_string()))
    }

    /// Close the stream when `line` is received.
    pub fn hang_up_on(self, line: &str) -> Self {
        self.update(|s| s.hang_up_on = Some(line.to_string()))
    }

    /// Delay every chunk delivered to the engine.
    pub fn slow(self, delay: Duration) -> Self {
        self.update(|s| s.reply_delay = delay)
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn running_components(&self) -> Vec<String> {
        self.state.lock().unwrap().running.clone()
    }

    fn greeting(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .greeting
            .then(|| GREETING.to_string())
    }

    fn reply_delay(&self) -> Duration {
        self.state.lock().unwrap().reply_delay
    }

    fn respond(&self, line: &str) -> Reply {
        let mut state = self.state.lock().unwrap();
        state.sent.push(line.to_string());
        let mut chunks = std::mem::take(&mut state.held);

        if state.hang_up_on.as_deref() == Some(line) {
            return Reply {
                chunks,
                hang_up: true,
            };
        }
        if state.silent_on.iter().any(|p| line.starts_with(p.as_str())) {
            return Reply {
                chunks,
                hang_up: false,
            };
        }

        let chunk = if line == ECHO_OFF {
            // Echo is still on while this line is typed
            format!("{}\r\n$ ", ECHO_OFF)
        } else if line == SHELL_QUERY {
            format!("{}\r\n$ ", state.shell)
        } else if line.contains("-engine~> '") {
            ENGINE_PROMPT_TEXT.to_string()
        } else if line.starts_with("ps -eo args=") {
            let pattern = quoted_argument(line);
            if state.running.iter().any(|r| r == &pattern) {
                format!("{} --serve\r\n{}", pattern, ENGINE_PROMPT_TEXT)
            } else {
                ENGINE_PROMPT_TEXT.to_string()
            }
        } else if line.starts_with("pkill -f") {
            // pkill matches its argument as an extended regex
            let pattern = Regex::new(&quoted_argument(line)).unwrap();
            let RemoteState {
                running,
                unkillable,
                ..
            } = &mut *state;
            running.retain(|r| !pattern.is_match(r) || unkillable.contains(r));
            ENGINE_PROMPT_TEXT.to_string()
        } else if line.contains("-sync~ ") {
            let printed = line.trim_start_matches("echo ").replace('\'', "");
            format!("{}\r\n{}", printed, ENGINE_PROMPT_TEXT)
        } else {
            format!("ok: {}\r\n{}", line, ENGINE_PROMPT_TEXT)
        };

        if state.late_on.iter().any(|p| line.starts_with(p.as_str())) {
            state.held.push(chunk);
        } else {
            chunks.push(chunk);
        }
        Reply {
            chunks,
            hang_up: false,
        }
    }
}

fn quoted_argument(line: &str) -> String {
    line.split('\'').nth(1).unwrap_or_default().to_string()
}

/// Shell transport backed by a [`FakeRemote`].
pub struct ScriptedShell {
    remote: FakeRemote,
    pending: VecDeque<String>,
    closed: Arc<AtomicBool>,
}

impl ScriptedShell {
    pub fn new(remote: FakeRemote) -> Self {
        Self::with_closed_flag(remote, Arc::new(AtomicBool::new(false)))
    }

    fn with_closed_flag(remote: FakeRemote, closed: Arc<AtomicBool>) -> Self {
        let pending = remote.greeting().into_iter().collect();
        Self {
            remote,
            pending,
            closed,
        }
    }
}

#[async_trait]
impl ShellTransport for ScriptedShell {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Channel("channel is closed".to_string()));
        }
        let text = String::from_utf8_lossy(data).into_owned();
        for line in text.lines() {
            let reply = self.remote.respond(line);
            self.pending.extend(reply.chunks);
            if reply.hang_up {
                self.closed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.pending.pop_front() {
            let delay = self.remote.reply_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Some(chunk.into_bytes());
        }
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        std::future::pending::<()>().await;
        None
    }
}

/// A bootstrapped shell context against `remote` with short timeouts.
pub async fn ready_context(remote: FakeRemote, notifier: Arc<dyn Notifier>) -> ExecutionContext {
    let mut shell = InteractiveShell::new(
        "deploy@web-1:22",
        Box::new(ScriptedShell::new(remote)),
        Arc::new(OutputMultiplexer::new()),
        Duration::from_millis(300),
        Duration::from_millis(300),
    );
    shell.bootstrap().await.unwrap();
    ExecutionContext {
        host: Arc::new(Host::new("web-1", "deploy")),
        shell,
        notifier,
        executions: Arc::new(ExecutionRegistry::new()),
        fault: Arc::new(OnceLock::new()),
    }
}

pub fn test_config(sessions_dir: &std::path::Path) -> EngineConfig {
    EngineConfig::new(Duration::from_millis(300), Duration::from_millis(300))
        .with_sessions_dir(sessions_dir)
}

#[derive(Default)]
pub struct MemorySink {
    chunks: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }
}

impl OutputSink for MemorySink {
    fn write_chunk(&self, chunk: &str) -> io::Result<()> {
        self.chunks.lock().unwrap().push(chunk.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub host: String,
    pub level: NotificationLevel,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    records: Mutex<Vec<NotificationRecord>>,
}

impl RecordingNotifier {
    pub fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn messages_for(&self, host: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.host == host)
            .map(|r| r.message)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, host: &Host, level: NotificationLevel, message: &str) {
        self.records.lock().unwrap().push(NotificationRecord {
            host: host.to_string(),
            level,
            message: message.to_string(),
        });
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<String>>,
}

impl RecordingUploader {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, _host: &Host, bundle: &AssetBundle) -> std::result::Result<(), String> {
        self.uploads.lock().unwrap().push(bundle.summary());
        Ok(())
    }
}

/// Session stand-in sharing its open flag with the scripted transport.
pub struct FakeLink {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl HostLink for FakeLink {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<bool> {
        self.closed.store(true, Ordering::Release);
        Ok(true)
    }
}

/// Connector that hands out scripted shells by hostname.
#[derive(Default)]
pub struct FakeConnector {
    remotes: HashMap<String, FakeRemote>,
    refused: HashSet<String>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, hostname: &str, remote: FakeRemote) -> Self {
        self.remotes.insert(hostname.to_string(), remote);
        self
    }

    pub fn refusing(mut self, hostname: &str) -> Self {
        self.refused.insert(hostname.to_string());
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        host: &Arc<Host>,
        _config: &EngineConfig,
    ) -> Result<(Box<dyn HostLink>, Box<dyn ShellTransport>)> {
        let refused = || EngineError::Connection {
            host: host.to_string(),
            reason: "connection refused".to_string(),
        };
        if self.refused.contains(&host.hostname) {
            return Err(refused());
        }
        let remote = self.remotes.get(&host.hostname).ok_or_else(refused)?;

        let closed = Arc::new(AtomicBool::new(false));
        let link = FakeLink {
            closed: closed.clone(),
        };
        let transport = ScriptedShell::with_closed_flag(remote.clone(), closed);
        Ok((Box::new(link), Box::new(transport)))
    }
}
