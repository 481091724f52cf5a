//! Interactive shell automation.
//!
//! An [`InteractiveShell`] owns the byte stream of one pty channel and
//! drives it with two primitives: [`InteractiveShell::send_line`] and
//! [`InteractiveShell::expect`]. Every chunk read from the remote side is
//! appended to the host's [`OutputMultiplexer`] as it arrives, whether or
//! not a wait is interested in it.
//!
//! # Bootstrap
//!
//! A freshly opened shell is brought to a known state before any command is
//! sent:
//!
//! 1. wait for the login prompt (`$` or `#`), then turn terminal echo off;
//! 2. ask the shell for its own name and refuse anything but bash and zsh;
//! 3. install the engine prompt and clear continuation and right prompts.
//!
//! From then on the end of every command is recognized by the engine prompt.
//! Any failure moves the shell to [`ShellState::Failed`] and is fatal for
//! the host.
//!
//! # Resynchronization
//!
//! A wait that times out leaves the abandoned command's output and prompt
//! somewhere ahead in the stream. The next line sent on a ready shell is
//! preceded by an echoed one-off marker, and everything up to the prompt
//! after that marker is discarded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::output::OutputMultiplexer;
use super::prompt::{
    ECHO_OFF, ENGINE_PROMPT, INITIAL_PROMPT, SHELL_QUERY, SYNC_MARKER_TEXT, ShellFamily,
    shell_name, sync_command,
};
use super::transport::ShellTransport;

/// Bootstrap progress of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Connected,
    EchoSuppressed,
    ShellDetected,
    PromptInstalled,
    Ready,
    Failed,
}

impl fmt::Display for ShellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShellState::Connected => "connected",
            ShellState::EchoSuppressed => "echo suppressed",
            ShellState::ShellDetected => "shell detected",
            ShellState::PromptInstalled => "prompt installed",
            ShellState::Ready => "ready",
            ShellState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Result of a successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Everything received before the match since the previous match.
    pub before: String,
    /// The text that matched the pattern.
    pub matched: String,
}

pub struct InteractiveShell {
    label: String,
    transport: Box<dyn ShellTransport>,
    output: Arc<OutputMultiplexer>,
    buffer: String,
    // Trailing bytes of an incomplete UTF-8 sequence
    partial: Vec<u8>,
    connection_timeout: Duration,
    execution_timeout: Duration,
    state: ShellState,
    family: Option<ShellFamily>,
    // Cleared when a wait times out; stale output may still be in flight
    in_sync: bool,
}

impl InteractiveShell {
    /// Wrap an open transport. `label` identifies the host in errors.
    pub fn new(
        label: impl Into<String>,
        transport: Box<dyn ShellTransport>,
        output: Arc<OutputMultiplexer>,
        connection_timeout: Duration,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            transport,
            output,
            buffer: String::new(),
            partial: Vec::new(),
            connection_timeout,
            execution_timeout,
            state: ShellState::Connected,
            family: None,
            in_sync: true,
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    pub fn family(&self) -> Option<ShellFamily> {
        self.family
    }

    pub fn is_ready(&self) -> bool {
        self.state == ShellState::Ready
    }

    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// False after a timed-out wait until the next send resynchronizes.
    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    /// Pattern that marks the end of a command's output.
    pub fn prompt(&self) -> &'static Regex {
        match self.state {
            ShellState::PromptInstalled | ShellState::Ready => &*ENGINE_PROMPT,
            _ => &*INITIAL_PROMPT,
        }
    }

    /// Send `line` followed by a newline.
    ///
    /// A ready shell that lost track of its output is resynchronized first.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        if !self.in_sync && self.state == ShellState::Ready {
            self.resync().await?;
        }
        self.write_line(line).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!(host = %self.label, "> {}", line);
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.transport.send(&data).await
    }

    /// Wait for `pattern`, bounded by the execution timeout.
    pub async fn expect(&mut self, pattern: &Regex) -> Result<Match> {
        self.expect_within(pattern, self.execution_timeout).await
    }

    /// Wait for `pattern` for at most `timeout`.
    ///
    /// Text after the match stays buffered for the next wait.
    pub async fn expect_within(&mut self, pattern: &Regex, timeout: Duration) -> Result<Match> {
        self.wait_for(pattern.as_str(), timeout, |text| {
            pattern.find(text).map(|found| (found.start(), found.end()))
        })
        .await
    }

    /// Read until `find` locates a span in the buffer or `timeout` expires.
    async fn wait_for<F>(&mut self, description: &str, timeout: Duration, find: F) -> Result<Match>
    where
        F: Fn(&str) -> Option<(usize, usize)>,
    {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some((start, end)) = find(&self.buffer) {
                let before = self.buffer[..start].to_string();
                let matched = self.buffer[start..end].to_string();
                self.buffer.replace_range(..end, "");
                return Ok(Match { before, matched });
            }

            match tokio::time::timeout_at(deadline, self.transport.recv()).await {
                Ok(Some(bytes)) => self.receive(&bytes),
                Ok(None) => {
                    if self.state == ShellState::Ready {
                        self.advance(ShellState::Failed);
                    }
                    return Err(EngineError::ChannelClosed {
                        host: self.label.clone(),
                    });
                }
                Err(_) => {
                    self.in_sync = false;
                    return Err(EngineError::Timeout {
                        host: self.label.clone(),
                        pattern: description.to_string(),
                        after: timeout,
                    });
                }
            }
        }
    }

    /// Drop everything up to the prompt that follows a freshly echoed marker.
    async fn resync(&mut self) -> Result<()> {
        let token = Uuid::new_v4().simple().to_string();
        let marker = format!("{} {}", SYNC_MARKER_TEXT, token);
        debug!(host = %self.label, "Resynchronizing shell output");

        self.write_line(&sync_command(&token)).await?;
        let skipped = self
            .wait_for(&marker, self.execution_timeout, |text| {
                text.find(marker.as_str())
                    .map(|start| (start, start + marker.len()))
            })
            .await?;
        self.expect(&ENGINE_PROMPT).await?;

        debug!(
            host = %self.label,
            "Discarded {} byte(s) of stale output",
            skipped.before.len()
        );
        self.in_sync = true;
        Ok(())
    }

    /// Send a command and wait for the prompt that follows it.
    pub async fn run(&mut self, line: &str) -> Result<Match> {
        self.send_line(line).await?;
        let prompt = self.prompt();
        self.expect(prompt).await
    }

    /// Bring the session from `Connected` to `Ready`.
    pub async fn bootstrap(&mut self) -> Result<ShellFamily> {
        match self.negotiate().await {
            Ok(family) => {
                self.state = ShellState::Ready;
                info!(host = %self.label, shell = family.name(), "Shell ready");
                Ok(family)
            }
            Err(e) => {
                self.state = ShellState::Failed;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self) -> Result<ShellFamily> {
        // Login banners and MOTD count against the connection timeout
        self.expect_within(&INITIAL_PROMPT, self.connection_timeout)
            .await?;

        self.send_line(ECHO_OFF).await?;
        self.expect(&INITIAL_PROMPT).await?;
        self.advance(ShellState::EchoSuppressed);

        self.send_line(SHELL_QUERY).await?;
        let reply = self.expect(&INITIAL_PROMPT).await?;
        let family =
            ShellFamily::detect(&reply.before).ok_or_else(|| EngineError::UnsupportedShell {
                host: self.label.clone(),
                shell: shell_name(&reply.before).to_string(),
            })?;
        self.family = Some(family);
        self.advance(ShellState::ShellDetected);

        self.send_line(&family.prompt_command()).await?;
        self.expect(&ENGINE_PROMPT).await?;
        self.advance(ShellState::PromptInstalled);

        Ok(family)
    }

    fn advance(&mut self, state: ShellState) {
        debug!(host = %self.label, "Shell {} -> {}", self.state, state);
        self.state = state;
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);

        let text = match std::str::from_utf8(&self.partial) {
            Ok(text) => {
                let text = text.to_string();
                self.partial.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                // Sequence cut at the chunk boundary; keep the tail for later
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.partial[..valid]).into_owned();
                self.partial.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                text
            }
        };

        if text.is_empty() {
            return;
        }
        self.output.append(&text);
        self.buffer.push_str(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::prompt::ENGINE_PROMPT_TEXT;
    use crate::engine::testing::{FakeRemote, GREETING, ScriptedShell};

    const CONNECT: Duration = Duration::from_millis(500);
    const EXECUTE: Duration = Duration::from_millis(500);

    fn shell_for(remote: FakeRemote) -> (InteractiveShell, Arc<OutputMultiplexer>, FakeRemote) {
        let output = Arc::new(OutputMultiplexer::new());
        let transport = ScriptedShell::new(remote.clone());
        let shell = InteractiveShell::new(
            "deploy@web-1:22",
            Box::new(transport),
            output.clone(),
            CONNECT,
            EXECUTE,
        );
        (shell, output, remote)
    }

    mod bootstrap {
        use super::*;

        #[tokio::test]
        async fn test_bash_bootstrap_reaches_ready() {
            let (mut shell, output, remote) = shell_for(FakeRemote::bash());

            let family = shell.bootstrap().await.unwrap();

            assert_eq!(family, ShellFamily::Bash);
            assert!(shell.is_ready());
            assert_eq!(
                output.snapshot(),
                vec![
                    GREETING.to_string(),
                    format!("{}\r\n$ ", ECHO_OFF),
                    "bash\r\n$ ".to_string(),
                    ENGINE_PROMPT_TEXT.to_string(),
                ]
            );
            assert_eq!(
                remote.sent(),
                vec![
                    ECHO_OFF.to_string(),
                    SHELL_QUERY.to_string(),
                    ShellFamily::Bash.prompt_command(),
                ]
            );
        }

        #[tokio::test]
        async fn test_zsh_uses_zsh_prompt_command() {
            let (mut shell, _output, remote) = shell_for(FakeRemote::with_shell("zsh"));

            assert_eq!(shell.bootstrap().await.unwrap(), ShellFamily::Zsh);
            assert_eq!(remote.sent()[2], ShellFamily::Zsh.prompt_command());
        }

        #[tokio::test]
        async fn test_login_shell_marker_is_accepted() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::with_shell("-bash"));
            assert_eq!(shell.bootstrap().await.unwrap(), ShellFamily::Bash);
        }

        #[tokio::test]
        async fn test_unsupported_shell_fails() {
            let (mut shell, _output, remote) = shell_for(FakeRemote::with_shell("fish"));

            let err = shell.bootstrap().await.unwrap_err();

            match &err {
                EngineError::UnsupportedShell { shell, .. } => assert_eq!(shell, "fish"),
                other => panic!("unexpected error: {:?}", other),
            }
            assert!(err.is_fatal_for_host());
            assert_eq!(shell.state(), ShellState::Failed);
            // No prompt installation is attempted
            assert_eq!(remote.sent().len(), 2);
        }

        #[tokio::test]
        async fn test_silent_host_times_out() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::bash().without_greeting());

            let err = shell.bootstrap().await.unwrap_err();

            match err {
                EngineError::Timeout { after, .. } => assert_eq!(after, CONNECT),
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(shell.state(), ShellState::Failed);
        }

        #[tokio::test]
        async fn test_hang_up_during_bootstrap() {
            let (mut shell, _output, _remote) =
                shell_for(FakeRemote::bash().hang_up_on(SHELL_QUERY));

            let err = shell.bootstrap().await.unwrap_err();
            assert!(matches!(err, EngineError::ChannelClosed { .. }));
        }
    }

    mod expect {
        use super::*;

        #[tokio::test]
        async fn test_run_returns_text_before_prompt() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::bash());
            shell.bootstrap().await.unwrap();

            let reply = shell.run("echo hello").await.unwrap();
            assert_eq!(reply.before, "ok: echo hello\r\n");
            assert_eq!(reply.matched, ENGINE_PROMPT_TEXT);
        }

        #[tokio::test]
        async fn test_remainder_is_kept_for_next_wait() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::bash());
            shell.bootstrap().await.unwrap();
            shell.send_line("echo hello").await.unwrap();

            let marker = Regex::new("ok: ").unwrap();
            let first = shell.expect(&marker).await.unwrap();
            assert_eq!(first.before, "");

            let prompt = shell.prompt();
            let second = shell.expect(prompt).await.unwrap();
            assert_eq!(second.before, "echo hello\r\n");
        }

        #[tokio::test]
        async fn test_timeout_reports_pattern() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::bash());
            shell.bootstrap().await.unwrap();

            let never = Regex::new("never-printed").unwrap();
            let err = shell
                .expect_within(&never, Duration::from_millis(20))
                .await
                .unwrap_err();
            match err {
                EngineError::Timeout { pattern, .. } => assert_eq!(pattern, "never-printed"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_late_output_is_not_attributed_to_next_command() {
            let (mut shell, _output, remote) =
                shell_for(FakeRemote::bash().late_on("slow-build"));
            shell.bootstrap().await.unwrap();

            let err = shell.run("slow-build").await.unwrap_err();
            assert!(matches!(err, EngineError::Timeout { .. }));
            assert!(!shell.is_in_sync());

            let reply = shell.run("uptime").await.unwrap();
            assert_eq!(reply.before, "ok: uptime\r\n");
            assert!(shell.is_in_sync());

            let sent = remote.sent();
            assert_eq!(sent.len(), 6);
            assert!(sent[4].contains("-sync~ "));
            assert_eq!(sent[5], "uptime");
        }

        #[tokio::test]
        async fn test_in_sync_shell_sends_no_marker() {
            let (mut shell, _output, remote) = shell_for(FakeRemote::bash());
            shell.bootstrap().await.unwrap();

            shell.run("uptime").await.unwrap();
            shell.run("whoami").await.unwrap();

            assert!(!remote.sent().iter().any(|line| line.contains("-sync~")));
        }

        #[tokio::test]
        async fn test_hang_up_after_ready_fails_shell() {
            let (mut shell, _output, _remote) = shell_for(FakeRemote::bash().hang_up_on("reboot"));
            shell.bootstrap().await.unwrap();

            let err = shell.run("reboot").await.unwrap_err();
            assert!(matches!(err, EngineError::ChannelClosed { .. }));
            assert_eq!(shell.state(), ShellState::Failed);
        }

        #[test]
        fn test_split_utf8_sequence_is_reassembled() {
            let (mut shell, output, _remote) = shell_for(FakeRemote::bash());
            let bytes = "caf\u{e9}\n".as_bytes();
            shell.receive(&bytes[..4]);
            shell.receive(&bytes[4..]);
            assert_eq!(output.snapshot().concat(), "caf\u{e9}\n");
        }

        #[test]
        fn test_prompt_before_bootstrap_is_initial() {
            let (shell, _output, _remote) = shell_for(FakeRemote::bash());
            assert_eq!(shell.prompt().as_str(), INITIAL_PROMPT.as_str());
        }
    }
}
