//! Commands run against a host's shell.
//!
//! A command pairs a [`CommandDescriptor`] (what to run, whether it starts
//! a long-lived component, what to tell people about it) with the behaviour
//! that performs it. Commands are submitted to a host's task queue wrapped
//! in a [`CommandTask`], which emits the descriptor's messages around the
//! actual work.
//!
//! The command set is closed: [`ShellCommand`], [`Transfer`] and
//! [`StopExecutions`](super::registry::StopExecutions).

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, error};
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::host::{AssetBundle, Host};
use super::notify::Notifier;
use super::queue::Task;
use super::registry::ExecutionRegistry;
use super::shell::InteractiveShell;

/// Metadata of a single command.
///
/// Message templates may use `{host}` and `{command}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    id: Uuid,
    command: String,
    execution: bool,
    component: Option<String>,
    done_message: Option<String>,
    fail_message: Option<String>,
}

impl CommandDescriptor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            execution: false,
            component: None,
            done_message: None,
            fail_message: None,
        }
    }

    /// Mark the command as starting a component that must be stopped later.
    pub fn as_execution(mut self) -> Self {
        self.execution = true;
        self
    }

    /// Name the started component explicitly instead of deriving it.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_done_message(mut self, message: impl Into<String>) -> Self {
        self.done_message = Some(message.into());
        self
    }

    pub fn with_fail_message(mut self, message: impl Into<String>) -> Self {
        self.fail_message = Some(message.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_execution(&self) -> bool {
        self.execution
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn done_text(&self, host: &Host) -> Option<String> {
        self.done_message.as_deref().map(|t| self.render(t, host))
    }

    pub fn fail_text(&self, host: &Host) -> Option<String> {
        self.fail_message.as_deref().map(|t| self.render(t, host))
    }

    fn render(&self, template: &str, host: &Host) -> String {
        template
            .replace("{host}", &host.to_string())
            .replace("{command}", &self.command)
    }
}

/// Everything a command may touch while it runs on a host's worker.
pub struct ExecutionContext {
    pub host: Arc<Host>,
    pub shell: InteractiveShell,
    pub notifier: Arc<dyn Notifier>,
    pub executions: Arc<ExecutionRegistry>,
    /// First host-fatal error seen by any command, shared with the handler.
    pub fault: Arc<OnceLock<String>>,
}

#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Send + 'static;

    fn descriptor(&self) -> &CommandDescriptor;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Self::Output>;
}

/// Queue adapter that reports a command's outcome to the notifier.
pub struct CommandTask<C>(pub C);

#[async_trait]
impl<C: Command> Task for CommandTask<C> {
    type State = ExecutionContext;
    type Output = C::Output;

    fn label(&self) -> String {
        self.0.descriptor().command().to_string()
    }

    async fn run(self, ctx: &mut ExecutionContext) -> Result<C::Output> {
        let command = self.0;
        let descriptor = command.descriptor();

        match command.execute(ctx).await {
            Ok(output) => {
                if let Some(message) = descriptor.done_text(&ctx.host) {
                    ctx.notifier.success(&ctx.host, &message);
                }
                Ok(output)
            }
            Err(e) => {
                let message = descriptor.fail_text(&ctx.host).unwrap_or_else(|| {
                    format!("Command '{}' failed: {}", descriptor.command(), e)
                });
                ctx.notifier.error(&ctx.host, &message);
                if e.is_fatal_for_host() && ctx.fault.set(e.to_string()).is_ok() {
                    error!(host = %ctx.host, "Host can no longer be automated: {}", e);
                }
                Err(EngineError::CommandExecution {
                    host: ctx.host.to_string(),
                    command: descriptor.command().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// A command line typed into the host's shell.
///
/// The output is whatever the shell printed before the prompt came back.
pub struct ShellCommand {
    descriptor: CommandDescriptor,
    expecting: Option<Regex>,
}

impl ShellCommand {
    pub fn new(descriptor: CommandDescriptor) -> Self {
        Self {
            descriptor,
            expecting: None,
        }
    }

    /// Require `pattern` to appear in the output before the prompt.
    pub fn expecting(mut self, pattern: Regex) -> Self {
        self.expecting = Some(pattern);
        self
    }
}

#[async_trait]
impl Command for ShellCommand {
    type Output = String;

    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<String> {
        if !ctx.shell.is_ready() {
            return Err(EngineError::NotReady {
                host: ctx.host.to_string(),
                reason: format!("shell is {}", ctx.shell.state()),
            });
        }

        let shell = &mut ctx.shell;
        shell.send_line(self.descriptor.command()).await?;

        let mut output = String::new();
        if let Some(pattern) = &self.expecting {
            let found = shell.expect(pattern).await?;
            output.push_str(&found.before);
            output.push_str(&found.matched);
        }

        let prompt = shell.prompt();
        let reply = shell.expect(prompt).await?;
        output.push_str(&reply.before);

        debug!(host = %ctx.host, "'{}' returned {} bytes", self.descriptor.command(), output.len());
        Ok(output)
    }
}

/// Pushes an asset bundle through the host's upload capability.
pub struct Transfer {
    descriptor: CommandDescriptor,
    bundle: AssetBundle,
}

impl Transfer {
    pub fn new(bundle: AssetBundle) -> Self {
        let mut descriptor = CommandDescriptor::new(bundle.summary());
        if let Some(message) = &bundle.done_message {
            descriptor = descriptor.with_done_message(message.clone());
        }
        if let Some(message) = &bundle.fail_message {
            descriptor = descriptor.with_fail_message(message.clone());
        }
        Self { descriptor, bundle }
    }
}

#[async_trait]
impl Command for Transfer {
    type Output = ();

    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.host.upload(&self.bundle).await
    }
}
