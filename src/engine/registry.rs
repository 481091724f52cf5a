//! Tracking and stopping long-running components.
//!
//! Commands flagged as executions start components that keep running after
//! the command returns. The [`ExecutionRegistry`] remembers them in start
//! order; [`StopExecutions`] walks them newest first, probes whether each one
//! is still alive, kills the ones it finds and probes again to confirm.
//! Only components confirmed gone are untracked and announced.
//!
//! How a descriptor maps to a process is decided by a [`StopStrategy`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{Command, CommandDescriptor, ExecutionContext};
use super::error::{EngineError, Result};
use super::notify::StoppedComponentsMessage;
use super::prompt::{extended_regex_escape, shell_quote};

/// Probes run after a kill before a component is reported as surviving.
const KILL_CHECKS: u32 = 3;
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Insertion-ordered set of started executions.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: Mutex<Vec<CommandDescriptor>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<CommandDescriptor>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, descriptor: CommandDescriptor) {
        self.entries().push(descriptor);
    }

    /// Remove the descriptor with `id`; returns whether it was tracked.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries();
        match entries.iter().position(|d| d.id() == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<CommandDescriptor> {
        self.entries().clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A running process identified from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Name reported to people.
    pub name: String,
    /// Text searched for in the host's process list.
    pub pattern: String,
}

/// Maps descriptors to processes and builds the probe and kill commands.
pub trait StopStrategy: Send + Sync {
    /// The component started by `descriptor`, if one can be identified.
    fn component(&self, descriptor: &CommandDescriptor) -> Option<Component>;

    fn probe_command(&self, component: &Component) -> String {
        format!(
            "ps -eo args= | grep -F -- {} | grep -v grep",
            shell_quote(&component.pattern)
        )
    }

    fn is_running(&self, component: &Component, probe_output: &str) -> bool {
        probe_output
            .lines()
            .any(|line| line.contains(&component.pattern))
    }

    /// `pkill` reads its pattern as an extended regex, so it is escaped to
    /// match the same literal text the probe searched for.
    fn kill_command(&self, component: &Component) -> String {
        format!(
            "pkill -f -- {}",
            shell_quote(&extended_regex_escape(&component.pattern))
        )
    }
}

/// Derives the component from the first token of the command.
///
/// An explicit component name on the descriptor wins. Otherwise an optional
/// launcher prefix (for example `frascati run -r 3 `) is removed first.
#[derive(Debug, Default, Clone)]
pub struct CommandTokenStrategy {
    launcher: Option<Regex>,
}

impl CommandTokenStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip text matching `launcher` from the start of commands.
    pub fn with_launcher(mut self, launcher: Regex) -> Self {
        self.launcher = Some(launcher);
        self
    }
}

impl StopStrategy for CommandTokenStrategy {
    fn component(&self, descriptor: &CommandDescriptor) -> Option<Component> {
        let text = match descriptor.component() {
            Some(name) => name.to_string(),
            None => {
                let command = descriptor.command().trim_start();
                match &self.launcher {
                    Some(launcher) => match launcher.find(command) {
                        Some(found) if found.start() == 0 => command[found.end()..].to_string(),
                        _ => command.to_string(),
                    },
                    None => command.to_string(),
                }
            }
        };

        let name = text.split_whitespace().next()?.to_string();
        Some(Component {
            pattern: name.clone(),
            name,
        })
    }
}

/// Stops tracked executions newest first.
///
/// Produces the number of components actually stopped. A failed probe or
/// kill does not end the walk unless it is fatal for the host; the
/// components stopped so far are still untracked and announced, and the
/// first failure is returned as [`EngineError::StopIncomplete`].
pub struct StopExecutions {
    descriptor: CommandDescriptor,
    targets: Option<Vec<CommandDescriptor>>,
    strategy: Arc<dyn StopStrategy>,
}

impl StopExecutions {
    /// Stop every execution tracked when the task starts.
    pub fn all(strategy: Arc<dyn StopStrategy>) -> Self {
        Self {
            descriptor: CommandDescriptor::new("stop executions"),
            targets: None,
            strategy,
        }
    }

    /// Stop only `targets`, in reverse of the given order.
    pub fn of(targets: Vec<CommandDescriptor>, strategy: Arc<dyn StopStrategy>) -> Self {
        Self {
            descriptor: CommandDescriptor::new("stop executions"),
            targets: Some(targets),
            strategy,
        }
    }
}

#[async_trait]
impl Command for StopExecutions {
    type Output = usize;

    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        let targets = match &self.targets {
            Some(targets) => targets.clone(),
            None => ctx.executions.snapshot(),
        };

        let mut stopped = Vec::new();
        let mut failure = None;
        for descriptor in targets.iter().rev() {
            let Some(component) = self.strategy.component(descriptor) else {
                warn!(host = %ctx.host, "No component derivable from '{}'", descriptor.command());
                continue;
            };

            match self.stop_component(ctx, &component).await {
                Ok(true) => {
                    ctx.executions.remove(descriptor.id());
                    info!(host = %ctx.host, "Stopped component '{}'", component.name);
                    stopped.push(component.name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %ctx.host, "Stopping '{}' failed: {}", component.name, e);
                    let fatal = e.is_fatal_for_host();
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    if fatal {
                        break;
                    }
                }
            }
        }

        if let Some(message) = StoppedComponentsMessage::new()
            .with_components(stopped.iter().cloned())
            .build()
        {
            ctx.notifier.success(&ctx.host, &message);
        }

        match failure {
            None => Ok(stopped.len()),
            Some(source) => Err(EngineError::StopIncomplete {
                host: ctx.host.to_string(),
                stopped: stopped.len(),
                source: Box::new(source),
            }),
        }
    }
}

impl StopExecutions {
    /// Kill `component` if it runs. `Ok(true)` once it is confirmed gone.
    async fn stop_component(
        &self,
        ctx: &mut ExecutionContext,
        component: &Component,
    ) -> Result<bool> {
        let probe_command = self.strategy.probe_command(component);

        let probe = ctx.shell.run(&probe_command).await?;
        if !self.strategy.is_running(component, &probe.before) {
            debug!(host = %ctx.host, "Component '{}' is not running", component.name);
            return Ok(false);
        }

        ctx.shell
            .run(&self.strategy.kill_command(component))
            .await?;

        for check in 0..KILL_CHECKS {
            if check > 0 {
                tokio::time::sleep(KILL_GRACE).await;
            }
            let probe = ctx.shell.run(&probe_command).await?;
            if !self.strategy.is_running(component, &probe.before) {
                return Ok(true);
            }
        }

        warn!(host = %ctx.host, "Component '{}' is still running after kill", component.name);
        Ok(false)
    }
}
