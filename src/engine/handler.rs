//! Per-host deployment pipeline.
//!
//! A [`HostHandler`] owns everything that belongs to one host: the session
//! artifact file, the output capture, the connection, the bootstrapped shell,
//! the task queue and the registry of started executions.
//!
//! ```text
//! new ──▶ setup (connect + bootstrap) ──▶ start (queue) ──▶ execute_command …
//!                                                          stop_executions
//!                                                          shutdown_task_queue ──▶ close
//! ```
//!
//! Every failure of `setup` is reported to the notifier before it is
//! returned. Once a host-fatal error has been seen, during setup or by any
//! command, the handler refuses further commands. Nothing here touches any
//! other host.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::command::{Command, CommandDescriptor, CommandTask, ExecutionContext};
use super::config::EngineConfig;
use super::connection::{Connector, HostLink};
use super::error::{EngineError, Result};
use super::host::Host;
use super::notify::Notifier;
use super::output::{OutputMultiplexer, TracingSink, create_session_file};
use super::queue::{TaskHandle, TaskQueue, log_failures};
use super::registry::{CommandTokenStrategy, ExecutionRegistry, StopExecutions, StopStrategy};
use super::shell::InteractiveShell;

pub struct HostHandler {
    host: Arc<Host>,
    subsystem: String,
    config: EngineConfig,
    output: Arc<OutputMultiplexer>,
    output_file: PathBuf,
    notifier: Arc<dyn Notifier>,
    strategy: Arc<dyn StopStrategy>,
    executions: Arc<ExecutionRegistry>,
    fault: Arc<OnceLock<String>>,
    link: Mutex<Option<Box<dyn HostLink>>>,
    // Held between bootstrap and start; the queue's worker owns it afterwards
    shell: Mutex<Option<InteractiveShell>>,
    queue: OnceLock<TaskQueue<ExecutionContext>>,
}

impl HostHandler {
    /// Create the handler and its session file.
    ///
    /// The file lives at `<sessions_dir>/<subsystem>/<host>-<timestamp>.txt`
    /// and receives every chunk the host prints. Failing to create it is
    /// fatal for the host.
    pub fn new(
        host: Arc<Host>,
        subsystem: impl Into<String>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let subsystem = subsystem.into();

        let file_sink = match create_session_file(&config.sessions_dir, &subsystem, &host) {
            Ok(sink) => sink,
            Err(e) => {
                notifier.error(&host, &e.to_string());
                return Err(e);
            }
        };
        let output_file = file_sink.path().to_path_buf();

        let output = Arc::new(OutputMultiplexer::new());
        output.echo_to(Arc::new(file_sink));
        output.echo_to(Arc::new(TracingSink::new(&host)));

        Ok(Self {
            host,
            subsystem,
            config,
            output,
            output_file,
            notifier,
            strategy: Arc::new(CommandTokenStrategy::new()),
            executions: Arc::new(ExecutionRegistry::new()),
            fault: Arc::new(OnceLock::new()),
            link: Mutex::new(None),
            shell: Mutex::new(None),
            queue: OnceLock::new(),
        })
    }

    /// Replace how executions are mapped to remote processes.
    pub fn with_stop_strategy(mut self, strategy: Arc<dyn StopStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    pub fn output(&self) -> &Arc<OutputMultiplexer> {
        &self.output
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// The host-fatal error that took this host out of service, if any.
    pub fn fault(&self) -> Option<&str> {
        self.fault.get().map(String::as_str)
    }

    /// Connect and bootstrap the shell.
    pub async fn setup(&self, connector: &dyn Connector) -> Result<()> {
        let result = self.connect_and_bootstrap(connector).await;
        if let Err(e) = &result {
            self.notifier.error(&self.host, &e.to_string());
            if e.is_fatal_for_host() {
                let _ = self.fault.set(e.to_string());
            }
        }
        result
    }

    async fn connect_and_bootstrap(&self, connector: &dyn Connector) -> Result<()> {
        let (link, transport) = connector.open(&self.host, &self.config).await?;
        *self.link.lock().await = Some(link);

        let mut shell = InteractiveShell::new(
            self.host.to_string(),
            transport,
            self.output.clone(),
            self.config.connection_timeout,
            self.config.execution_timeout,
        );
        let family = shell.bootstrap().await?;
        *self.shell.lock().await = Some(shell);

        self.notifier.info(
            &self.host,
            &format!("Connected ({} shell configured)", family.name()),
        );
        Ok(())
    }

    /// Start the task queue on the bootstrapped shell.
    pub async fn start(&self) -> Result<()> {
        if self.queue.get().is_some() {
            return Err(self.not_ready("task queue already started"));
        }
        let shell = self
            .shell
            .lock()
            .await
            .take()
            .ok_or_else(|| self.not_ready("shell has not been bootstrapped"))?;

        let context = ExecutionContext {
            host: self.host.clone(),
            shell,
            notifier: self.notifier.clone(),
            executions: self.executions.clone(),
            fault: self.fault.clone(),
        };
        let queue = TaskQueue::start(self.host.to_string(), context, log_failures());
        self.queue
            .set(queue)
            .map_err(|_| self.not_ready("task queue already started"))?;

        debug!(host = %self.host, "Pipeline started");
        Ok(())
    }

    fn queue(&self) -> Result<&TaskQueue<ExecutionContext>> {
        self.queue
            .get()
            .ok_or_else(|| self.not_ready("task queue has not been started"))
    }

    fn not_ready(&self, reason: &str) -> EngineError {
        EngineError::NotReady {
            host: self.host.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Queue `command` behind everything submitted before it.
    ///
    /// A command flagged as an execution is tracked once it has been
    /// accepted by the queue.
    pub fn execute_command<C: Command>(&self, command: C) -> Result<TaskHandle<C::Output>> {
        if let Some(fault) = self.fault() {
            return Err(self.not_ready(&format!("host failed: {}", fault)));
        }
        let descriptor = command.descriptor().clone();
        let handle = self.queue()?.submit(CommandTask(command))?;

        if descriptor.is_execution() {
            debug!(host = %self.host, "Tracking execution '{}'", descriptor.command());
            self.executions.push(descriptor);
        }
        Ok(handle)
    }

    /// Stop every tracked execution, newest first.
    pub async fn stop_executions(&self) -> Result<usize> {
        let task = StopExecutions::all(self.strategy.clone());
        self.execute_command(task)?.wait().await
    }

    /// Stop only `descriptors`, newest first.
    pub async fn stop_executions_of(&self, descriptors: Vec<CommandDescriptor>) -> Result<usize> {
        let task = StopExecutions::of(descriptors, self.strategy.clone());
        self.execute_command(task)?.wait().await
    }

    /// Executions started and not yet stopped, in start order.
    pub fn executions(&self) -> Vec<CommandDescriptor> {
        self.executions.snapshot()
    }

    /// Refuse new commands, let the running one finish, discard the rest.
    pub async fn shutdown_task_queue(&self) {
        if let Some(queue) = self.queue.get() {
            queue.shutdown();
            if queue.join().await.is_some() {
                debug!(host = %self.host, "Task queue drained");
            }
        }
    }

    /// Close the channel and the session.
    pub async fn close(&self) -> Result<bool> {
        let mut link = self.link.lock().await;
        let closed = match link.as_mut() {
            Some(link) => link.close().await?,
            None => true,
        };
        info!(host = %self.host, "Session closed");
        Ok(closed)
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| link.is_connected())
    }
}
