//! Per-host serialized task execution.
//!
//! A [`TaskQueue`] owns one worker task and the state that worker operates
//! on (for a host pipeline: the live shell). Tasks start strictly in
//! submission order and never overlap, which is what keeps a shell session
//! coherent: only the worker ever talks to it.
//!
//! # Lifecycle
//!
//! - [`TaskQueue::start`] spawns the worker.
//! - [`TaskQueue::submit`] enqueues without blocking and hands back a
//!   [`TaskHandle`] for the typed result.
//! - [`TaskQueue::shutdown`] refuses new submissions and keeps any queued
//!   task from starting. The task already running is left to finish.
//! - [`TaskQueue::join`] waits for the worker and returns the state.
//!
//! A task that fails or panics is reported to the failure handler and the
//! worker moves on to the next one.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::{EngineError, Result};

/// A unit of work run by a queue's worker against its state.
#[async_trait]
pub trait Task: Send + 'static {
    type State: Send + 'static;
    type Output: Send + 'static;

    /// Short description used in logs and failure reports.
    fn label(&self) -> String;

    async fn run(self, state: &mut Self::State) -> Result<Self::Output>;
}

/// Report handed to the failure handler.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub queue: String,
    pub task_id: Uuid,
    pub label: String,
    pub message: String,
}

pub type FailureHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

/// Failure handler that logs at error level.
pub fn log_failures() -> FailureHandler {
    Arc::new(|failure: &TaskFailure| {
        error!(
            queue = %failure.queue,
            task_id = %failure.task_id,
            "Task '{}' failed: {}",
            failure.label,
            failure.message
        );
    })
}

/// Result handle of a submitted task.
pub struct TaskHandle<T> {
    id: Uuid,
    label: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the task to finish.
    ///
    /// A task discarded by shutdown, or one that panicked, yields
    /// [`EngineError::TaskDropped`].
    pub async fn wait(self) -> Result<T> {
        let TaskHandle { label, rx, .. } = self;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::TaskDropped { task: label }),
        }
    }
}

#[async_trait]
trait Job<S: Send + 'static>: Send {
    fn id(&self) -> Uuid;
    fn label(&self) -> &str;
    /// Run the task and deliver its result; returns the error text on failure.
    async fn execute(self: Box<Self>, state: &mut S) -> Option<String>;
}

struct Pending<T: Task> {
    id: Uuid,
    label: String,
    task: T,
    reply: oneshot::Sender<Result<T::Output>>,
}

#[async_trait]
impl<T: Task> Job<T::State> for Pending<T> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(self: Box<Self>, state: &mut T::State) -> Option<String> {
        let Pending { task, reply, .. } = *self;
        let result = task.run(state).await;
        let failure = result.as_ref().err().map(ToString::to_string);
        // Nobody waiting on the handle is fine
        let _ = reply.send(result);
        failure
    }
}

type BoxedJob<S> = Box<dyn Job<S>>;

pub struct TaskQueue<S: Send + 'static> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<BoxedJob<S>>>>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<S>>>,
}

impl<S: Send + 'static> TaskQueue<S> {
    /// Spawn the worker; it owns `state` until [`TaskQueue::join`].
    pub fn start(name: impl Into<String>, state: S, on_failure: FailureHandler) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(drain(
            name.clone(),
            state,
            receiver,
            cancel.clone(),
            on_failure,
        ));
        debug!(queue = %name, "Task queue started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            cancel,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enqueue `task` behind everything submitted before it.
    pub fn submit<T>(&self, task: T) -> Result<TaskHandle<T::Output>>
    where
        T: Task<State = S>,
    {
        let closed = || EngineError::QueueClosed {
            queue: self.name.clone(),
        };

        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = guard.as_ref().ok_or_else(closed)?;

        let id = Uuid::new_v4();
        let label = task.label();
        let (reply, rx) = oneshot::channel();
        sender
            .send(Box::new(Pending {
                id,
                label: label.clone(),
                task,
                reply,
            }))
            .map_err(|_| closed())?;

        debug!(queue = %self.name, task_id = %id, "Queued task '{}'", label);
        Ok(TaskHandle { id, label, rx })
    }

    /// Stop accepting work and keep queued tasks from starting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_some() {
            debug!(queue = %self.name, "Task queue shut down");
        }
    }

    /// Wait for the worker to exit and take back its state.
    ///
    /// Returns `None` if the worker was already joined.
    pub async fn join(&self) -> Option<S> {
        let worker = self.worker.lock().await.take()?;
        match worker.await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(queue = %self.name, "Task queue worker ended abnormally: {}", e);
                None
            }
        }
    }
}

async fn drain<S: Send + 'static>(
    name: String,
    mut state: S,
    mut receiver: mpsc::UnboundedReceiver<BoxedJob<S>>,
    cancel: CancellationToken,
    on_failure: FailureHandler,
) -> S {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let task_id = job.id();
        let label = job.label().to_string();
        debug!(queue = %name, task_id = %task_id, "Starting task '{}'", label);

        let outcome = AssertUnwindSafe(job.execute(&mut state))
            .catch_unwind()
            .await;

        let message = match outcome {
            Ok(None) => {
                debug!(queue = %name, task_id = %task_id, "Finished task '{}'", label);
                continue;
            }
            Ok(Some(message)) => message,
            Err(panic) => format!("task panicked: {}", panic_message(panic.as_ref())),
        };

        on_failure(&TaskFailure {
            queue: name.clone(),
            task_id,
            label,
            message,
        });
    }

    let dropped = {
        receiver.close();
        let mut count = 0;
        while receiver.try_recv().is_ok() {
            count += 1;
        }
        count
    };
    if dropped > 0 {
        debug!(queue = %name, "Discarded {} queued task(s) on shutdown", dropped);
    }

    state
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
