//! Sequential task pipeline.
//!
//! A [`TaskRunner`] owns an ordered queue of [`Step`] values and runs them one
//! at a time against a shared model. Each step reports exactly one terminal
//! outcome through its [`TaskOutcome`]; terminating twice is a programming
//! error and surfaces as [`TaskError::AlreadyTerminated`].
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::TaskError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Termination {
    Pending,
    Completed,
    Failed(String),
}

impl Termination {
    fn label(&self) -> &'static str {
        match self {
            Termination::Pending => "pending",
            Termination::Completed => "completed",
            Termination::Failed(_) => "failed",
        }
    }
}

/// Terminal outcome slot handed to a running step.
#[derive(Debug)]
pub struct TaskOutcome {
    task: &'static str,
    state: Termination,
    violation: Option<TaskError>,
}

impl TaskOutcome {
    pub fn new(task: &'static str) -> Self {
        Self {
            task,
            state: Termination::Pending,
            violation: None,
        }
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    pub fn complete(&mut self) -> Result<(), TaskError> {
        self.terminate(Termination::Completed)
    }

    pub fn failed(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.terminate(Termination::Failed(reason.into()))
    }

    /// Complete on `Ok`, fail with the error's display text on `Err`.
    pub fn settle<E: fmt::Display>(&mut self, result: Result<(), E>) -> Result<(), TaskError> {
        match result {
            Ok(()) => self.complete(),
            Err(e) => self.failed(e.to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == Termination::Completed
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            Termination::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state != Termination::Pending
    }

    fn terminate(&mut self, next: Termination) -> Result<(), TaskError> {
        if self.state == Termination::Pending {
            self.state = next;
            return Ok(());
        }
        let err = TaskError::AlreadyTerminated {
            task: self.task,
            previous: self.state.label(),
            attempted: next.label(),
        };
        error!(task = self.task, %err, "task outcome reported twice");
        self.violation.get_or_insert_with(|| err.clone());
        Err(err)
    }
}

/// One step of a protocol. Implemented by closed enums, one per protocol.
#[async_trait]
pub trait Step<M: Send>: Copy + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Perform the step's side effects and report through `outcome`.
    /// May suspend for as long as it needs, e.g. waiting for message arrival.
    async fn run(self, model: &mut M, outcome: &mut TaskOutcome);
}

/// Model a runner operates on.
pub trait TaskModel: Send {
    /// Called after every task, before the next one starts.
    fn request_persistence(&mut self);
}

/// Diagnostics hook around each task. Must not influence the outcome.
pub trait TaskInterceptor: Send + Sync {
    fn before(&self, runner: &str, task: &'static str);
    fn after(&self, runner: &str, task: &'static str, outcome: &TaskOutcome);
}

/// Default interceptor, logs task boundaries at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterceptor;

impl TaskInterceptor for TracingInterceptor {
    fn before(&self, runner: &str, task: &'static str) {
        debug!(runner, task, "task started");
    }

    fn after(&self, runner: &str, task: &'static str, outcome: &TaskOutcome) {
        match outcome.failure_reason() {
            Some(reason) => debug!(runner, task, reason, "task finished with failure"),
            None => debug!(runner, task, completed = outcome.is_completed(), "task finished"),
        }
    }
}

/// Shared cancellation switch for a runner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(TaskFailure),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Idle,
    Running,
    Finished,
}

pub struct TaskRunner<S> {
    label: String,
    tasks: Vec<S>,
    cursor: usize,
    status: RunnerStatus,
    cancel: CancelFlag,
    interceptor: Arc<dyn TaskInterceptor>,
}

impl<S: fmt::Debug> fmt::Debug for TaskRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("label", &self.label)
            .field("tasks", &self.tasks)
            .field("cursor", &self.cursor)
            .field("status", &self.status)
            .finish()
    }
}

impl<S> TaskRunner<S> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tasks: Vec::new(),
            cursor: 0,
            status: RunnerStatus::Idle,
            cancel: CancelFlag::new(),
            interceptor: Arc::new(TracingInterceptor),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn TaskInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = S>) -> &mut Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    /// Index of the task currently executing, or the next one to execute.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every queued task in order.
    ///
    /// Returns `Err` only for broken invariants: a runner started twice, a
    /// task reporting two outcomes, or a task returning without one.
    pub async fn run<M>(&mut self, model: &mut M) -> Result<RunOutcome, TaskError>
    where
        S: Step<M>,
        M: TaskModel + Send,
    {
        if self.status != RunnerStatus::Idle {
            error!(runner = %self.label, status = ?self.status, "task runner started twice");
            return Err(TaskError::RunnerNotIdle(self.label.clone()));
        }
        self.status = RunnerStatus::Running;
        let result = self.drive(model).await;
        self.status = RunnerStatus::Finished;
        result
    }

    async fn drive<M>(&mut self, model: &mut M) -> Result<RunOutcome, TaskError>
    where
        S: Step<M>,
        M: TaskModel + Send,
    {
        while let Some(step) = self.tasks.get(self.cursor).copied() {
            if self.cancel.is_cancelled() {
                debug!(runner = %self.label, cursor = self.cursor, "runner cancelled");
                return Ok(RunOutcome::Cancelled);
            }

            let task = step.name();
            self.interceptor.before(&self.label, task);
            let mut outcome = TaskOutcome::new(task);
            step.run(model, &mut outcome).await;
            self.interceptor.after(&self.label, task, &outcome);
            model.request_persistence();

            if let Some(violation) = outcome.violation.take() {
                return Err(violation);
            }
            if self.cancel.is_cancelled() {
                debug!(runner = %self.label, task, "runner cancelled, outcome suppressed");
                return Ok(RunOutcome::Cancelled);
            }
            match outcome.state {
                Termination::Pending => {
                    error!(runner = %self.label, task, "task returned without an outcome");
                    return Err(TaskError::NoOutcome(task));
                }
                Termination::Completed => self.cursor += 1,
                Termination::Failed(reason) => {
                    warn!(runner = %self.label, task, %reason, "task failed");
                    return Ok(RunOutcome::Failed(TaskFailure { task, reason }));
                }
            }
        }
        Ok(RunOutcome::Completed)
    }
}
