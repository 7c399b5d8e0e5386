use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::models::{
    CoreError, CoreErrorKind, TaskCounts, TaskFailure, TaskId, TaskSnapshot, TaskStatus,
};
use crate::orchestration::{OrchestrationResult, RetryPolicy};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskFailure>> + Send>>;

pub type TaskOperation = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Passed to every attempt of a task callable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// Zero-based attempt index.
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaskOptions {
    /// Delay before the first attempt becomes eligible to run.
    pub countdown: Duration,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
}

impl TaskOptions {
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = countdown;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            countdown: Duration::ZERO,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub workers: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Failure recorded when a task callable panics instead of returning.
#[derive(Debug, thiserror::Error)]
#[error("task panicked: {0}")]
pub struct TaskPanicked(pub String);

/// In-process background task queue with a bounded worker pool and
/// exponential retry backoff.
///
/// Cloning is cheap; clones share the same tasks and workers.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    workers: Arc<Semaphore>,
    retry_policy: RetryPolicy,
}

#[derive(Default)]
struct QueueState {
    next_task_id: u64,
    shut_down: bool,
    tasks: HashMap<TaskId, TaskSnapshot>,
    failures: HashMap<TaskId, TaskFailure>,
    handles: HashMap<TaskId, JoinHandle<()>>,
    completion_notifiers: HashMap<TaskId, Arc<Notify>>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                workers: Arc::new(Semaphore::new(workers)),
                retry_policy: config.retry_policy,
            }),
        }
    }

    /// Registers a task and schedules it. Returns as soon as the task is
    /// recorded as pending; the callable runs on the worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut, T, E>(
        &self,
        name: impl Into<String>,
        options: TaskOptions,
        operation: F,
    ) -> OrchestrationResult<TaskId>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        let operation: TaskOperation = Arc::new(move |context| {
            let attempt = operation(context);
            Box::pin(async move {
                let value = attempt.await.map_err(|error| {
                    let boxed: Box<dyn Error + Send + Sync> = error.into();
                    TaskFailure::from(boxed)
                })?;
                serde_json::to_value(value).map_err(|error| Arc::new(error) as TaskFailure)
            }) as TaskFuture
        });
        self.submit_operation(name.into(), options, operation)
    }

    /// Like [`TaskQueue::submit`], for synchronous callables. Each attempt
    /// runs on tokio's blocking thread pool while holding a worker slot.
    pub fn submit_blocking<F, T, E>(
        &self,
        name: impl Into<String>,
        options: TaskOptions,
        operation: F,
    ) -> OrchestrationResult<TaskId>
    where
        F: Fn(TaskContext) -> Result<T, E> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        let operation = Arc::new(operation);
        self.submit(name, options, move |context| {
            let operation = operation.clone();
            async move {
                match tokio::task::spawn_blocking(move || operation(context)).await {
                    Ok(outcome) => outcome.map_err(Into::into),
                    Err(join_error) => {
                        Err(Box::new(join_failure(join_error)) as Box<dyn Error + Send + Sync>)
                    }
                }
            }
        })
    }

    fn submit_operation(
        &self,
        name: String,
        options: TaskOptions,
        operation: TaskOperation,
    ) -> OrchestrationResult<TaskId> {
        let runtime = Handle::try_current().map_err(|error| {
            CoreError::internal(format!("task queue requires a tokio runtime: {error}"))
        })?;

        let mut state = self.shared.lock_state();
        if state.shut_down {
            return Err(CoreError::new(
                CoreErrorKind::ShutDown,
                format!("task queue is shut down; rejected task '{name}'"),
            ));
        }

        state.next_task_id = state.next_task_id.saturating_add(1);
        let task_id = TaskId(state.next_task_id);
        state.tasks.insert(
            task_id,
            TaskSnapshot {
                id: task_id,
                name: name.clone(),
                status: TaskStatus::Pending,
                submitted_at: Some(Utc::now()),
                started_at: None,
                completed_at: None,
                failed_at: None,
                cancelled_at: None,
                countdown_secs: options.countdown.as_secs_f64(),
                max_retries: options.max_retries,
                attempts: 0,
                result: None,
                error: None,
            },
        );

        let completion = Arc::new(Notify::new());
        state
            .completion_notifiers
            .insert(task_id, completion.clone());

        // The handle is inserted before the lock is released so a fast task
        // cannot finalize ahead of its own registration.
        let handle = runtime.spawn(run_task(
            self.shared.clone(),
            task_id,
            options,
            operation,
            completion,
        ));
        state.handles.insert(task_id, handle);

        debug!(
            task_id = task_id.0,
            name = %name,
            countdown_secs = options.countdown.as_secs_f64(),
            max_retries = options.max_retries,
            "task submitted"
        );
        Ok(task_id)
    }

    /// Snapshot of the task, or a snapshot with status `NotFound` for unknown
    /// ids.
    pub fn get_status(&self, task_id: TaskId) -> TaskSnapshot {
        self.snapshot(task_id)
            .unwrap_or_else(|| TaskSnapshot::not_found(task_id))
    }

    pub fn snapshot(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.shared.lock_state().tasks.get(&task_id).cloned()
    }

    pub fn get_all_tasks(&self) -> BTreeMap<TaskId, TaskSnapshot> {
        self.shared
            .lock_state()
            .tasks
            .iter()
            .map(|(task_id, snapshot)| (*task_id, snapshot.clone()))
            .collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.shared.lock_state();
        let mut counts = TaskCounts::default();
        for snapshot in state.tasks.values() {
            match snapshot.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::NotFound => {}
            }
        }
        counts
    }

    /// Cancels a task that has not started yet. Returns `false` for unknown
    /// tasks and for tasks that are running or finished.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let (handle, completion) = {
            let mut state = self.shared.lock_state();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                warn!(task_id = task_id.0, "cannot cancel unknown task");
                return false;
            };
            if task.status != TaskStatus::Pending {
                info!(
                    task_id = task_id.0,
                    status = ?task.status,
                    "task is no longer pending; cancellation refused"
                );
                return false;
            }

            task.status = TaskStatus::Cancelled;
            task.cancelled_at = Some(Utc::now());
            (
                state.handles.remove(&task_id),
                state.completion_notifiers.get(&task_id).cloned(),
            )
        };

        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(completion) = completion {
            completion.notify_waiters();
        }
        info!(task_id = task_id.0, "task cancelled");
        true
    }

    /// Waits until the task reaches a terminal state and returns its result.
    ///
    /// Fails with `NotFound`, `Timeout`, `Cancelled` or `TaskFailed`. A
    /// `TaskFailed` error carries the callable's own error as its source.
    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<Value> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let completion = self
                .shared
                .lock_state()
                .completion_notifiers
                .get(&task_id)
                .cloned()
                .ok_or_else(|| task_not_found(task_id))?;

            let notified = completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.shared.terminal_outcome(task_id)? {
                return outcome;
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(CoreError::new(
                            CoreErrorKind::Timeout,
                            format!("task {task_id} did not finish before the timeout"),
                        )
                        .with_task(task_id));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stops accepting submissions. With `wait`, blocks until every task in
    /// flight finishes or `timeout` elapses. Running tasks are never
    /// cancelled. Returns `true` when nothing is left in flight.
    pub async fn shutdown(&self, wait: bool, timeout: Duration) -> bool {
        let mut handles: Vec<(TaskId, JoinHandle<()>)> = {
            let mut state = self.shared.lock_state();
            state.shut_down = true;
            if !wait {
                info!(
                    in_flight = state.handles.len(),
                    "task queue shut down without waiting"
                );
                return state.handles.is_empty();
            }
            state.handles.drain().collect()
        };
        handles.sort_by_key(|(task_id, _)| *task_id);

        info!(in_flight = handles.len(), "task queue shutting down");
        let deadline = Instant::now() + timeout;
        let total = handles.len();
        for (index, (task_id, handle)) in handles.into_iter().enumerate() {
            match timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    debug!(
                        task_id = task_id.0,
                        error = %join_error,
                        "task ended abnormally during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        remaining = total - index,
                        timeout_secs = timeout.as_secs_f64(),
                        "task queue shutdown timed out"
                    );
                    return false;
                }
            }
        }

        info!("task queue shut down");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_state().shut_down
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl QueueShared {
    // State is only mutated through plain field assignments, so a poisoned
    // lock still guards consistent data.
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_running_if_pending(&self, task_id: TaskId) -> bool {
        let mut state = self.lock_state();
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    fn record_retry(&self, task_id: TaskId, attempts: u32) {
        if let Some(task) = self.lock_state().tasks.get_mut(&task_id) {
            task.attempts = attempts;
        }
    }

    fn mark_completed(&self, task_id: TaskId, value: Value, attempts: u32) {
        let mut state = self.lock_state();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.attempts = attempts;
            task.result = Some(value);
            task.error = None;
        }
        info!(task_id = task_id.0, attempts, "task completed");
    }

    fn mark_failed(&self, task_id: TaskId, failure: TaskFailure, attempts: u32) {
        let mut state = self.lock_state();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Failed;
            task.failed_at = Some(Utc::now());
            task.attempts = attempts;
            task.error = Some(failure.to_string());
        }
        tracing::error!(
            task_id = task_id.0,
            attempts,
            error = %failure,
            "task failed after exhausting retries"
        );
        state.failures.insert(task_id, failure);
    }

    fn finalize(&self, task_id: TaskId, completion: &Notify) {
        self.lock_state().handles.remove(&task_id);
        completion.notify_waiters();
    }

    fn terminal_outcome(
        &self,
        task_id: TaskId,
    ) -> OrchestrationResult<Option<OrchestrationResult<Value>>> {
        let state = self.lock_state();
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| task_not_found(task_id))?;

        if !task.status.is_terminal() {
            return Ok(None);
        }
        let outcome = match task.status {
            TaskStatus::Completed => Some(Ok(task.result.clone().unwrap_or(Value::Null))),
            TaskStatus::Failed => {
                let mut error = CoreError::new(
                    CoreErrorKind::TaskFailed,
                    format!(
                        "task {task_id} failed after {} attempt(s): {}",
                        task.attempts,
                        task.error.as_deref().unwrap_or("unknown error")
                    ),
                )
                .with_task(task_id);
                error.attempts = Some(task.attempts);
                error.cause = state.failures.get(&task_id).cloned();
                Some(Err(error))
            }
            TaskStatus::Cancelled => Some(Err(CoreError::new(
                CoreErrorKind::Cancelled,
                format!("task {task_id} was cancelled"),
            )
            .with_task(task_id))),
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::NotFound => None,
        };
        Ok(outcome)
    }
}

async fn run_task(
    shared: Arc<QueueShared>,
    task_id: TaskId,
    options: TaskOptions,
    operation: TaskOperation,
    completion: Arc<Notify>,
) {
    // Countdown elapses outside the worker pool.
    if !options.countdown.is_zero() {
        tokio::time::sleep(options.countdown).await;
    }

    let mut attempt: u32 = 0;
    loop {
        let Ok(permit) = shared.workers.clone().acquire_owned().await else {
            shared.mark_failed(
                task_id,
                Arc::new(CoreError::internal("worker pool closed")),
                attempt,
            );
            break;
        };

        if attempt == 0 && !shared.mark_running_if_pending(task_id) {
            debug!(task_id = task_id.0, "task no longer pending; skipping");
            break;
        }

        let outcome = execute_attempt(&operation, TaskContext { task_id, attempt }).await;
        drop(permit);

        match outcome {
            Ok(value) => {
                shared.mark_completed(task_id, value, attempt + 1);
                break;
            }
            Err(failure) if attempt < options.max_retries => {
                let delay = shared.retry_policy.next_delay(attempt);
                warn!(
                    task_id = task_id.0,
                    attempt = attempt + 1,
                    max_attempts = options.max_retries.saturating_add(1),
                    delay_secs = delay.as_secs_f64(),
                    error = %failure,
                    "task attempt failed; retrying"
                );
                shared.record_retry(task_id, attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(failure) => {
                shared.mark_failed(task_id, failure, attempt + 1);
                break;
            }
        }
    }

    shared.finalize(task_id, &completion);
}

// Each attempt runs as its own tokio task so a panicking callable is
// recorded as a failed attempt instead of tearing down the worker.
async fn execute_attempt(
    operation: &TaskOperation,
    context: TaskContext,
) -> Result<Value, TaskFailure> {
    let operation = operation.clone();
    match tokio::spawn(async move { operation(context).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(Arc::new(join_failure(join_error))),
    }
}

fn join_failure(join_error: JoinError) -> TaskPanicked {
    if join_error.is_panic() {
        TaskPanicked(panic_message(join_error.into_panic()))
    } else {
        TaskPanicked(join_error.to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn task_not_found(task_id: TaskId) -> CoreError {
    CoreError::not_found(format!("task {task_id} not found")).with_task(task_id)
}
