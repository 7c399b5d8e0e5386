pub mod jobs;
pub mod schedule;

pub use jobs::{auto_backup_job, queue_maintenance_job};
pub use schedule::Schedule;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{CoreError, TaskId, TaskStatus};
use crate::orchestration::{OrchestrationResult, TaskQueue};

type SubmitJob = Arc<dyn Fn(&TaskQueue) -> OrchestrationResult<TaskId> + Send + Sync>;

/// A named unit of recurring work. Each tick submits it to the task queue.
#[derive(Clone)]
pub struct ScheduledJob {
    name: String,
    schedule: Schedule,
    submit: SubmitJob,
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        submit: impl Fn(&TaskQueue) -> OrchestrationResult<TaskId> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schedule,
            submit: Arc::new(submit),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }
}

/// Outcome of one scheduler tick for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Submitted(TaskId),
    /// The previous run is still pending or running.
    Skipped(TaskId),
}

struct JobSlot {
    job: ScheduledJob,
    last_task: Mutex<Option<TaskId>>,
}

impl JobSlot {
    // At most one run of a job is in flight at a time.
    fn fire(&self, queue: &TaskQueue) -> OrchestrationResult<TickOutcome> {
        let mut last_task = self
            .last_task
            .lock()
            .map_err(|_| CoreError::internal("scheduler job state lock poisoned"))?;

        if let Some(previous) = *last_task {
            let status = queue.get_status(previous).status;
            if !status.is_terminal() && status != TaskStatus::NotFound {
                info!(
                    job = %self.job.name,
                    task_id = previous.0,
                    status = ?status,
                    "previous run still in flight; skipping tick"
                );
                return Ok(TickOutcome::Skipped(previous));
            }
        }

        let task_id = (self.job.submit)(queue)?;
        *last_task = Some(task_id);
        debug!(job = %self.job.name, task_id = task_id.0, "scheduled job submitted");
        Ok(TickOutcome::Submitted(task_id))
    }
}

/// Fires registered jobs on their schedules by submitting them to a
/// [`TaskQueue`]. Owned by the application; nothing here is global.
pub struct Scheduler {
    queue: TaskQueue,
    jobs: Vec<Arc<JobSlot>>,
    shutdown_tx: watch::Sender<bool>,
    runners: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(queue: TaskQueue) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            jobs: Vec::new(),
            shutdown_tx,
            runners: Vec::new(),
        }
    }

    /// Registers a job. Names must be unique and jobs can only be added
    /// before [`Scheduler::start`].
    pub fn add_job(&mut self, job: ScheduledJob) -> OrchestrationResult<()> {
        if self.is_running() {
            return Err(CoreError::invalid_input(format!(
                "cannot add job '{}' to a running scheduler",
                job.name
            )));
        }
        if self.jobs.iter().any(|slot| slot.job.name == job.name) {
            return Err(CoreError::invalid_input(format!(
                "scheduled job '{}' is already registered",
                job.name
            )));
        }
        info!(job = %job.name, schedule = ?job.schedule, "scheduled job registered");
        self.jobs.push(Arc::new(JobSlot {
            job,
            last_task: Mutex::new(None),
        }));
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|slot| slot.job.name()).collect()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        !self.runners.is_empty()
    }

    /// Spawns one timer per job on the current tokio runtime.
    pub fn start(&mut self) -> OrchestrationResult<()> {
        if self.is_running() {
            return Err(CoreError::invalid_input("scheduler is already running"));
        }
        let runtime = Handle::try_current().map_err(|error| {
            CoreError::internal(format!("scheduler requires a tokio runtime: {error}"))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        for slot in &self.jobs {
            self.runners.push(runtime.spawn(run_job(
                self.queue.clone(),
                slot.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!(jobs = self.jobs.len(), "scheduler started");
        Ok(())
    }

    /// Fires the named job immediately, outside its schedule. The
    /// single-flight rule still applies.
    pub fn trigger(&self, name: &str) -> OrchestrationResult<TickOutcome> {
        let slot = self
            .jobs
            .iter()
            .find(|slot| slot.job.name == name)
            .ok_or_else(|| CoreError::not_found(format!("scheduled job '{name}' not found")))?;
        slot.fire(&self.queue)
    }

    /// Stops the timers. Tasks already submitted keep running on the queue.
    pub async fn shutdown(&mut self) {
        // Receivers may already be gone if every runner exited.
        let _ = self.shutdown_tx.send(true);
        for runner in self.runners.drain(..) {
            if let Err(error) = runner.await {
                warn!(error = %error, "scheduler runner ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

async fn run_job(queue: TaskQueue, slot: Arc<JobSlot>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delay = slot.job.schedule.delay_from(Utc::now());
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped scheduler stops its runners too.
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(error) = slot.fire(&queue) {
            warn!(job = %slot.job.name, error = %error, "scheduled job could not be submitted");
        }
    }
    debug!(job = %slot.job.name, "scheduler runner exited");
}
