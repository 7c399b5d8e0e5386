use serde_json::json;
use tracing::info;

use crate::backup::create_auto_backup;
use crate::config::{AppConfig, ConfigResult};
use crate::models::CoreError;
use crate::orchestration::TaskOptions;
use crate::scheduler::{Schedule, ScheduledJob};

pub const AUTO_BACKUP_JOB: &str = "auto_backup";
pub const QUEUE_MAINTENANCE_JOB: &str = "queue_maintenance";

/// Periodic backup into the configured backups directory, followed by
/// retention pruning. Runs on the blocking pool.
pub fn auto_backup_job(config: &AppConfig) -> ConfigResult<ScheduledJob> {
    let schedule = config.backup.schedule.to_schedule()?;
    let options = config.task_options();
    let config = config.clone();

    Ok(ScheduledJob::new(AUTO_BACKUP_JOB, schedule, move |queue| {
        let config = config.clone();
        queue.submit_blocking(AUTO_BACKUP_JOB, options, move |_| {
            create_auto_backup(&config).map(|report| {
                json!({
                    "path": report.path.display().to_string(),
                    "created_at": report.metadata.created_at,
                    "total_size_bytes": report.metadata.statistics.total_size_bytes,
                    "pruned": report.pruned.len(),
                })
            })
        })
    }))
}

/// Logs per-status task counts of the queue it is submitted to.
pub fn queue_maintenance_job(schedule: Schedule) -> ScheduledJob {
    ScheduledJob::new(QUEUE_MAINTENANCE_JOB, schedule, |queue| {
        let observed = queue.clone();
        queue.submit(
            QUEUE_MAINTENANCE_JOB,
            TaskOptions::default().with_max_retries(0),
            move |_| {
                let counts = observed.counts();
                info!(
                    pending = counts.pending,
                    running = counts.running,
                    completed = counts.completed,
                    failed = counts.failed,
                    cancelled = counts.cancelled,
                    "task queue status"
                );
                async move { Ok::<_, CoreError>(counts) }
            },
        )
    })
}
