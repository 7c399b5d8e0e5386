use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use markdesk_core::config::AppConfig;
use markdesk_core::models::{CoreError, CoreErrorKind};
use markdesk_core::orchestration::{TaskOptions, TaskQueue};
use markdesk_core::scheduler::{
    Schedule, ScheduledJob, Scheduler, TickOutcome, auto_backup_job, queue_maintenance_job,
};
use markdesk_core::sqlite::initialize_schema;

fn test_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("markdesk-{test_name}-{nanos}"));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn counting_job(name: &str, every: Duration, runs: Arc<AtomicU32>, work: Duration) -> ScheduledJob {
    ScheduledJob::new(name, Schedule::Interval(every), move |queue| {
        let runs = runs.clone();
        queue.submit("counted", TaskOptions::default(), move |_| {
            let runs = runs.clone();
            async move {
                tokio::time::sleep(work).await;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(())
            }
        })
    })
}

#[tokio::test(start_paused = true)]
async fn interval_job_fires_on_every_tick_until_shutdown() {
    let queue = TaskQueue::default();
    let runs = Arc::new(AtomicU32::new(0));
    let mut scheduler = Scheduler::new(queue.clone());
    scheduler
        .add_job(counting_job(
            "tick",
            Duration::from_secs(10),
            runs.clone(),
            Duration::ZERO,
        ))
        .unwrap();

    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    tokio::time::sleep(Duration::from_secs(35)).await;
    scheduler.shutdown().await;
    assert!(!scheduler.is_running());

    assert_eq!(runs.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3, "no ticks after shutdown");
}

#[tokio::test(start_paused = true)]
async fn job_still_in_flight_skips_the_next_tick() {
    let queue = TaskQueue::default();
    let runs = Arc::new(AtomicU32::new(0));
    let mut scheduler = Scheduler::new(queue.clone());
    scheduler
        .add_job(counting_job(
            "slow",
            Duration::from_secs(60),
            runs.clone(),
            Duration::from_secs(5),
        ))
        .unwrap();

    let TickOutcome::Submitted(first) = scheduler.trigger("slow").unwrap() else {
        panic!("first trigger must submit");
    };
    assert_eq!(
        scheduler.trigger("slow").unwrap(),
        TickOutcome::Skipped(first)
    );

    queue.wait_for_task(first, None).await.unwrap();
    let TickOutcome::Submitted(second) = scheduler.trigger("slow").unwrap() else {
        panic!("trigger after completion must submit");
    };
    assert_ne!(first, second);
    queue.wait_for_task(second, None).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn registration_rules_are_enforced() {
    let queue = TaskQueue::default();
    let mut scheduler = Scheduler::new(queue);
    let runs = Arc::new(AtomicU32::new(0));
    scheduler
        .add_job(counting_job("a", Duration::from_secs(1), runs.clone(), Duration::ZERO))
        .unwrap();

    let duplicate = scheduler
        .add_job(counting_job("a", Duration::from_secs(1), runs.clone(), Duration::ZERO))
        .unwrap_err();
    assert_eq!(duplicate.kind, CoreErrorKind::InvalidInput);
    assert_eq!(scheduler.job_names(), vec!["a"]);

    let unknown = scheduler.trigger("missing").unwrap_err();
    assert_eq!(unknown.kind, CoreErrorKind::NotFound);

    scheduler.start().unwrap();
    assert_eq!(
        scheduler.start().unwrap_err().kind,
        CoreErrorKind::InvalidInput
    );
    assert_eq!(
        scheduler
            .add_job(counting_job("b", Duration::from_secs(1), runs, Duration::ZERO))
            .unwrap_err()
            .kind,
        CoreErrorKind::InvalidInput
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn trigger_after_queue_shutdown_reports_shut_down() {
    let queue = TaskQueue::default();
    let mut scheduler = Scheduler::new(queue.clone());
    scheduler
        .add_job(counting_job(
            "late",
            Duration::from_secs(1),
            Arc::new(AtomicU32::new(0)),
            Duration::ZERO,
        ))
        .unwrap();

    assert!(queue.shutdown(true, Duration::from_secs(1)).await);
    let error = scheduler.trigger("late").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ShutDown);
}

#[tokio::test]
async fn auto_backup_job_writes_a_bundle_through_the_queue() {
    let dir = test_dir("scheduler-auto-backup");
    let config = AppConfig {
        data_dir: dir.clone(),
        ..AppConfig::default()
    };
    initialize_schema(config.database_path()).unwrap();

    let queue = TaskQueue::new(config.queue_config());
    let mut scheduler = Scheduler::new(queue.clone());
    scheduler.add_job(auto_backup_job(&config).unwrap()).unwrap();

    let TickOutcome::Submitted(task_id) = scheduler.trigger("auto_backup").unwrap() else {
        panic!("auto backup must be submitted");
    };
    let value = queue.wait_for_task(task_id, None).await.unwrap();

    let path = PathBuf::from(value["path"].as_str().unwrap());
    assert!(path.is_file());
    assert!(path.starts_with(config.backups_path()));
    assert_eq!(value["pruned"], 0);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn maintenance_job_reports_queue_counts() {
    let queue = TaskQueue::default();
    let mut scheduler = Scheduler::new(queue.clone());
    scheduler
        .add_job(queue_maintenance_job(Schedule::Interval(Duration::from_secs(300))))
        .unwrap();

    let TickOutcome::Submitted(task_id) = scheduler.trigger("queue_maintenance").unwrap() else {
        panic!("maintenance must be submitted");
    };
    let value = queue.wait_for_task(task_id, None).await.unwrap();

    assert_eq!(value["running"], 1);
    assert_eq!(value["failed"], 0);
}
