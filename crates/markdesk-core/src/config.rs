use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, SizeMismatchPolicy};
use crate::orchestration::{QueueConfig, RetryPolicy, TaskOptions};
use crate::scheduler::Schedule;

pub type ConfigResult<T> = Result<T, CoreError>;

/// Environment variable that overrides [`AppConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "MARKDESK_DATA_DIR";

/// Upper bound for `queue.backoff_base_secs` (one day).
pub const MAX_BACKOFF_BASE_SECS: f64 = 86_400.0;

/// Application configuration, stored as JSON. Every field is optional on
/// disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// File name of the database inside `data_dir`.
    pub database_file: String,
    pub uploads_dir: String,
    pub backups_dir: String,
    /// Version stamped into backup metadata.
    pub app_version: String,
    pub queue: QueueSettings,
    pub backup: BackupSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub enabled: bool,
    pub schedule: ScheduleConfig,
    /// Automatic backups kept after pruning.
    pub retention: usize,
    pub size_mismatch: SizeMismatchPolicy,
}

/// On-disk form of a [`Schedule`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleConfig {
    Interval {
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        seconds: u64,
    },
    /// Once a day at the given UTC time.
    Daily {
        hour: u32,
        #[serde(default)]
        minute: u32,
    },
}

impl ScheduleConfig {
    pub fn to_schedule(self) -> ConfigResult<Schedule> {
        match self {
            ScheduleConfig::Interval {
                hours,
                minutes,
                seconds,
            } => {
                let total = hours
                    .checked_mul(3600)
                    .and_then(|secs| minutes.checked_mul(60).and_then(|m| secs.checked_add(m)))
                    .and_then(|secs| secs.checked_add(seconds))
                    .ok_or_else(|| CoreError::invalid_input("backup interval is too large"))?;
                if total == 0 {
                    return Err(CoreError::invalid_input(
                        "backup interval must be greater than zero",
                    ));
                }
                Ok(Schedule::Interval(Duration::from_secs(total)))
            }
            ScheduleConfig::Daily { hour, minute } => Schedule::daily(hour, minute),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file: "markdesk.db".to_string(),
            uploads_dir: "uploads".to_string(),
            backups_dir: "backups".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            queue: QueueSettings::default(),
            backup: BackupSettings::default(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            backoff_base_secs: 1.0,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: ScheduleConfig::Interval {
                hours: 24,
                minutes: 0,
                seconds: 0,
            },
            retention: 7,
            size_mismatch: SizeMismatchPolicy::Warn,
        }
    }
}

impl AppConfig {
    /// Loads the config at `path` (defaults when the file does not exist),
    /// applies environment overrides and validates the result.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(error) => {
                return Err(CoreError::io(format!(
                    "failed to read config {}: {error}",
                    path.display()
                )));
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content)
            .map_err(|error| CoreError::invalid_input(format!("invalid config: {error}")))
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| {
                CoreError::io(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|error| CoreError::internal(format!("failed to encode config: {error}")))?;
        fs::write(path, content).map_err(|error| {
            CoreError::io(format!("failed to write config {}: {error}", path.display()))
        })
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup(DATA_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            self.data_dir = PathBuf::from(data_dir);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database_file.trim().is_empty() {
            return Err(CoreError::invalid_input("database_file must not be empty"));
        }
        if self.queue.workers == 0 {
            return Err(CoreError::invalid_input("queue.workers must be at least 1"));
        }
        if !self.queue.backoff_base_secs.is_finite()
            || !(0.0..=MAX_BACKOFF_BASE_SECS).contains(&self.queue.backoff_base_secs)
        {
            return Err(CoreError::invalid_input(format!(
                "queue.backoff_base_secs must be between 0 and {MAX_BACKOFF_BASE_SECS}"
            )));
        }
        self.backup.schedule.to_schedule()?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.data_dir.join(&self.uploads_dir)
    }

    pub fn backups_path(&self) -> PathBuf {
        self.data_dir.join(&self.backups_dir)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            workers: self.queue.workers,
            retry_policy: RetryPolicy::new(
                Duration::try_from_secs_f64(self.queue.backoff_base_secs.max(0.0))
                    .unwrap_or(Duration::MAX),
                2.0,
            ),
        }
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions::default().with_max_retries(self.queue.max_retries)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.shutdown_timeout_secs)
    }
}
