use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backup::{BackupResult, export_backup, read_bundle_metadata};
use crate::config::AppConfig;
use crate::models::{AutoBackupReport, BackupSummary, CoreError};

/// File name prefix of bundles written by the scheduler. Only these are
/// pruned.
pub const AUTO_BACKUP_PREFIX: &str = "auto-backup-";

pub fn auto_backup_file_name(now: DateTime<Utc>) -> String {
    format!("{AUTO_BACKUP_PREFIX}{}.zip", now.format("%Y%m%d-%H%M%S"))
}

/// Summaries of every `.zip` bundle in `backups_dir`, newest first. A
/// missing directory has no backups.
pub fn list_backups(backups_dir: &Path) -> BackupResult<Vec<BackupSummary>> {
    let mut found: Vec<(SystemTime, BackupSummary)> = Vec::new();
    for path in zip_files(backups_dir)? {
        let file_metadata = fs::metadata(&path).map_err(|error| {
            CoreError::io(format!("failed to stat {}: {error}", path.display()))
        })?;
        let modified = file_metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let metadata = match read_bundle_metadata(&path) {
            Ok(metadata) => Some(metadata),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable backup metadata");
                None
            }
        };
        found.push((
            modified,
            BackupSummary {
                path,
                file_size_bytes: file_metadata.len(),
                metadata,
            },
        ));
    }

    found.sort_by(|(left_time, left), (right_time, right)| {
        right_time
            .cmp(left_time)
            .then_with(|| right.path.cmp(&left.path))
    });
    Ok(found.into_iter().map(|(_, summary)| summary).collect())
}

/// Deletes automatic backups beyond the newest `keep`, returning the
/// removed paths. Files that cannot be removed are logged and skipped.
pub fn prune_backups(backups_dir: &Path, keep: usize) -> BackupResult<Vec<PathBuf>> {
    let mut automatic: Vec<PathBuf> = zip_files(backups_dir)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(AUTO_BACKUP_PREFIX))
        })
        .collect();
    // Names embed the creation timestamp, so name order is age order.
    automatic.sort_by(|left, right| right.cmp(left));

    let mut removed = Vec::new();
    for path in automatic.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "pruned old backup");
                removed.push(path);
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to prune backup");
            }
        }
    }
    Ok(removed)
}

/// Exports a timestamped bundle into the configured backups directory, then
/// prunes automatic backups down to the configured retention.
pub fn create_auto_backup(config: &AppConfig) -> BackupResult<AutoBackupReport> {
    let backups_dir = config.backups_path();
    let path = backups_dir.join(auto_backup_file_name(Utc::now()));
    let metadata = export_backup(
        &config.database_path(),
        &config.uploads_path(),
        &path,
        &config.app_version,
    )?;
    let pruned = prune_backups(&backups_dir, config.backup.retention.max(1))?;

    info!(
        path = %path.display(),
        pruned = pruned.len(),
        "automatic backup finished"
    );
    Ok(AutoBackupReport {
        path,
        metadata,
        pruned,
    })
}

fn zip_files(dir: &Path) -> BackupResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(CoreError::io(format!(
                "failed to read {}: {error}",
                dir.display()
            )));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| {
            CoreError::io(format!("failed to read {}: {error}", dir.display()))
        })?;
        let path = entry.path();
        let is_zip = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("zip"));
        if is_zip && path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}
