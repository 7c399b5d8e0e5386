use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metadata document embedded in every backup bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_version: String,
    pub created_at: String,
    pub app_version: String,
    pub platform: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub database_schema_version: String,
    pub includes: BackupIncludes,
    pub statistics: BackupStatistics,
}

/// Settings and credentials are never part of a bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackupIncludes {
    pub database: bool,
    pub uploads: bool,
    pub settings: bool,
    pub credentials: bool,
}

impl BackupIncludes {
    pub const fn standard() -> Self {
        Self {
            database: true,
            uploads: true,
            settings: false,
            credentials: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub num_schemes: u64,
    pub num_submissions: u64,
    pub num_jobs: u64,
    pub database_size_bytes: u64,
    pub uploads_size_bytes: u64,
    pub total_size_bytes: u64,
}

impl BackupStatistics {
    pub fn new(counts: RecordCounts, database_size_bytes: u64, uploads_size_bytes: u64) -> Self {
        Self {
            num_schemes: counts.schemes,
            num_submissions: counts.submissions,
            num_jobs: counts.jobs,
            database_size_bytes,
            uploads_size_bytes,
            total_size_bytes: database_size_bytes + uploads_size_bytes,
        }
    }
}

/// Domain record counts read from the application database.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecordCounts {
    pub schemes: u64,
    pub submissions: u64,
    pub jobs: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub message: String,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            message: "Backup is valid".to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
        }
    }
}

/// How size deviations beyond tolerance are treated during validation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMismatchPolicy {
    #[default]
    Warn,
    Reject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportReport {
    pub metadata: BackupMetadata,
    pub pre_import_database: Option<PathBuf>,
    pub pre_import_uploads: Option<PathBuf>,
    pub restored_uploads: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub metadata: Option<BackupMetadata>,
}

/// Outcome of a scheduled backup: the new bundle and the bundles pruned
/// after it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoBackupReport {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
    pub pruned: Vec<PathBuf>,
}
