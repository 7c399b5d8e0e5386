pub mod backup;
pub mod error;
pub mod task;

pub use backup::{
    AutoBackupReport, BackupIncludes, BackupMetadata, BackupStatistics, BackupSummary,
    ImportReport, RecordCounts, SizeMismatchPolicy, ValidationOutcome,
};
pub use error::{CoreError, CoreErrorKind, TaskFailure};
pub use task::{TaskCounts, TaskId, TaskSnapshot, TaskStatus};
