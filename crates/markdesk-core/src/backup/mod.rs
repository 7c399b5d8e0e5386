pub mod catalog;
pub mod export;
pub mod import;
pub mod validate;

mod files;

pub use catalog::{
    AUTO_BACKUP_PREFIX, auto_backup_file_name, create_auto_backup, list_backups, prune_backups,
};
pub use export::export_backup;
pub use import::{PRE_IMPORT_SUFFIX, import_backup, import_backup_with, pre_import_path};
pub use validate::{read_bundle_metadata, validate_bundle, validate_bundle_with};

use crate::models::CoreError;

pub type BackupResult<T> = Result<T, CoreError>;

/// Bundle format version written by this engine and the only one it accepts.
pub const BACKUP_VERSION: &str = "1.0";

pub const DATABASE_ENTRY: &str = "database.sqlite";
pub const METADATA_ENTRY: &str = "metadata.json";
pub const UPLOADS_PREFIX: &str = "uploads/";

/// First 16 bytes of every SQLite 3 database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Allowed relative deviation between recorded and archived sizes.
pub const SIZE_TOLERANCE: f64 = 0.01;
