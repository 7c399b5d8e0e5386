use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::backup::{
    BACKUP_VERSION, BackupResult, DATABASE_ENTRY, METADATA_ENTRY, SIZE_TOLERANCE, SQLITE_MAGIC,
    UPLOADS_PREFIX,
};
use crate::models::{BackupMetadata, CoreError, SizeMismatchPolicy, ValidationOutcome};

const REQUIRED_FIELDS: [&str; 6] = [
    "backup_version",
    "created_at",
    "app_version",
    "platform",
    "includes",
    "statistics",
];

pub(crate) type BundleArchive = ZipArchive<BufReader<File>>;

/// Checks a bundle with the default (warn-only) size policy. Never fails;
/// defects are reported in the returned outcome.
pub fn validate_bundle(bundle_path: &Path) -> ValidationOutcome {
    validate_bundle_with(bundle_path, SizeMismatchPolicy::Warn)
}

pub fn validate_bundle_with(bundle_path: &Path, policy: SizeMismatchPolicy) -> ValidationOutcome {
    match inspect_bundle(bundle_path, policy) {
        Ok(_) => {
            debug!(bundle = %bundle_path.display(), "backup bundle is valid");
            ValidationOutcome::valid()
        }
        Err(message) => {
            warn!(
                bundle = %bundle_path.display(),
                reason = %message,
                "backup bundle rejected"
            );
            ValidationOutcome::invalid(message)
        }
    }
}

/// Parsed metadata of a bundle, without extracting or validating the rest.
pub fn read_bundle_metadata(bundle_path: &Path) -> BackupResult<BackupMetadata> {
    if !bundle_path.is_file() {
        return Err(CoreError::not_found(format!(
            "Backup file not found: {}",
            bundle_path.display()
        )));
    }
    let mut archive = open_archive(bundle_path).map_err(CoreError::invalid_bundle)?;
    let document = read_entry(&mut archive, METADATA_ENTRY)
        .map_err(|_| CoreError::invalid_bundle("Missing metadata in backup"))?;
    serde_json::from_slice(&document)
        .map_err(|error| CoreError::invalid_bundle(format!("Invalid metadata JSON: {error}")))
}

/// Runs every check in order and returns the bundle's metadata, or the
/// message describing the first defect.
pub(crate) fn inspect_bundle(
    bundle_path: &Path,
    policy: SizeMismatchPolicy,
) -> Result<BackupMetadata, String> {
    if !bundle_path.exists() {
        return Err(format!("Backup file not found: {}", bundle_path.display()));
    }

    let mut archive = open_archive(bundle_path)?;
    let sizes = verify_entries(&mut archive)?;

    if !sizes.has_database {
        return Err("Missing database in backup".to_string());
    }
    if !sizes.has_metadata {
        return Err("Missing metadata in backup".to_string());
    }

    let document = read_entry(&mut archive, METADATA_ENTRY)
        .map_err(|error| format!("Failed to read metadata: {error}"))?;
    let metadata = parse_metadata(&document)?;

    if sizes.database_bytes == 0 {
        return Err("Database in backup is empty".to_string());
    }
    let header = read_header(&mut archive, DATABASE_ENTRY)
        .map_err(|error| format!("Failed to read database from backup: {error}"))?;
    if header.as_slice() != SQLITE_MAGIC.as_slice() {
        return Err("Database file is not valid SQLite format".to_string());
    }

    check_size(
        "Database",
        metadata.statistics.database_size_bytes,
        sizes.database_bytes,
        policy,
    )?;
    check_size(
        "Uploads",
        metadata.statistics.uploads_size_bytes,
        sizes.uploads_bytes,
        policy,
    )?;

    Ok(metadata)
}

pub(crate) fn open_archive(bundle_path: &Path) -> Result<BundleArchive, String> {
    let file = File::open(bundle_path).map_err(|error| format!("Failed to open backup: {error}"))?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|error| format!("Invalid backup archive: {error}"))
}

#[derive(Default)]
struct EntrySizes {
    has_database: bool,
    has_metadata: bool,
    database_bytes: u64,
    uploads_bytes: u64,
}

// Reads every entry to the end so the zip reader verifies each CRC.
fn verify_entries(archive: &mut BundleArchive) -> Result<EntrySizes, String> {
    let mut sizes = EntrySizes::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| format!("Corrupted backup archive: {error}"))?;
        let name = entry.name().to_string();
        let read = io::copy(&mut entry, &mut io::sink())
            .map_err(|error| format!("Corrupted backup archive entry '{name}': {error}"))?;

        if entry.is_dir() {
            continue;
        }
        if name == DATABASE_ENTRY {
            sizes.has_database = true;
            sizes.database_bytes = read;
        } else if name == METADATA_ENTRY {
            sizes.has_metadata = true;
        } else if name.starts_with(UPLOADS_PREFIX) {
            sizes.uploads_bytes += read;
        }
    }
    Ok(sizes)
}

fn parse_metadata(document: &[u8]) -> Result<BackupMetadata, String> {
    let value: Value = serde_json::from_slice(document)
        .map_err(|error| format!("Invalid metadata JSON: {error}"))?;
    let Some(fields) = value.as_object() else {
        return Err("Invalid metadata JSON: expected an object".to_string());
    };

    if let Some(missing) = REQUIRED_FIELDS
        .iter()
        .find(|field| !fields.contains_key(**field))
    {
        return Err(format!("Missing required metadata field: {missing}"));
    }

    match fields.get("backup_version") {
        Some(Value::String(version)) if version == BACKUP_VERSION => {}
        Some(Value::String(version)) => {
            return Err(format!("Unsupported backup version: {version}"));
        }
        Some(other) => return Err(format!("Unsupported backup version: {other}")),
        None => return Err("Missing required metadata field: backup_version".to_string()),
    }

    serde_json::from_value(value).map_err(|error| format!("Invalid metadata: {error}"))
}

fn check_size(
    label: &str,
    recorded: u64,
    actual: u64,
    policy: SizeMismatchPolicy,
) -> Result<(), String> {
    if within_tolerance(recorded, actual) {
        return Ok(());
    }

    let message =
        format!("{label} size mismatch: metadata records {recorded} bytes, backup holds {actual}");
    match policy {
        SizeMismatchPolicy::Warn => {
            warn!(recorded, actual, "{message}");
            Ok(())
        }
        SizeMismatchPolicy::Reject => Err(message),
    }
}

fn within_tolerance(recorded: u64, actual: u64) -> bool {
    if recorded == actual {
        return true;
    }
    if recorded == 0 {
        return false;
    }
    let difference = recorded.abs_diff(actual) as f64;
    difference / recorded as f64 <= SIZE_TOLERANCE
}

pub(crate) fn read_entry(archive: &mut BundleArchive, name: &str) -> io::Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(io::Error::other)?;
    let mut buffer = Vec::new();
    entry.read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn read_header(archive: &mut BundleArchive, name: &str) -> io::Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(io::Error::other)?;
    let mut header = Vec::with_capacity(SQLITE_MAGIC.len());
    entry
        .take(SQLITE_MAGIC.len() as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}
