use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backup::files::{clear_dir, contained_relative_path, copy_tree, dir_is_empty};
use crate::backup::validate::{BundleArchive, inspect_bundle, open_archive};
use crate::backup::{BackupResult, DATABASE_ENTRY, UPLOADS_PREFIX};
use crate::models::{CoreError, ImportReport, SizeMismatchPolicy};

/// Suffix of the side copies taken before an import overwrites live data.
pub const PRE_IMPORT_SUFFIX: &str = ".pre-import-backup";

/// Sibling path that holds the pre-import copy of `path`.
pub fn pre_import_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("data"));
    name.push(PRE_IMPORT_SUFFIX);
    path.with_file_name(name)
}

/// Restores the database and uploads tree from a bundle.
///
/// The bundle is validated first; an invalid bundle fails with
/// `InvalidBundle` before anything on disk changes. With `backup_existing`,
/// the current database and a non-empty uploads tree are copied aside (see
/// [`pre_import_path`]). Those copies are left in place if extraction fails.
pub fn import_backup(
    bundle_path: &Path,
    database_path: &Path,
    uploads_path: &Path,
    backup_existing: bool,
) -> BackupResult<ImportReport> {
    import_backup_with(
        bundle_path,
        database_path,
        uploads_path,
        backup_existing,
        SizeMismatchPolicy::Warn,
    )
}

pub fn import_backup_with(
    bundle_path: &Path,
    database_path: &Path,
    uploads_path: &Path,
    backup_existing: bool,
    policy: SizeMismatchPolicy,
) -> BackupResult<ImportReport> {
    if !bundle_path.is_file() {
        return Err(CoreError::not_found(format!(
            "Backup file not found: {}",
            bundle_path.display()
        )));
    }
    let metadata = inspect_bundle(bundle_path, policy).map_err(CoreError::invalid_bundle)?;

    let mut archive = open_archive(bundle_path).map_err(CoreError::invalid_bundle)?;
    let uploads = upload_entries(&mut archive)?;

    let mut report = ImportReport {
        metadata,
        pre_import_database: None,
        pre_import_uploads: None,
        restored_uploads: 0,
    };

    if backup_existing {
        report.pre_import_database =
            set_aside_database(database_path).map_err(import_failure)?;
        report.pre_import_uploads = set_aside_uploads(uploads_path).map_err(import_failure)?;
    }

    extract_database(&mut archive, database_path).map_err(import_failure)?;
    report.restored_uploads =
        extract_uploads(&mut archive, &uploads, uploads_path).map_err(import_failure)?;

    info!(
        bundle = %bundle_path.display(),
        database = %database_path.display(),
        uploads = report.restored_uploads,
        created_at = %report.metadata.created_at,
        "backup restored"
    );
    Ok(report)
}

struct UploadEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

// Resolved before anything is written so an escaping entry name rejects the
// whole bundle.
fn upload_entries(archive: &mut BundleArchive) -> BackupResult<Vec<UploadEntry>> {
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(|error| {
            CoreError::invalid_bundle(format!("Corrupted backup archive: {error}"))
        })?;
        let name = entry.name();
        if !name.starts_with(UPLOADS_PREFIX) || name == UPLOADS_PREFIX {
            continue;
        }
        let relative = contained_relative_path(name, UPLOADS_PREFIX).ok_or_else(|| {
            CoreError::invalid_bundle(format!(
                "Backup entry escapes the uploads directory: {name}"
            ))
        })?;
        entries.push(UploadEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }
    Ok(entries)
}

fn set_aside_database(database_path: &Path) -> BackupResult<Option<PathBuf>> {
    if !database_path.is_file() {
        return Ok(None);
    }
    let copy_path = pre_import_path(database_path);
    fs::copy(database_path, &copy_path).map_err(|error| {
        CoreError::io(format!(
            "failed to copy {} to {}: {error}",
            database_path.display(),
            copy_path.display()
        ))
    })?;
    info!(copy = %copy_path.display(), "saved pre-import database");
    Ok(Some(copy_path))
}

fn set_aside_uploads(uploads_path: &Path) -> BackupResult<Option<PathBuf>> {
    let has_content = uploads_path.is_dir()
        && !dir_is_empty(uploads_path).map_err(|error| {
            CoreError::io(format!("failed to read {}: {error}", uploads_path.display()))
        })?;
    if !has_content {
        return Ok(None);
    }

    let copy_path = pre_import_path(uploads_path);
    if copy_path.exists() {
        fs::remove_dir_all(&copy_path).map_err(|error| {
            CoreError::io(format!(
                "failed to replace previous copy {}: {error}",
                copy_path.display()
            ))
        })?;
    }
    copy_tree(uploads_path, &copy_path)?;
    info!(copy = %copy_path.display(), "saved pre-import uploads");
    Ok(Some(copy_path))
}

fn extract_database(archive: &mut BundleArchive, database_path: &Path) -> BackupResult<()> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| {
            CoreError::io(format!("failed to create {}: {error}", parent.display()))
        })?;
    }

    let mut entry = archive
        .by_name(DATABASE_ENTRY)
        .map_err(|error| CoreError::io(format!("failed to open database entry: {error}")))?;
    let mut output = File::create(database_path).map_err(|error| {
        CoreError::io(format!("failed to create {}: {error}", database_path.display()))
    })?;
    io::copy(&mut entry, &mut output).map_err(|error| {
        CoreError::io(format!("failed to write {}: {error}", database_path.display()))
    })?;
    output.sync_all().map_err(|error| {
        CoreError::io(format!("failed to sync {}: {error}", database_path.display()))
    })?;
    Ok(())
}

fn extract_uploads(
    archive: &mut BundleArchive,
    entries: &[UploadEntry],
    uploads_path: &Path,
) -> BackupResult<usize> {
    fs::create_dir_all(uploads_path).map_err(|error| {
        CoreError::io(format!("failed to create {}: {error}", uploads_path.display()))
    })?;
    clear_dir(uploads_path).map_err(|error| {
        CoreError::io(format!("failed to clear {}: {error}", uploads_path.display()))
    })?;

    let mut restored = 0;
    for upload in entries {
        let target = uploads_path.join(&upload.relative);
        if upload.is_dir {
            fs::create_dir_all(&target).map_err(|error| {
                CoreError::io(format!("failed to create {}: {error}", target.display()))
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                CoreError::io(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        let mut entry = archive.by_index(upload.index).map_err(|error| {
            CoreError::io(format!("failed to open upload entry: {error}"))
        })?;
        let mut output = File::create(&target).map_err(|error| {
            CoreError::io(format!("failed to create {}: {error}", target.display()))
        })?;
        io::copy(&mut entry, &mut output).map_err(|error| {
            CoreError::io(format!("failed to write {}: {error}", target.display()))
        })?;
        restored += 1;
    }
    Ok(restored)
}

fn import_failure(error: CoreError) -> CoreError {
    warn!(
        error = %error.message,
        "backup import failed; pre-import copies are left in place"
    );
    CoreError::io(format!("Import failed: {}", error.message))
}
