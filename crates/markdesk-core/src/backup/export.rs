use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::backup::files::{TreeFile, tree_files};
use crate::backup::{BACKUP_VERSION, BackupResult, DATABASE_ENTRY, METADATA_ENTRY, UPLOADS_PREFIX};
use crate::models::{BackupIncludes, BackupMetadata, BackupStatistics, CoreError, RecordCounts};
use crate::persistence::{CountedTable, RecordCountStore};
use crate::sqlite::{SqliteStore, schema_version_tag};

/// Writes a backup bundle of the database and uploads tree to `output_path`.
///
/// The database must exist; a missing uploads directory is created empty.
/// On failure no file is left at `output_path`.
pub fn export_backup(
    database_path: &Path,
    uploads_path: &Path,
    output_path: &Path,
    app_version: &str,
) -> BackupResult<BackupMetadata> {
    if !database_path.is_file() {
        return Err(CoreError::not_found(format!(
            "Database file not found: {}",
            database_path.display()
        )));
    }
    fs::create_dir_all(uploads_path).map_err(|error| {
        CoreError::io(format!(
            "failed to create uploads directory {}: {error}",
            uploads_path.display()
        ))
    })?;

    let uploads = tree_files(uploads_path)?;
    let metadata = collect_metadata(database_path, &uploads, app_version)?;

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| {
            CoreError::io(format!(
                "failed to create backup directory {}: {error}",
                parent.display()
            ))
        })?;
    }

    let partial_path = partial_output_path(output_path);
    let written = write_bundle(&partial_path, database_path, &uploads, &metadata)
        .and_then(|()| {
            fs::rename(&partial_path, output_path).map_err(|error| {
                CoreError::io(format!(
                    "failed to move backup into place at {}: {error}",
                    output_path.display()
                ))
            })
        });
    if let Err(error) = written {
        discard_partial(&partial_path);
        tracing::error!(
            output = %output_path.display(),
            error = %error,
            "backup export failed"
        );
        return Err(error);
    }

    info!(
        output = %output_path.display(),
        uploads = uploads.len(),
        total_size_bytes = metadata.statistics.total_size_bytes,
        "backup created"
    );
    Ok(metadata)
}

fn collect_metadata(
    database_path: &Path,
    uploads: &[TreeFile],
    app_version: &str,
) -> BackupResult<BackupMetadata> {
    let database_size = fs::metadata(database_path)
        .map_err(|error| {
            CoreError::io(format!(
                "failed to stat database {}: {error}",
                database_path.display()
            ))
        })?
        .len();
    let uploads_size = uploads.iter().map(|file| file.size).sum();

    Ok(BackupMetadata {
        backup_version: BACKUP_VERSION.to_string(),
        created_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        app_version: app_version.to_string(),
        platform: std::env::consts::OS.to_string(),
        hostname: hostname(),
        database_schema_version: schema_version_tag(),
        includes: BackupIncludes::standard(),
        statistics: BackupStatistics::new(
            record_counts(database_path),
            database_size,
            uploads_size,
        ),
    })
}

/// Row counts for the statistics block. A table that cannot be read counts
/// as zero.
fn record_counts(database_path: &Path) -> RecordCounts {
    let store = SqliteStore::read_only(database_path);
    let count = |table: CountedTable| match store.count_records(table) {
        Ok(count) => count,
        Err(error) => {
            warn!(
                table = table.table_name(),
                database = %database_path.display(),
                error = %error,
                "could not count records for backup statistics"
            );
            0
        }
    };

    RecordCounts {
        schemes: count(CountedTable::MarkingSchemes),
        submissions: count(CountedTable::Submissions),
        jobs: count(CountedTable::GradingJobs),
    }
}

fn write_bundle(
    archive_path: &Path,
    database_path: &Path,
    uploads: &[TreeFile],
    metadata: &BackupMetadata,
) -> BackupResult<()> {
    let file = File::create(archive_path).map_err(|error| {
        CoreError::io(format!(
            "failed to create archive {}: {error}",
            archive_path.display()
        ))
    })?;
    let mut archive = ZipWriter::new(BufWriter::new(file));

    append_file(&mut archive, DATABASE_ENTRY, database_path)?;
    for upload in uploads {
        append_file(
            &mut archive,
            &format!("{UPLOADS_PREFIX}{}", upload.relative),
            &upload.absolute,
        )?;
    }

    // Metadata goes last so a truncated archive is missing it.
    let document = serde_json::to_vec_pretty(metadata).map_err(|error| {
        CoreError::internal(format!("failed to encode backup metadata: {error}"))
    })?;
    archive
        .start_file(METADATA_ENTRY, entry_options())
        .map_err(|error| archive_error(METADATA_ENTRY, error))?;
    archive
        .write_all(&document)
        .map_err(|error| archive_error(METADATA_ENTRY, error))?;

    let mut writer = archive
        .finish()
        .map_err(|error| archive_error("central directory", error))?;
    writer
        .flush()
        .map_err(|error| archive_error("central directory", error))?;
    Ok(())
}

fn append_file<W: Write + io::Seek>(
    archive: &mut ZipWriter<W>,
    entry_name: &str,
    source: &Path,
) -> BackupResult<()> {
    let mut input = File::open(source).map_err(|error| {
        CoreError::io(format!("failed to open {}: {error}", source.display()))
    })?;
    archive
        .start_file(entry_name, entry_options())
        .map_err(|error| archive_error(entry_name, error))?;
    let copied =
        io::copy(&mut input, archive).map_err(|error| archive_error(entry_name, error))?;
    debug!(entry = entry_name, bytes = copied, "archived file");
    Ok(())
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true)
}

fn archive_error(entry_name: &str, error: impl std::fmt::Display) -> CoreError {
    CoreError::io(format!("failed to write archive entry '{entry_name}': {error}"))
}

fn partial_output_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    output_path.with_file_name(name)
}

fn discard_partial(partial_path: &Path) {
    match fs::remove_file(partial_path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            warn!(
                path = %partial_path.display(),
                error = %error,
                "failed to remove partial backup"
            );
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: the pointer and length describe a writable buffer we own.
    let status = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if status != 0 {
        return hostname_from_env();
    }
    let end = buffer
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(buffer.len());
    let name = String::from_utf8_lossy(&buffer[..end]).into_owned();
    if name.is_empty() {
        hostname_from_env()
    } else {
        name
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    hostname_from_env()
}

fn hostname_from_env() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
