use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use markdesk_core::backup::{
    DATABASE_ENTRY, METADATA_ENTRY, SQLITE_MAGIC, read_bundle_metadata, validate_bundle,
    validate_bundle_with,
};
use markdesk_core::models::{CoreErrorKind, SizeMismatchPolicy};
use serde_json::{Value, json};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const UPLOAD: &[u8] = b"student answer sheet";

fn test_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("markdesk-{test_name}-{nanos}"));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn fake_database() -> Vec<u8> {
    let mut bytes = SQLITE_MAGIC.to_vec();
    bytes.resize(4096, 0);
    bytes
}

fn metadata_for(database: &[u8], uploads: u64) -> Value {
    json!({
        "backup_version": "1.0",
        "created_at": "2026-02-01T10:00:00.000000Z",
        "app_version": "2.4.0",
        "platform": "linux",
        "hostname": "grading-box",
        "database_schema_version": "2",
        "includes": {
            "database": true,
            "uploads": true,
            "settings": false,
            "credentials": false
        },
        "statistics": {
            "num_schemes": 1,
            "num_submissions": 1,
            "num_jobs": 0,
            "database_size_bytes": database.len(),
            "uploads_size_bytes": uploads,
            "total_size_bytes": database.len() as u64 + uploads
        }
    })
}

fn write_bundle(path: &Path, entries: Vec<(&str, Vec<u8>)>) {
    let mut archive = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        archive
            .start_file(name, SimpleFileOptions::default())
            .unwrap();
        archive.write_all(&content).unwrap();
    }
    archive.finish().unwrap();
}

fn bundle_with_metadata(dir: &Path, name: &str, metadata: &Value) -> PathBuf {
    let path = dir.join(name);
    let database = fake_database();
    let document = serde_json::to_vec(metadata).unwrap();
    write_bundle(
        &path,
        vec![
            (DATABASE_ENTRY, database),
            ("uploads/s1/answers.txt", UPLOAD.to_vec()),
            (METADATA_ENTRY, document),
        ],
    );
    path
}

fn valid_metadata() -> Value {
    metadata_for(&fake_database(), UPLOAD.len() as u64)
}

#[test]
fn well_formed_bundle_is_valid_and_validation_is_repeatable() {
    let dir = test_dir("validate-ok");
    let bundle = bundle_with_metadata(&dir, "ok.zip", &valid_metadata());

    let first = validate_bundle(&bundle);
    let second = validate_bundle(&bundle);

    assert!(first.is_valid, "{}", first.message);
    assert_eq!(first.message, "Backup is valid");
    assert_eq!(first, second);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_bundle_is_reported() {
    let dir = test_dir("validate-missing");
    let outcome = validate_bundle(&dir.join("nope.zip"));

    assert!(!outcome.is_valid);
    assert!(outcome.message.starts_with("Backup file not found"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn non_archive_is_rejected() {
    let dir = test_dir("validate-not-zip");
    let bundle = dir.join("notes.zip");
    fs::write(&bundle, "definitely not a zip archive").unwrap();

    let outcome = validate_bundle(&bundle);
    assert!(!outcome.is_valid);
    assert!(outcome.message.starts_with("Invalid backup archive"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn corrupted_entry_fails_integrity_check() {
    let dir = test_dir("validate-corrupt");
    let bundle = dir.join("corrupt.zip");
    let database = fake_database();
    let document = serde_json::to_vec(&metadata_for(&database, 0)).unwrap();
    let mut archive = ZipWriter::new(File::create(&bundle).unwrap());
    archive
        .start_file(
            DATABASE_ENTRY,
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored),
        )
        .unwrap();
    archive.write_all(&database).unwrap();
    archive
        .start_file(METADATA_ENTRY, SimpleFileOptions::default())
        .unwrap();
    archive.write_all(&document).unwrap();
    archive.finish().unwrap();

    // Flip a byte inside the stored database payload so its CRC no longer
    // matches.
    let mut bytes = fs::read(&bundle).unwrap();
    let payload_start = bytes
        .windows(SQLITE_MAGIC.len())
        .position(|window| window == SQLITE_MAGIC.as_slice())
        .unwrap();
    bytes[payload_start + 100] ^= 0xff;
    fs::write(&bundle, bytes).unwrap();

    let outcome = validate_bundle(&bundle);
    assert!(!outcome.is_valid);
    assert!(
        outcome.message.starts_with("Corrupted backup archive"),
        "{}",
        outcome.message
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_required_entries_are_named() {
    let dir = test_dir("validate-entries");
    let database = fake_database();
    let document = serde_json::to_vec(&valid_metadata()).unwrap();

    let no_database = dir.join("no-database.zip");
    write_bundle(&no_database, vec![(METADATA_ENTRY, document)]);
    assert_eq!(
        validate_bundle(&no_database).message,
        "Missing database in backup"
    );

    let no_metadata = dir.join("no-metadata.zip");
    write_bundle(&no_metadata, vec![(DATABASE_ENTRY, database)]);
    assert_eq!(
        validate_bundle(&no_metadata).message,
        "Missing metadata in backup"
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn malformed_metadata_is_rejected() {
    let dir = test_dir("validate-json");
    let bundle = dir.join("bad-json.zip");
    write_bundle(
        &bundle,
        vec![
            (DATABASE_ENTRY, fake_database()),
            (METADATA_ENTRY, b"{ this is not json".to_vec()),
        ],
    );

    let outcome = validate_bundle(&bundle);
    assert!(!outcome.is_valid);
    assert!(outcome.message.starts_with("Invalid metadata JSON"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn metadata_missing_a_required_field_is_rejected() {
    let dir = test_dir("validate-field");
    let mut metadata = valid_metadata();
    metadata.as_object_mut().unwrap().remove("platform");
    let bundle = bundle_with_metadata(&dir, "no-platform.zip", &metadata);

    assert_eq!(
        validate_bundle(&bundle).message,
        "Missing required metadata field: platform"
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn unsupported_version_is_rejected() {
    let dir = test_dir("validate-version");
    let mut metadata = valid_metadata();
    metadata["backup_version"] = json!("2.0");
    let bundle = bundle_with_metadata(&dir, "future.zip", &metadata);

    let outcome = validate_bundle(&bundle);
    assert!(!outcome.is_valid);
    assert_eq!(outcome.message, "Unsupported backup version: 2.0");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn empty_or_foreign_database_entry_is_rejected() {
    let dir = test_dir("validate-magic");
    let document = serde_json::to_vec(&metadata_for(&[], 0)).unwrap();

    let empty = dir.join("empty-db.zip");
    write_bundle(&empty, vec![(DATABASE_ENTRY, Vec::new()), (METADATA_ENTRY, document)]);
    assert_eq!(validate_bundle(&empty).message, "Database in backup is empty");

    let foreign_database = b"PK\x03\x04 pretending to be a database".to_vec();
    let document = serde_json::to_vec(&metadata_for(&foreign_database, 0)).unwrap();
    let foreign = dir.join("foreign-db.zip");
    write_bundle(
        &foreign,
        vec![(DATABASE_ENTRY, foreign_database), (METADATA_ENTRY, document)],
    );
    assert_eq!(
        validate_bundle(&foreign).message,
        "Database file is not valid SQLite format"
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn size_drift_is_a_warning_unless_policy_rejects() {
    let dir = test_dir("validate-size");
    let mut metadata = valid_metadata();
    metadata["statistics"]["database_size_bytes"] = json!(8192);
    let bundle = bundle_with_metadata(&dir, "drift.zip", &metadata);

    assert!(validate_bundle(&bundle).is_valid);

    let strict = validate_bundle_with(&bundle, SizeMismatchPolicy::Reject);
    assert!(!strict.is_valid);
    assert!(strict.message.starts_with("Database size mismatch"));

    let mut metadata = valid_metadata();
    metadata["statistics"]["uploads_size_bytes"] = json!(0);
    let bundle = bundle_with_metadata(&dir, "uploads-drift.zip", &metadata);
    assert!(validate_bundle(&bundle).is_valid);
    assert!(
        validate_bundle_with(&bundle, SizeMismatchPolicy::Reject)
            .message
            .starts_with("Uploads size mismatch")
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn drift_within_one_percent_passes_strict_validation() {
    let dir = test_dir("validate-tolerance");
    let mut metadata = valid_metadata();
    metadata["statistics"]["database_size_bytes"] = json!(4096 + 40);
    let bundle = bundle_with_metadata(&dir, "close.zip", &metadata);

    assert!(validate_bundle_with(&bundle, SizeMismatchPolicy::Reject).is_valid);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn metadata_can_be_read_without_extracting() {
    let dir = test_dir("validate-read-metadata");
    let bundle = bundle_with_metadata(&dir, "ok.zip", &valid_metadata());

    let metadata = read_bundle_metadata(&bundle).unwrap();
    assert_eq!(metadata.hostname, "grading-box");
    assert_eq!(metadata.statistics.num_schemes, 1);

    let error = read_bundle_metadata(&dir.join("missing.zip")).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    let _ = fs::remove_dir_all(dir);
}
