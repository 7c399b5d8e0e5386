use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use markdesk_core::backup::{
    BACKUP_VERSION, DATABASE_ENTRY, METADATA_ENTRY, export_backup, import_backup,
    read_bundle_metadata, validate_bundle,
};
use markdesk_core::models::{BackupIncludes, BackupMetadata, CoreErrorKind};
use markdesk_core::sqlite::{initialize_schema, schema_version_tag};
use rusqlite::Connection;

fn test_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("markdesk-{test_name}-{nanos}"));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn seeded_database(dir: &Path) -> PathBuf {
    let path = dir.join("markdesk.db");
    initialize_schema(&path).unwrap();
    let connection = Connection::open(&path).unwrap();
    connection
        .execute_batch(
            "
INSERT INTO marking_schemes (name, content) VALUES ('Essay rubric', '{\"criteria\": 4}');
INSERT INTO submissions (scheme_id, student_name, file_path)
    VALUES (1, 'Ada', 'submission1/document.txt');
INSERT INTO grading_jobs (name, scheme_id) VALUES ('Week 3 essays', 1);
",
        )
        .unwrap();
    path
}

fn seeded_uploads(dir: &Path) -> PathBuf {
    let uploads = dir.join("uploads");
    fs::create_dir_all(uploads.join("submission1")).unwrap();
    fs::create_dir_all(uploads.join("submission2")).unwrap();
    fs::write(
        uploads.join("submission1").join("document.txt"),
        "The mitochondria is the powerhouse of the cell.",
    )
    .unwrap();
    fs::write(
        uploads.join("submission2").join("essay.txt"),
        "An essay about the causes of the First World War.",
    )
    .unwrap();
    uploads
}

fn entry_names(bundle: &Path) -> BTreeSet<String> {
    let archive = zip::ZipArchive::new(File::open(bundle).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

#[test]
fn export_records_statistics_and_entries() {
    let dir = test_dir("export-scenario");
    let database = seeded_database(&dir);
    let uploads = seeded_uploads(&dir);
    let bundle = dir.join("out").join("backup.zip");

    let metadata = export_backup(&database, &uploads, &bundle, "2.4.0").unwrap();

    assert_eq!(metadata.statistics.num_schemes, 1);
    assert_eq!(metadata.statistics.num_submissions, 1);
    assert_eq!(metadata.statistics.num_jobs, 1);
    assert_eq!(
        metadata.statistics.database_size_bytes,
        fs::metadata(&database).unwrap().len()
    );
    assert_eq!(metadata.statistics.uploads_size_bytes, 47 + 49);
    assert_eq!(
        metadata.statistics.total_size_bytes,
        metadata.statistics.database_size_bytes + metadata.statistics.uploads_size_bytes
    );
    assert_eq!(metadata.backup_version, BACKUP_VERSION);
    assert_eq!(metadata.app_version, "2.4.0");
    assert_eq!(metadata.platform, std::env::consts::OS);
    assert_eq!(metadata.database_schema_version, schema_version_tag());
    assert_eq!(metadata.includes, BackupIncludes::standard());
    assert!(metadata.created_at.ends_with('Z'));
    assert!(!metadata.hostname.is_empty());

    let expected: BTreeSet<String> = [
        DATABASE_ENTRY,
        METADATA_ENTRY,
        "uploads/submission1/document.txt",
        "uploads/submission2/essay.txt",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    assert_eq!(entry_names(&bundle), expected);

    assert_eq!(read_bundle_metadata(&bundle).unwrap(), metadata);
    assert!(validate_bundle(&bundle).is_valid);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn metadata_document_uses_the_wire_field_names() {
    let dir = test_dir("export-wire");
    let database = seeded_database(&dir);
    let bundle = dir.join("backup.zip");
    export_backup(&database, &dir.join("uploads"), &bundle, "2.4.0").unwrap();

    let mut archive = zip::ZipArchive::new(File::open(&bundle).unwrap()).unwrap();
    let document: serde_json::Value =
        serde_json::from_reader(archive.by_name(METADATA_ENTRY).unwrap()).unwrap();

    assert_eq!(document["backup_version"], "1.0");
    assert_eq!(document["includes"]["credentials"], false);
    assert_eq!(document["includes"]["settings"], false);
    assert_eq!(document["statistics"]["num_jobs"], 1);
    for field in ["created_at", "app_version", "platform", "hostname", "database_schema_version"] {
        assert!(document[field].is_string(), "{field} must be a string");
    }
    let round_tripped: BackupMetadata = serde_json::from_value(document).unwrap();
    assert_eq!(round_tripped.statistics.num_schemes, 1);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn import_of_export_restores_identical_bytes() {
    let source = test_dir("round-trip-source");
    let database = seeded_database(&source);
    let uploads = seeded_uploads(&source);
    let bundle = source.join("backup.zip");
    export_backup(&database, &uploads, &bundle, "2.4.0").unwrap();

    let target = test_dir("round-trip-target");
    let restored_database = target.join("data").join("markdesk.db");
    let restored_uploads = target.join("data").join("uploads");
    let report = import_backup(&bundle, &restored_database, &restored_uploads, true).unwrap();

    assert_eq!(report.restored_uploads, 2);
    assert!(report.pre_import_database.is_none());
    assert!(report.pre_import_uploads.is_none());
    assert_eq!(
        fs::read(&restored_database).unwrap(),
        fs::read(&database).unwrap()
    );
    for relative in ["submission1/document.txt", "submission2/essay.txt"] {
        assert_eq!(
            fs::read(restored_uploads.join(relative)).unwrap(),
            fs::read(uploads.join(relative)).unwrap(),
            "{relative} differs after restore"
        );
    }

    let connection = Connection::open(&restored_database).unwrap();
    let jobs: i64 = connection
        .query_row("SELECT COUNT(*) FROM grading_jobs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(jobs, 1);

    let _ = fs::remove_dir_all(source);
    let _ = fs::remove_dir_all(target);
}

#[test]
fn missing_uploads_directory_is_created_empty() {
    let dir = test_dir("export-no-uploads");
    let database = seeded_database(&dir);
    let uploads = dir.join("never-created");
    let bundle = dir.join("backup.zip");

    let metadata = export_backup(&database, &uploads, &bundle, "2.4.0").unwrap();

    assert!(uploads.is_dir());
    assert_eq!(metadata.statistics.uploads_size_bytes, 0);
    assert_eq!(
        metadata.statistics.total_size_bytes,
        metadata.statistics.database_size_bytes
    );
    assert_eq!(entry_names(&bundle).len(), 2);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_database_is_not_found_and_writes_nothing() {
    let dir = test_dir("export-missing-db");
    let bundle = dir.join("backup.zip");

    let error = export_backup(
        &dir.join("absent.db"),
        &dir.join("uploads"),
        &bundle,
        "2.4.0",
    )
    .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::NotFound);
    assert!(error.message.starts_with("Database file not found"));
    assert!(!bundle.exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn database_without_grading_tables_counts_zero() {
    let dir = test_dir("export-foreign-db");
    let database = dir.join("other.db");
    Connection::open(&database)
        .unwrap()
        .execute_batch("CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('hi');")
        .unwrap();
    let bundle = dir.join("backup.zip");

    let metadata = export_backup(&database, &dir.join("uploads"), &bundle, "2.4.0").unwrap();

    assert_eq!(metadata.statistics.num_schemes, 0);
    assert_eq!(metadata.statistics.num_submissions, 0);
    assert_eq!(metadata.statistics.num_jobs, 0);
    assert!(validate_bundle(&bundle).is_valid);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn failed_export_leaves_no_partial_bundle() {
    let dir = test_dir("export-failure");
    let database = seeded_database(&dir);
    // A non-empty directory at the output path makes the final rename fail.
    let bundle = dir.join("taken.zip");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("keep.txt"), "occupied").unwrap();

    let error = export_backup(&database, &dir.join("uploads"), &bundle, "2.4.0").unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::Io);
    assert!(!dir.join("taken.zip.partial").exists());
    assert!(bundle.join("keep.txt").exists());

    let _ = fs::remove_dir_all(dir);
}
