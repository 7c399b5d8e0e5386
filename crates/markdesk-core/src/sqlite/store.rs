use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::models::{CoreError, CoreErrorKind};
use crate::persistence::{CountedTable, MigrationStore, PersistenceResult, RecordCountStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "markdesk_schema_migrations";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Grading database handle. Every operation opens its own connection.
pub struct SqliteStore {
    database_path: PathBuf,
    access: AccessMode,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            access: AccessMode::ReadWrite,
        }
    }

    /// Opens connections with `SQLITE_OPEN_READ_ONLY`; the database file is
    /// never created or modified.
    pub fn read_only(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            access: AccessMode::ReadOnly,
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path, self.access)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    fn require_writable(&self, operation_name: &str) -> PersistenceResult<()> {
        if self.access == AccessMode::ReadOnly {
            return Err(storage_error_text(
                operation_name,
                "store was opened read-only",
            ));
        }
        Ok(())
    }
}

/// Creates or upgrades the grading tables in the database at `database_path`
/// and returns the resulting schema version.
pub fn initialize_schema(database_path: impl Into<PathBuf>) -> PersistenceResult<i64> {
    let store = SqliteStore::new(database_path);
    let from_version = store.current_version()?;
    for pending in store.planned_migrations(from_version) {
        info!(
            database = %store.database_path().display(),
            version = pending.version,
            name = pending.name,
            "applying schema migration"
        );
    }
    store.migrate_to_latest()?;
    store.current_version()
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        if self.access == AccessMode::ReadOnly {
            return self.with_connection("current_version", |connection| {
                if !migrations_table_exists(connection)? {
                    return Ok(0);
                }
                read_current_version(connection)
            });
        }
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        self.require_writable("apply_migration")?;
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is idempotent; re-running it repairs tables dropped
                // behind the migration table's back.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl RecordCountStore for SqliteStore {
    fn count_records(&self, table: CountedTable) -> PersistenceResult<u64> {
        self.with_connection("count_records", |connection| {
            let count: i64 = connection.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.table_name()),
                [],
                |row| row.get(0),
            )?;
            u64::try_from(count).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Integer,
                    Box::new(error),
                )
            })
        })
    }
}

fn open_connection(database_path: &Path, access: AccessMode) -> rusqlite::Result<Connection> {
    match access {
        AccessMode::ReadOnly => {
            Connection::open_with_flags(database_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        }
        AccessMode::ReadWrite => {
            if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
            }
            Connection::open(database_path)
        }
    }
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn migrations_table_exists(connection: &Connection) -> rusqlite::Result<bool> {
    let found: i64 = connection.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [MIGRATIONS_TABLE],
        |row| row.get(0),
    )?;
    Ok(found > 0)
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
