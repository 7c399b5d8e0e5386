#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_grading_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS marking_schemes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    content TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scheme_id INTEGER REFERENCES marking_schemes (id) ON DELETE SET NULL,
    student_name TEXT,
    file_path TEXT,
    status TEXT NOT NULL DEFAULT 'uploaded',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS grading_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    scheme_id INTEGER REFERENCES marking_schemes (id) ON DELETE SET NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS grading_jobs;
DROP TABLE IF EXISTS submissions;
DROP TABLE IF EXISTS marking_schemes;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "grading_lookup_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_submissions_scheme
    ON submissions (scheme_id);

CREATE INDEX IF NOT EXISTS idx_grading_jobs_status
    ON grading_jobs (status, created_at DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_grading_jobs_status;
DROP INDEX IF EXISTS idx_submissions_scheme;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

/// Schema tag stamped into backup metadata.
pub fn schema_version_tag() -> String {
    current_schema_version().to_string()
}
