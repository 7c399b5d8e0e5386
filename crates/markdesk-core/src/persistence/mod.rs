use crate::models::CoreError;

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Domain tables whose row counts are reported in backup statistics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CountedTable {
    MarkingSchemes,
    Submissions,
    GradingJobs,
}

impl CountedTable {
    pub const ALL: [CountedTable; 3] = [
        CountedTable::MarkingSchemes,
        CountedTable::Submissions,
        CountedTable::GradingJobs,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            CountedTable::MarkingSchemes => "marking_schemes",
            CountedTable::Submissions => "submissions",
            CountedTable::GradingJobs => "grading_jobs",
        }
    }
}

pub trait RecordCountStore: Send + Sync {
    fn count_records(&self, table: CountedTable) -> PersistenceResult<u64>;
}
