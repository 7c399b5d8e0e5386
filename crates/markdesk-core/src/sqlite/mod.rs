pub mod migrations;
pub mod store;

pub use migrations::{
    SqliteMigration, current_schema_version, migration, migrations, schema_version_tag,
};
pub use store::{SqliteStore, initialize_schema};
