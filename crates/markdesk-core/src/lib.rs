pub mod backup;
pub mod config;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod scheduler;
pub mod sqlite;
