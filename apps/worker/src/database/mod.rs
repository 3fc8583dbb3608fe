/// Database abstraction layer
///
/// Domains and their checks are read through [`ConfigStore`]; probe runs,
/// incidents and outbox rows are written through [`ResultStore`]. Both are
/// implemented by [`DatabaseImpl`] over a pooled libsql connection.
pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{ConfigStore, DatabaseImpl, ResultStore};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
