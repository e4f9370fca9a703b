//! SQLite adapter: connection pooling, embedded migrations, and the
//! `Store` port implementation (`spec.md` §4.3, §6 persisted state).

pub mod connection;
pub mod migrations;
mod store_impl;

use sqlx::SqlitePool;
use thiserror::Error;

pub use connection::{ConnectionError, PoolConfig};
pub use migrations::{Migration, MigrationError, Migrator};
pub use store_impl::SqliteStore;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Opens (creating if needed) the database at `database_url` and brings
/// its schema up to date.
pub async fn initialize_database(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let pool = connection::create_pool(database_url, None).await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(migrations::all_embedded_migrations()).await?;
    Ok(pool)
}

/// In-memory pool pre-populated with the embedded schema, for tests.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = connection::create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(migrations::all_embedded_migrations()).await?;
    Ok(pool)
}
