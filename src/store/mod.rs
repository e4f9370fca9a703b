//! Persistence adapters implementing the domain's `Store` port.

pub mod sqlite;

pub use sqlite::{create_migrated_test_pool, initialize_database, DatabaseError, SqliteStore};
