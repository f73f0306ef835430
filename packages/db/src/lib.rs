//! Persistence for the job queue server.
//!
//! Provides the SurrealDB connection and repositories, plus two
//! [`netschedule_core::JobStore`] implementations: [`SurrealJobStore`]
//! over the database and [`MemoryJobStore`] for tests.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Credentials, Database, DbConfig, DbError, get_db, init_db};
pub use memory::MemoryJobStore;
pub use schema::init_schema;
pub use store::SurrealJobStore;

/// Initialize the database with the given configuration.
///
/// This should be called once at application startup.
pub async fn init(config: DbConfig) -> Result<(), DbError> {
    init_db(config).await?;
    init_schema().await?;
    Ok(())
}
