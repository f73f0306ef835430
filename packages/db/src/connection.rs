//! Process-wide SurrealDB connection.

use std::sync::LazyLock;

use netschedule_core::StoreError;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

static DB: LazyLock<OnceCell<Database>> = LazyLock::new(OnceCell::new);

pub type Database = Surreal<Any>;

/// Root user signed in after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where the job tables live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// "mem://", or "rocksdb://path" with the `rocksdb` feature.
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub credentials: Option<Credentials>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "netschedule".to_string(),
            database: "queues".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// In-memory database, mostly for tests.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn at(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Connect once; later calls return the existing connection and ignore
/// `config`.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    DB.get_or_try_init(|| async {
        tracing::info!(endpoint = %config.endpoint, "Connecting to database");
        let db = connect(config.endpoint.as_str()).await?;
        if let Some(credentials) = &config.credentials {
            db.signin(Root {
                username: &credentials.username,
                password: &credentials.password,
            })
            .await?;
        }
        db.use_ns(&config.namespace).use_db(&config.database).await?;
        tracing::info!(
            namespace = %config.namespace,
            database = %config.database,
            "Connected to database"
        );
        Ok(db)
    })
    .await
}

pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}
