//! Queue parameter and deletion bookkeeping repository.

use netschedule_core::{DeletedVectors, QueueParams};
use serde::{Deserialize, Serialize};

use crate::{DbError, get_db};

/// Repository for per-queue records.
pub struct QueueRepository;

/// Stored queue row; both parts are written independently.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueRow {
    #[serde(default)]
    params: Option<QueueParams>,
    #[serde(default)]
    deleted: DeletedVectors,
}

impl QueueRepository {
    async fn row(queue: &str) -> Result<Option<QueueRow>, DbError> {
        let db = get_db()?;
        let row: Option<QueueRow> = db.select(("ns_queue", queue.to_string())).await?;
        Ok(row)
    }

    /// Load stored parameters of `queue`.
    pub async fn load_params(queue: &str) -> Result<Option<QueueParams>, DbError> {
        Ok(Self::row(queue).await?.and_then(|row| row.params))
    }

    /// Store parameters of `queue`.
    pub async fn save_params(queue: &str, params: &QueueParams) -> Result<(), DbError> {
        let db = get_db()?;
        let value = serde_json::to_value(params)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let _: Option<QueueRow> = db
            .upsert(("ns_queue", queue.to_string()))
            .merge(serde_json::json!({ "params": value }))
            .await?;

        Ok(())
    }

    /// Load the deletion bookkeeping of `queue`.
    pub async fn load_deleted(queue: &str) -> Result<DeletedVectors, DbError> {
        Ok(Self::row(queue)
            .await?
            .map(|row| row.deleted)
            .unwrap_or_default())
    }

    /// Store the deletion bookkeeping of `queue`.
    pub async fn save_deleted(queue: &str, vectors: &DeletedVectors) -> Result<(), DbError> {
        let db = get_db()?;
        let value = serde_json::to_value(vectors)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let _: Option<QueueRow> = db
            .upsert(("ns_queue", queue.to_string()))
            .merge(serde_json::json!({ "deleted": value }))
            .await?;

        Ok(())
    }
}
