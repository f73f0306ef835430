//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Initialize the database schema.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?;
    db.query(QUEUE_SCHEMA).await?;
    db.query(COUNTER_SCHEMA).await?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job records, keyed `<queue>/<job id>`.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS ns_job SCHEMALESS;

DEFINE FIELD IF NOT EXISTS queue ON ns_job TYPE string;
DEFINE FIELD IF NOT EXISTS job_id ON ns_job TYPE int;
DEFINE FIELD IF NOT EXISTS erased ON ns_job TYPE bool DEFAULT false;
DEFINE FIELD IF NOT EXISTS job ON ns_job TYPE object;

DEFINE INDEX IF NOT EXISTS ns_job_queue ON ns_job FIELDS queue, job_id;
DEFINE INDEX IF NOT EXISTS ns_job_erased ON ns_job FIELDS queue, erased;
"#;

/// Per-queue parameters and deletion bookkeeping, keyed by queue name.
const QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS ns_queue SCHEMALESS;
"#;

/// Per-queue job id counters, keyed by queue name.
const COUNTER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS ns_counter SCHEMALESS;

DEFINE FIELD IF NOT EXISTS value ON ns_counter TYPE int DEFAULT 0;
"#;
