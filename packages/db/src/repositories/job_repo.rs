//! Job record repository.

use netschedule_core::{Job, JobId};
use serde::{Deserialize, Serialize};

use crate::{DbError, get_db};

/// Repository for job record persistence.
pub struct JobRepository;

/// Stored job row.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    queue: String,
    job_id: u32,
    #[serde(default)]
    erased: bool,
    job: Job,
}

#[derive(Debug, Deserialize)]
struct JobIdRow {
    job_id: u32,
}

#[derive(Debug, Deserialize)]
struct CounterRow {
    value: u32,
}

fn record_key(queue: &str, id: JobId) -> String {
    format!("{}/{}", queue, id)
}

impl JobRepository {
    /// Allocate the next id of `queue` from its counter record.
    pub async fn next_id(queue: &str) -> Result<JobId, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                UPSERT type::thing('ns_counter', $queue)
                SET value = (value OR 0) + 1
                RETURN AFTER
                "#,
            )
            .bind(("queue", queue.to_string()))
            .await?;

        let rows: Vec<CounterRow> = result.take(0)?;
        rows.first()
            .map(|row| JobId(row.value))
            .ok_or_else(|| DbError::Query(format!("counter for {} not updated", queue)))
    }

    /// Insert or overwrite a job record.
    pub async fn save(queue: &str, job: &Job) -> Result<(), DbError> {
        let db = get_db()?;

        let row = JobRow {
            queue: queue.to_string(),
            job_id: job.id.0,
            erased: false,
            job: job.clone(),
        };

        let _: Option<JobRow> = db
            .upsert(("ns_job", record_key(queue, job.id)))
            .content(row)
            .await?;

        Ok(())
    }

    /// Load every job of `queue` that has not been erased.
    pub async fn load(queue: &str) -> Result<Vec<Job>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM ns_job
                WHERE queue = $queue AND erased = false
                ORDER BY job_id ASC
                "#,
            )
            .bind(("queue", queue.to_string()))
            .await?;

        let rows: Vec<JobRow> = result.take(0)?;

        Ok(rows.into_iter().map(|r| r.job).collect())
    }

    /// Flag a job record as erased.
    pub async fn mark_erased(queue: &str, id: JobId) -> Result<(), DbError> {
        let db = get_db()?;

        db.query("UPDATE type::thing('ns_job', $key) SET erased = true")
            .bind(("key", record_key(queue, id)))
            .await?
            .check()?;

        Ok(())
    }

    /// Physically delete up to `max` erased records of `queue`.
    pub async fn delete_erased(queue: &str, max: usize) -> Result<Vec<JobId>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT job_id FROM ns_job
                WHERE queue = $queue AND erased = true
                ORDER BY job_id ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue", queue.to_string()))
            .bind(("limit", max.min(i64::MAX as usize) as i64))
            .await?;

        let rows: Vec<JobIdRow> = result.take(0)?;
        let ids: Vec<u32> = rows.into_iter().map(|r| r.job_id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        db.query("DELETE ns_job WHERE queue = $queue AND erased = true AND job_id INSIDE $ids")
            .bind(("queue", queue.to_string()))
            .bind(("ids", ids.clone()))
            .await?
            .check()?;

        tracing::debug!(queue, deleted = ids.len(), "Deleted erased job records");

        Ok(ids.into_iter().map(JobId).collect())
    }
}
