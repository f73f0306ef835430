#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use chrono::Utc;
use netschedule_core::{
    DeletedVectors, Job, JobId, JobSpec, JobStatus, JobStore, QueueParams, WorkerId,
};

use db::SurrealJobStore;
use db::repositories::{JobRepository, QueueRepository};

fn job(queue: &str, id: u32) -> Job {
    Job::new(
        JobId(id),
        queue,
        JobSpec::new(format!("payload-{id}")).with_affinity("gpu"),
        Utc::now(),
    )
}

#[test]
fn test_job_repository() -> Result<(), Box<dyn Error>> {
    common::block_on(job_repository())
}

async fn job_repository() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    // Counters are per queue and strictly increasing.
    assert_eq!(JobRepository::next_id("alpha").await?, JobId(1));
    assert_eq!(JobRepository::next_id("alpha").await?, JobId(2));
    assert_eq!(JobRepository::next_id("beta").await?, JobId(1));

    for id in 1..=3 {
        JobRepository::save("alpha", &job("alpha", id)).await?;
    }
    JobRepository::save("beta", &job("beta", 1)).await?;

    // Saving again overwrites the record.
    let mut running = job("alpha", 2);
    running.status = JobStatus::Running;
    running.owner = Some(WorkerId::new("worker-1"));
    JobRepository::save("alpha", &running).await?;

    let loaded = JobRepository::load("alpha").await?;
    assert_eq!(loaded.len(), 3);
    assert_eq!(
        loaded.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![JobId(1), JobId(2), JobId(3)]
    );
    assert_eq!(loaded[1].status, JobStatus::Running);
    assert_eq!(loaded[1].owner, Some(WorkerId::new("worker-1")));
    assert_eq!(loaded[0].affinity.as_deref(), Some("gpu"));

    // Erased records disappear from loads but stay until deleted.
    JobRepository::mark_erased("alpha", JobId(1)).await?;
    JobRepository::mark_erased("alpha", JobId(3)).await?;
    let loaded = JobRepository::load("alpha").await?;
    assert_eq!(loaded.iter().map(|j| j.id).collect::<Vec<_>>(), vec![JobId(2)]);

    assert_eq!(JobRepository::delete_erased("alpha", 1).await?, vec![JobId(1)]);
    assert_eq!(JobRepository::delete_erased("alpha", 10).await?, vec![JobId(3)]);
    assert!(JobRepository::delete_erased("alpha", 10).await?.is_empty());

    // Other queues are untouched.
    assert_eq!(JobRepository::load("beta").await?.len(), 1);

    Ok(())
}

#[test]
fn test_queue_repository() -> Result<(), Box<dyn Error>> {
    common::block_on(queue_repository())
}

async fn queue_repository() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    assert_eq!(QueueRepository::load_params("gamma").await?, None);
    assert!(QueueRepository::load_deleted("gamma").await?.is_empty());

    let params = QueueParams {
        failed_retries: 5,
        ..Default::default()
    };
    QueueRepository::save_params("gamma", &params).await?;

    let mut vectors = DeletedVectors::default();
    vectors.to_delete.insert(JobId(4));
    vectors.deleted.insert(JobId(2));
    QueueRepository::save_deleted("gamma", &vectors).await?;

    // Writing one part keeps the other.
    assert_eq!(QueueRepository::load_params("gamma").await?, Some(params));
    assert_eq!(QueueRepository::load_deleted("gamma").await?, vectors);

    Ok(())
}

#[test]
fn test_surreal_job_store() -> Result<(), Box<dyn Error>> {
    common::block_on(surreal_job_store())
}

async fn surreal_job_store() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;
    let store = SurrealJobStore::new();

    let id = store.next_id("delta").await?;
    let record = job("delta", id.0);
    store.save_job("delta", &record).await?;
    assert_eq!(store.load_jobs("delta").await?, vec![record]);

    store.erase("delta", id).await?;
    assert!(store.load_jobs("delta").await?.is_empty());
    assert_eq!(store.delete_batch("delta", 5).await?, vec![id]);

    Ok(())
}
