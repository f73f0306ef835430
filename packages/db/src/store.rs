//! [`JobStore`] over the SurrealDB repositories.

use netschedule_core::{DeletedVectors, Job, JobId, JobStore, QueueParams, StoreError, StoreFuture};

use crate::repositories::{JobRepository, QueueRepository};

/// Job store persisted through the global SurrealDB connection.
///
/// [`crate::init`] must have completed before any method is awaited.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrealJobStore;

impl SurrealJobStore {
    pub fn new() -> Self {
        Self
    }
}

impl JobStore for SurrealJobStore {
    fn next_id<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, JobId> {
        Box::pin(async move { JobRepository::next_id(queue).await.map_err(StoreError::from) })
    }

    fn save_job<'a>(&'a self, queue: &'a str, job: &'a Job) -> StoreFuture<'a, ()> {
        Box::pin(async move { JobRepository::save(queue, job).await.map_err(StoreError::from) })
    }

    fn load_jobs<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Vec<Job>> {
        Box::pin(async move { JobRepository::load(queue).await.map_err(StoreError::from) })
    }

    fn erase<'a>(&'a self, queue: &'a str, id: JobId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            JobRepository::mark_erased(queue, id)
                .await
                .map_err(StoreError::from)
        })
    }

    fn delete_batch<'a>(&'a self, queue: &'a str, max: usize) -> StoreFuture<'a, Vec<JobId>> {
        Box::pin(async move {
            JobRepository::delete_erased(queue, max)
                .await
                .map_err(StoreError::from)
        })
    }

    fn flush_deleted_vectors<'a>(
        &'a self,
        queue: &'a str,
        vectors: &'a DeletedVectors,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            QueueRepository::save_deleted(queue, vectors)
                .await
                .map_err(StoreError::from)
        })
    }

    fn load_deleted_vectors<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, DeletedVectors> {
        Box::pin(async move {
            QueueRepository::load_deleted(queue)
                .await
                .map_err(StoreError::from)
        })
    }

    fn load_params<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Option<QueueParams>> {
        Box::pin(async move {
            QueueRepository::load_params(queue)
                .await
                .map_err(StoreError::from)
        })
    }

    fn save_params<'a>(&'a self, queue: &'a str, params: &'a QueueParams) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            QueueRepository::save_params(queue, params)
                .await
                .map_err(StoreError::from)
        })
    }
}
