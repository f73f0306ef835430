//! Persistence collaborator consumed by queues.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::{Job, JobId};
use crate::queue::QueueParams;

/// Future type returned by [`JobStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Ids on their way out of a queue.
///
/// `to_delete` holds jobs marked for erase but still linked in memory;
/// `deleted` holds jobs already unlinked but not yet physically removed
/// from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletedVectors {
    pub to_delete: BTreeSet<JobId>,
    pub deleted: BTreeSet<JobId>,
}

impl DeletedVectors {
    /// Whether `id` must be treated as gone.
    pub fn contains(&self, id: JobId) -> bool {
        self.to_delete.contains(&id) || self.deleted.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.deleted.is_empty()
    }
}

/// Backing store for job records and queue parameters.
///
/// Queues keep their authoritative state in memory; the store only has to
/// survive restarts.
pub trait JobStore: Send + Sync + 'static {
    /// Allocate the next job id of `queue`.
    fn next_id<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, JobId>;

    /// Insert or overwrite a job record.
    fn save_job<'a>(&'a self, queue: &'a str, job: &'a Job) -> StoreFuture<'a, ()>;

    /// All job records that have not been erased, ordered by id.
    fn load_jobs<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Vec<Job>>;

    /// Logically erase one job record.
    fn erase<'a>(&'a self, queue: &'a str, id: JobId) -> StoreFuture<'a, ()>;

    /// Physically remove up to `max` erased records, returning their ids.
    fn delete_batch<'a>(&'a self, queue: &'a str, max: usize) -> StoreFuture<'a, Vec<JobId>>;

    /// Persist the deletion bookkeeping of `queue`.
    fn flush_deleted_vectors<'a>(
        &'a self,
        queue: &'a str,
        vectors: &'a DeletedVectors,
    ) -> StoreFuture<'a, ()>;

    fn load_deleted_vectors<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, DeletedVectors>;

    fn load_params<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Option<QueueParams>>;

    fn save_params<'a>(&'a self, queue: &'a str, params: &'a QueueParams) -> StoreFuture<'a, ()>;
}
