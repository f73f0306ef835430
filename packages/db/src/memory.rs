//! In-process store for tests and single-node deployments without disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use netschedule_core::{
    DeletedVectors, Job, JobId, JobStore, QueueParams, StoreError, StoreFuture,
};

#[derive(Debug, Default)]
struct QueueRecords {
    last_id: u32,
    jobs: BTreeMap<JobId, Job>,
    erased: BTreeSet<JobId>,
    deleted: DeletedVectors,
    params: Option<QueueParams>,
}

/// [`JobStore`] backed by a map in memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    queues: Mutex<HashMap<String, QueueRecords>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueRecords>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueRecords) -> T) -> T {
        let mut queues = self.lock();
        f(queues.entry(queue.to_string()).or_default())
    }

    /// Ids of records still physically present, erased or not.
    pub fn stored_ids(&self, queue: &str) -> Vec<JobId> {
        self.with_queue(queue, |q| q.jobs.keys().copied().collect())
    }

    /// Ids logically erased but not yet deleted.
    pub fn erased_ids(&self, queue: &str) -> Vec<JobId> {
        self.with_queue(queue, |q| q.erased.iter().copied().collect())
    }
}

impl JobStore for MemoryJobStore {
    fn next_id<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, JobId> {
        Box::pin(async move {
            self.with_queue(queue, |q| {
                q.last_id = q.last_id.checked_add(1).ok_or_else(|| {
                    StoreError::Backend(format!("job ids of queue {queue} are exhausted"))
                })?;
                Ok(JobId(q.last_id))
            })
        })
    }

    fn save_job<'a>(&'a self, queue: &'a str, job: &'a Job) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_queue(queue, |q| {
                q.jobs.insert(job.id, job.clone());
            });
            Ok(())
        })
    }

    fn load_jobs<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Vec<Job>> {
        Box::pin(async move {
            Ok(self.with_queue(queue, |q| {
                q.jobs
                    .values()
                    .filter(|job| !q.erased.contains(&job.id))
                    .cloned()
                    .collect()
            }))
        })
    }

    fn erase<'a>(&'a self, queue: &'a str, id: JobId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_queue(queue, |q| {
                if q.jobs.contains_key(&id) {
                    q.erased.insert(id);
                }
            });
            Ok(())
        })
    }

    fn delete_batch<'a>(&'a self, queue: &'a str, max: usize) -> StoreFuture<'a, Vec<JobId>> {
        Box::pin(async move {
            Ok(self.with_queue(queue, |q| {
                let batch: Vec<JobId> = q.erased.iter().take(max).copied().collect();
                for id in &batch {
                    q.erased.remove(id);
                    q.jobs.remove(id);
                }
                batch
            }))
        })
    }

    fn flush_deleted_vectors<'a>(
        &'a self,
        queue: &'a str,
        vectors: &'a DeletedVectors,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_queue(queue, |q| q.deleted = vectors.clone());
            Ok(())
        })
    }

    fn load_deleted_vectors<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, DeletedVectors> {
        Box::pin(async move { Ok(self.with_queue(queue, |q| q.deleted.clone())) })
    }

    fn load_params<'a>(&'a self, queue: &'a str) -> StoreFuture<'a, Option<QueueParams>> {
        Box::pin(async move { Ok(self.with_queue(queue, |q| q.params.clone())) })
    }

    fn save_params<'a>(&'a self, queue: &'a str, params: &'a QueueParams) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_queue(queue, |q| q.params = Some(params.clone()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use netschedule_core::JobSpec;

    use super::*;

    fn job(id: u32) -> Job {
        Job::new(JobId(id), "q", JobSpec::new(format!("input-{id}")), Utc::now())
    }

    #[tokio::test]
    async fn ids_are_monotonic_per_queue() {
        let store = MemoryJobStore::new();
        assert_eq!(store.next_id("a").await.unwrap(), JobId(1));
        assert_eq!(store.next_id("a").await.unwrap(), JobId(2));
        assert_eq!(store.next_id("b").await.unwrap(), JobId(1));
    }

    #[tokio::test]
    async fn exhausted_id_space_is_an_error() {
        let store = MemoryJobStore::new();
        store.with_queue("a", |q| q.last_id = u32::MAX - 1);
        assert_eq!(store.next_id("a").await.unwrap(), JobId(u32::MAX));
        assert!(matches!(
            store.next_id("a").await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.next_id("b").await.unwrap(), JobId(1));
    }

    #[tokio::test]
    async fn erase_hides_and_delete_batch_removes() {
        let store = MemoryJobStore::new();
        for id in 1..=4 {
            store.save_job("q", &job(id)).await.unwrap();
        }
        store.erase("q", JobId(2)).await.unwrap();
        store.erase("q", JobId(3)).await.unwrap();
        store.erase("q", JobId(99)).await.unwrap();

        let visible: Vec<JobId> = store
            .load_jobs("q")
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(visible, vec![JobId(1), JobId(4)]);

        assert_eq!(store.delete_batch("q", 1).await.unwrap(), vec![JobId(2)]);
        assert_eq!(store.stored_ids("q"), vec![JobId(1), JobId(3), JobId(4)]);
        assert_eq!(store.delete_batch("q", 10).await.unwrap(), vec![JobId(3)]);
        assert!(store.erased_ids("q").is_empty());
    }

    #[tokio::test]
    async fn params_and_vectors_are_kept() {
        let store = MemoryJobStore::new();
        assert_eq!(store.load_params("q").await.unwrap(), None);

        let params = QueueParams {
            failed_retries: 7,
            ..Default::default()
        };
        store.save_params("q", &params).await.unwrap();
        assert_eq!(store.load_params("q").await.unwrap(), Some(params));

        let mut vectors = DeletedVectors::default();
        vectors.to_delete.insert(JobId(5));
        store.flush_deleted_vectors("q", &vectors).await.unwrap();
        assert_eq!(store.load_deleted_vectors("q").await.unwrap(), vectors);
    }
}
