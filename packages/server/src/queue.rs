//! Per-named-queue aggregate: admission, dispatch and cleanup of jobs.
//!
//! Each concern sits behind its own lock. The job table and the deletion
//! vectors are the only pair ever held together, always in that order, so
//! that a job marked for deletion can never be handed out.
//!
//! Store writes are counted in the job table from the moment the change is
//! made until the save returns. Purge keeps ids with a write in flight in
//! the deleted vector, and a save that lands after the purge is erased
//! again, so a late write cannot bring a job back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use chrono::{DateTime, Utc};
use netschedule_core::{
    DeletedVectors, Job, JobId, JobSpec, JobStatus, JobStore, Notification, NotificationKind,
    QueueError, QueueId, QueueInfo, QueueKind, QueueParams, QueueStats, ServerAddress,
    WaitRequest, WorkerId, to_delta, validate_token,
};

use crate::affinity::{AffinityId, AffinityIndex};
use crate::listeners::{GetInterest, Listener, ListenerKey, ListenerRegistry};
use crate::notifier::NotificationSink;
use crate::run_timeout::RunTimeline;
use crate::tracker::JobStatusTracker;

/// Collaborators shared by every queue of one server.
#[derive(Clone)]
pub struct QueueContext {
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<dyn NotificationSink>,
    /// Node identity carried in notifications.
    pub server: ServerAddress,
}

impl std::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// Selection criteria of a `GET2` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Affinities to prefer in addition to the worker's declared ones.
    pub affinities: Vec<String>,
    /// Listener registration: notify about jobs of any affinity.
    pub any_affinity: bool,
    /// Only hand out jobs of this group.
    pub group: Option<String>,
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub timed_out: usize,
    pub expired: usize,
    pub purged: usize,
    pub pruned: usize,
    pub renotified: usize,
}

#[derive(Debug, Default)]
struct JobTable {
    tracker: JobStatusTracker,
    jobs: HashMap<JobId, Job>,
    /// Store writes in flight per job.
    writes: HashMap<JobId, usize>,
}

fn begin_write(writes: &mut HashMap<JobId, usize>, id: JobId) {
    *writes.entry(id).or_default() += 1;
}

fn end_write(writes: &mut HashMap<JobId, usize>, id: JobId) {
    if let Some(count) = writes.get_mut(&id) {
        *count -= 1;
        if *count == 0 {
            writes.remove(&id);
        }
    }
}

#[derive(Debug, Default)]
struct Schedule {
    last_timeout_check: Option<DateTime<Utc>>,
    last_renotify: Option<DateTime<Utc>>,
    empty_since: Option<DateTime<Utc>>,
}

/// The parts of a job that decide who gets notified about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JobTraits {
    affinity: Option<String>,
    group: Option<String>,
}

impl From<&Job> for JobTraits {
    fn from(job: &Job) -> Self {
        Self {
            affinity: job.affinity.clone(),
            group: job.group.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn step(tracker: &mut JobStatusTracker, job: &mut Job, next: JobStatus) -> Result<(), QueueError> {
    tracker.set_status(job.id, next)?;
    job.status = next;
    Ok(())
}

/// Give a Running job back to Pending while retries remain, else fail it.
fn requeue_or_fail(
    tracker: &mut JobStatusTracker,
    job: &mut Job,
    retry_limit: u32,
) -> Result<(), QueueError> {
    if job.retries < retry_limit {
        step(tracker, job, JobStatus::Returned)?;
        step(tracker, job, JobStatus::Pending)?;
        job.retries += 1;
    } else {
        step(tracker, job, JobStatus::Failed)?;
    }
    job.owner = None;
    Ok(())
}

fn check_owner(job: &Job, worker: &WorkerId, held_in: JobStatus) -> Result<(), QueueError> {
    if job.status == held_in && !job.is_owned_by(worker) {
        return Err(QueueError::NotOwned {
            job_id: job.id,
            worker: worker.clone(),
        });
    }
    Ok(())
}

fn group_matches(wanted: Option<&str>, group: Option<&str>) -> bool {
    wanted.is_none_or(|w| group == Some(w))
}

/// In-memory tables of a queue, handed from instance to instance on
/// reconfiguration.
#[derive(Debug, Default)]
struct QueueState {
    jobs: Mutex<JobTable>,
    deleted: Mutex<DeletedVectors>,
    affinity: Mutex<AffinityIndex>,
    listeners: RwLock<ListenerRegistry>,
    run_timeline: Mutex<RunTimeline>,
    stats: Mutex<QueueStats>,
    schedule: Mutex<Schedule>,
}

/// One named queue.
pub struct Queue {
    id: QueueId,
    name: String,
    kind: QueueKind,
    params: QueueParams,
    created_at: DateTime<Utc>,
    context: QueueContext,
    state: Arc<QueueState>,
    /// Set once a reconfigured successor has taken over.
    closed: AtomicBool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Open a queue instance over whatever the store holds for `name`.
    ///
    /// `params` are saved to the store when given; otherwise the stored
    /// parameters (or defaults) apply. Jobs already deleted are skipped;
    /// jobs still marked for deletion are loaded but stay invisible until
    /// the next purge removes them.
    pub async fn open(
        name: &str,
        kind: QueueKind,
        params: Option<QueueParams>,
        context: QueueContext,
    ) -> Result<Self, QueueError> {
        validate_token("queue", name)?;
        let store = &context.store;
        let params = match params {
            Some(params) => {
                store.save_params(name, &params).await?;
                params
            }
            None => store.load_params(name).await?.unwrap_or_default(),
        };
        let deleted = store.load_deleted_vectors(name).await?;
        let stored = store.load_jobs(name).await?;

        let mut table = JobTable::default();
        let mut affinity = AffinityIndex::default();
        let mut run_timeline = RunTimeline::default();
        for job in stored {
            if deleted.deleted.contains(&job.id) {
                continue;
            }
            table.tracker.restore(job.id, job.status);
            if let Some(token) = &job.affinity {
                let id = affinity.dictionary.get_or_create_id(token);
                affinity.dictionary.add_job(id, job.id);
            }
            if matches!(job.status, JobStatus::Running | JobStatus::Reading) {
                run_timeline.schedule(job.id, job.updated_at + to_delta(params.run_timeout));
            }
            table.jobs.insert(job.id, job);
        }

        tracing::info!(
            queue = %name,
            jobs = table.jobs.len(),
            marked = deleted.to_delete.len(),
            "Queue opened"
        );

        let state = QueueState {
            jobs: Mutex::new(table),
            deleted: Mutex::new(deleted),
            affinity: Mutex::new(affinity),
            run_timeline: Mutex::new(run_timeline),
            ..Default::default()
        };
        Ok(Self {
            id: QueueId::new(),
            name: name.to_string(),
            kind,
            params,
            created_at: Utc::now(),
            context,
            state: Arc::new(state),
            closed: AtomicBool::new(false),
        })
    }

    /// Successor instance running on `params`.
    ///
    /// The successor takes over the in-memory tables as they are, so jobs
    /// in flight stay owned by their workers. Both instances serve the same
    /// tables until [`Queue::close`] is called on this one.
    pub async fn reconfigure(&self, params: QueueParams) -> Result<Queue, QueueError> {
        self.ensure_open()?;
        self.context.store.save_params(&self.name, &params).await?;
        Ok(Queue {
            id: QueueId::new(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            params,
            created_at: Utc::now(),
            context: self.context.clone(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Reject every further request with [`QueueError::QueueNotFound`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(queue = %self.name, id = %self.id, "Queue instance closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::QueueNotFound(self.name.clone()));
        }
        Ok(())
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &QueueKind {
        &self.kind
    }

    pub fn params(&self) -> &QueueParams {
        &self.params
    }

    /// Admit a new job and wake matching Get listeners.
    pub async fn submit(&self, spec: JobSpec, host: &str) -> Result<JobId, QueueError> {
        self.ensure_open()?;
        spec.validate()?;
        if !self.params.subm_hosts.permits(host) {
            return Err(self.denied(host, "submit jobs"));
        }

        let id = self.context.store.next_id(&self.name).await?;
        let job = Job::new(id, &self.name, spec, Utc::now());

        if let Some(token) = &job.affinity {
            let mut affinity = lock(&self.state.affinity);
            let affinity_id = affinity.dictionary.get_or_create_id(token);
            affinity.dictionary.add_job(affinity_id, id);
        }
        {
            let mut table = lock(&self.state.jobs);
            table.tracker.insert(id);
            table.jobs.insert(id, job.clone());
            begin_write(&mut table.writes, id);
        }
        lock(&self.state.stats).submitted += 1;

        tracing::debug!(queue = %self.name, job_id = %id, "Job submitted");

        self.persist(&job).await;
        self.notify_listeners(NotificationKind::Get, &[JobTraits::from(&job)], Utc::now());
        Ok(id)
    }

    /// Hand a Pending job to `worker`, preferring its affinities.
    ///
    /// Returns `None` when nothing matches; that is not an error.
    pub async fn try_get(
        &self,
        worker: &WorkerId,
        filter: &JobFilter,
        host: &str,
    ) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        if !self.params.wnode_hosts.permits(host) {
            return Err(self.denied(host, "get jobs"));
        }
        for token in &filter.affinities {
            validate_token("affinity", token)?;
        }
        if let Some(group) = &filter.group {
            validate_token("group", group)?;
        }

        let preferred = lock(&self.state.affinity)
            .candidate_jobs(worker, filter.affinities.iter().map(String::as_str));
        let now = Utc::now();

        let job = {
            let mut table = lock(&self.state.jobs);
            let deleted = lock(&self.state.deleted);
            let JobTable {
                tracker,
                jobs,
                writes,
            } = &mut *table;

            let eligible = |id: &JobId| {
                tracker.status(*id) == Some(JobStatus::Pending)
                    && !deleted.contains(*id)
                    && jobs.get(id).is_some_and(|job| {
                        group_matches(filter.group.as_deref(), job.group.as_deref())
                    })
            };
            let picked = preferred
                .iter()
                .copied()
                .find(|id| eligible(id))
                .or_else(|| tracker.jobs_in(JobStatus::Pending).find(|id| eligible(id)));

            let Some(id) = picked else {
                return Ok(None);
            };
            let job = jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            step(tracker, job, JobStatus::Running)?;
            job.owner = Some(worker.clone());
            job.started_at = Some(now);
            job.updated_at = now;
            begin_write(writes, id);
            job.clone()
        };

        lock(&self.state.run_timeline).schedule(job.id, now + to_delta(self.params.run_timeout));
        write(&self.state.listeners).withdraw(host, worker, NotificationKind::Get);

        tracing::debug!(
            queue = %self.name,
            job_id = %job.id,
            worker = %worker,
            "Job handed to worker"
        );

        self.persist(&job).await;
        Ok(Some(job))
    }

    /// Record a successful run and wake Read listeners.
    pub async fn complete(
        &self,
        worker: &WorkerId,
        id: JobId,
        output: String,
    ) -> Result<(), QueueError> {
        let job = self.transition(id, |tracker, job| {
            check_owner(job, worker, JobStatus::Running)?;
            step(tracker, job, JobStatus::Done)?;
            job.output = Some(output);
            job.owner = None;
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);
        lock(&self.state.stats).completed += 1;

        tracing::debug!(queue = %self.name, job_id = %id, "Job done");

        self.persist(&job).await;
        self.notify_listeners(NotificationKind::Read, &[JobTraits::from(&job)], Utc::now());
        Ok(())
    }

    /// Record a failed run; the job is requeued while retries remain.
    pub async fn fail(
        &self,
        worker: &WorkerId,
        id: JobId,
        error: String,
    ) -> Result<JobStatus, QueueError> {
        let retry_limit = self.params.failed_retries;
        let job = self.transition(id, |tracker, job| {
            check_owner(job, worker, JobStatus::Running)?;
            requeue_or_fail(tracker, job, retry_limit)?;
            job.error = Some(error);
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);
        if job.status == JobStatus::Failed {
            lock(&self.state.stats).failed += 1;
        }

        tracing::debug!(
            queue = %self.name,
            job_id = %id,
            status = %job.status,
            retries = job.retries,
            "Job failed"
        );

        self.persist(&job).await;
        if job.status == JobStatus::Pending {
            self.notify_listeners(NotificationKind::Get, &[JobTraits::from(&job)], Utc::now());
        }
        Ok(job.status)
    }

    /// Put a Running job back to Pending without counting a retry.
    pub async fn return_job(&self, worker: &WorkerId, id: JobId) -> Result<(), QueueError> {
        let job = self.transition(id, |tracker, job| {
            check_owner(job, worker, JobStatus::Running)?;
            step(tracker, job, JobStatus::Returned)?;
            step(tracker, job, JobStatus::Pending)?;
            job.owner = None;
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);
        lock(&self.state.stats).returned += 1;

        tracing::debug!(queue = %self.name, job_id = %id, "Job returned");

        self.persist(&job).await;
        self.notify_listeners(NotificationKind::Get, &[JobTraits::from(&job)], Utc::now());
        Ok(())
    }

    /// Cancel any job that has not reached a terminal state.
    pub async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let job = self.transition(id, |tracker, job| {
            step(tracker, job, JobStatus::Canceled)?;
            job.owner = None;
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);
        lock(&self.state.stats).canceled += 1;

        tracing::debug!(queue = %self.name, job_id = %id, "Job canceled");

        self.persist(&job).await;
        Ok(())
    }

    /// Hand the oldest Done job to `reader`.
    pub async fn try_read(&self, reader: &WorkerId, host: &str) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        if !self.params.wnode_hosts.permits(host) {
            return Err(self.denied(host, "read jobs"));
        }
        let now = Utc::now();

        let job = {
            let mut table = lock(&self.state.jobs);
            let deleted = lock(&self.state.deleted);
            let JobTable {
                tracker,
                jobs,
                writes,
            } = &mut *table;

            let picked = tracker
                .jobs_in(JobStatus::Done)
                .find(|id| !deleted.contains(*id));
            let Some(id) = picked else {
                return Ok(None);
            };
            let job = jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            step(tracker, job, JobStatus::Reading)?;
            job.owner = Some(reader.clone());
            job.updated_at = now;
            begin_write(writes, id);
            job.clone()
        };

        lock(&self.state.run_timeline).schedule(job.id, now + to_delta(self.params.run_timeout));
        write(&self.state.listeners).withdraw(host, reader, NotificationKind::Read);

        tracing::debug!(queue = %self.name, job_id = %job.id, reader = %reader, "Job handed to reader");

        self.persist(&job).await;
        Ok(Some(job))
    }

    pub async fn confirm_read(&self, reader: &WorkerId, id: JobId) -> Result<(), QueueError> {
        let job = self.transition(id, |tracker, job| {
            check_owner(job, reader, JobStatus::Reading)?;
            step(tracker, job, JobStatus::Confirmed)?;
            job.owner = None;
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);

        tracing::debug!(queue = %self.name, job_id = %id, "Job result confirmed");

        self.persist(&job).await;
        Ok(())
    }

    pub async fn fail_read(
        &self,
        reader: &WorkerId,
        id: JobId,
        reason: String,
    ) -> Result<(), QueueError> {
        let job = self.transition(id, |tracker, job| {
            check_owner(job, reader, JobStatus::Reading)?;
            step(tracker, job, JobStatus::ReadFailed)?;
            job.error = Some(reason);
            job.owner = None;
            Ok(())
        })?;
        lock(&self.state.run_timeline).remove(id);

        tracing::debug!(queue = %self.name, job_id = %id, "Job result read failed");

        self.persist(&job).await;
        Ok(())
    }

    /// Current status of a visible job.
    pub fn status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        self.job(id).map(|job| job.status)
    }

    /// Snapshot of a visible job.
    pub fn job(&self, id: JobId) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let table = lock(&self.state.jobs);
        let deleted = lock(&self.state.deleted);
        if deleted.contains(id) {
            return Err(QueueError::JobNotFound(id));
        }
        table
            .jobs
            .get(&id)
            .cloned()
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Replace the preferred affinities of `worker`.
    pub fn set_affinity(
        &self,
        worker: &WorkerId,
        add: &[String],
        remove: &[String],
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        for token in add.iter().chain(remove) {
            validate_token("affinity", token)?;
        }
        let mut affinity = lock(&self.state.affinity);
        for token in add {
            affinity.claim_preferred_affinity(worker, token);
        }
        for token in remove {
            affinity.release_preferred_affinity(worker, token);
        }
        Ok(())
    }

    /// Add one affinity to the preference set of `worker`.
    pub fn claim_preferred_affinity(
        &self,
        worker: &WorkerId,
        token: &str,
    ) -> Result<AffinityId, QueueError> {
        self.ensure_open()?;
        validate_token("affinity", token)?;
        Ok(lock(&self.state.affinity).claim_preferred_affinity(worker, token))
    }

    /// Register `client` at `host` for notifications of `kind`.
    pub fn register_listener(
        &self,
        host: &str,
        client: &WorkerId,
        kind: NotificationKind,
        wait: &WaitRequest,
        filter: &JobFilter,
    ) {
        let timeout = wait.timeout.unwrap_or(self.params.notif_timeout);
        let key = ListenerKey::new(host, wait.port);
        let now = Utc::now();
        let listener = match kind {
            NotificationKind::Get => {
                let interest = GetInterest {
                    any_affinity: filter.any_affinity,
                    affinities: filter.affinities.iter().cloned().collect(),
                    group: filter.group.clone(),
                };
                Listener::for_get(key, client.clone(), interest, now, timeout)
            }
            NotificationKind::Read => Listener::new(key, client.clone(), kind, now, timeout),
        };

        tracing::debug!(
            queue = %self.name,
            listener = %listener.key,
            kind = kind.as_str(),
            "Listener registered"
        );
        write(&self.state.listeners).register(listener);
    }

    pub fn listener_count(&self) -> usize {
        read(&self.state.listeners).len()
    }

    /// Mark a job for deletion; it is gone for every lookup from now on.
    pub fn erase(&self, id: JobId) -> Result<(), QueueError> {
        self.ensure_open()?;
        let table = lock(&self.state.jobs);
        let mut deleted = lock(&self.state.deleted);
        if !table.tracker.contains(id) || deleted.contains(id) {
            return Err(QueueError::JobNotFound(id));
        }
        deleted.to_delete.insert(id);
        tracing::debug!(queue = %self.name, job_id = %id, "Job marked for deletion");
        Ok(())
    }

    /// Mark every job for deletion; returns how many were marked.
    pub fn clear(&self) -> usize {
        let table = lock(&self.state.jobs);
        let mut deleted = lock(&self.state.deleted);
        let mut marked = 0;
        for id in table.jobs.keys() {
            if !deleted.contains(*id) {
                deleted.to_delete.insert(*id);
                marked += 1;
            }
        }
        tracing::debug!(queue = %self.name, marked, "Queue cleared");
        marked
    }

    /// Unlink up to `batch` marked jobs and remove them from the store.
    pub async fn purge(&self, batch: usize) -> usize {
        let removed: Vec<(JobId, Option<String>)> = {
            let mut table = lock(&self.state.jobs);
            let mut deleted = lock(&self.state.deleted);
            let mut removed = Vec::new();
            while removed.len() < batch {
                let Some(id) = deleted.to_delete.pop_first() else {
                    break;
                };
                table.tracker.erase(id);
                let affinity = table.jobs.remove(&id).and_then(|job| job.affinity);
                deleted.deleted.insert(id);
                removed.push((id, affinity));
            }
            if removed.is_empty() && deleted.deleted.is_empty() {
                return 0;
            }
            removed
        };

        {
            let mut affinity = lock(&self.state.affinity);
            for (id, token) in &removed {
                if let Some(token) = token
                    && let Some(affinity_id) = affinity.dictionary.id_of(token)
                {
                    affinity.dictionary.remove_job(affinity_id, *id);
                }
            }
        }
        {
            let mut run_timeline = lock(&self.state.run_timeline);
            for (id, _) in &removed {
                run_timeline.remove(*id);
            }
        }

        let store = &self.context.store;
        for (id, _) in &removed {
            if let Err(e) = store.erase(&self.name, *id).await {
                tracing::warn!(queue = %self.name, job_id = %id, error = %e, "Failed to erase job record");
            }
        }
        match store.delete_batch(&self.name, batch.max(removed.len())).await {
            Ok(ids) => {
                let table = lock(&self.state.jobs);
                let mut deleted = lock(&self.state.deleted);
                for id in ids.iter().filter(|id| !table.writes.contains_key(*id)) {
                    deleted.deleted.remove(id);
                }
            }
            Err(e) => {
                tracing::warn!(queue = %self.name, error = %e, "Failed to delete job records");
            }
        }

        lock(&self.state.stats).purged += removed.len() as u64;
        if !removed.is_empty() {
            tracing::debug!(queue = %self.name, purged = removed.len(), "Purge pass");
        }
        removed.len()
    }

    /// Persist the deletion vectors so a restart cannot resurrect jobs.
    pub async fn flush_deleted_vectors(&self) -> Result<(), QueueError> {
        let snapshot = lock(&self.state.deleted).clone();
        self.context
            .store
            .flush_deleted_vectors(&self.name, &snapshot)
            .await?;
        Ok(())
    }

    /// Revert jobs whose Running or Reading deadline passed.
    ///
    /// Scans at most once per `run_timeout_precision`.
    pub async fn check_execution_timeouts(&self, now: DateTime<Utc>) -> usize {
        {
            let mut schedule = lock(&self.state.schedule);
            if let Some(last) = schedule.last_timeout_check
                && now < last + to_delta(self.params.run_timeout_precision)
            {
                return 0;
            }
            schedule.last_timeout_check = Some(now);
        }

        let expired = lock(&self.state.run_timeline).take_expired(now);
        if expired.is_empty() {
            return 0;
        }

        let mut changed = Vec::new();
        {
            let mut table = lock(&self.state.jobs);
            let deleted = lock(&self.state.deleted);
            let JobTable {
                tracker,
                jobs,
                writes,
            } = &mut *table;
            for id in expired {
                if deleted.contains(id) {
                    continue;
                }
                let Some(job) = jobs.get_mut(&id) else {
                    continue;
                };
                let outcome = match job.status {
                    JobStatus::Running => requeue_or_fail(tracker, job, self.params.failed_retries),
                    JobStatus::Reading => step(tracker, job, JobStatus::ReadFailed),
                    _ => continue,
                };
                if let Err(e) = outcome {
                    tracing::warn!(queue = %self.name, job_id = %id, error = %e, "Cannot time out job");
                    continue;
                }
                job.owner = None;
                job.error = Some("execution timeout".to_string());
                job.updated_at = now;
                begin_write(writes, id);
                changed.push(job.clone());
            }
        }

        {
            let mut stats = lock(&self.state.stats);
            stats.run_timeouts += changed.len() as u64;
            stats.failed += changed
                .iter()
                .filter(|job| job.status == JobStatus::Failed)
                .count() as u64;
        }

        for job in &changed {
            tracing::debug!(queue = %self.name, job_id = %job.id, status = %job.status, "Job timed out");
            self.persist(job).await;
        }

        let requeued: Vec<JobTraits> = changed
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .map(JobTraits::from)
            .collect();
        self.notify_listeners(NotificationKind::Get, &requeued, now);

        changed.len()
    }

    /// Mark finished jobs older than the queue `timeout` for deletion.
    pub fn expire_finished(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_delta(self.params.timeout);
        let table = lock(&self.state.jobs);
        let mut deleted = lock(&self.state.deleted);
        let mut marked = 0;
        for status in [
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Confirmed,
            JobStatus::ReadFailed,
            JobStatus::Canceled,
        ] {
            for id in table.tracker.jobs_in(status) {
                if deleted.contains(id) {
                    continue;
                }
                if table.jobs.get(&id).is_some_and(|job| job.updated_at <= cutoff) {
                    deleted.to_delete.insert(id);
                    marked += 1;
                }
            }
        }
        marked
    }

    pub fn prune_listeners(&self, now: DateTime<Utc>) -> usize {
        write(&self.state.listeners).prune(now)
    }

    /// Notify Get listeners again while Pending jobs exist.
    ///
    /// Runs at most once per `notif_interval`; recovers lost datagrams.
    pub fn renotify(&self, now: DateTime<Utc>) -> usize {
        {
            let mut schedule = lock(&self.state.schedule);
            if let Some(last) = schedule.last_renotify
                && now < last + to_delta(self.params.notif_interval)
            {
                return 0;
            }
            schedule.last_renotify = Some(now);
        }

        let pending: Vec<JobTraits> = {
            let table = lock(&self.state.jobs);
            let deleted = lock(&self.state.deleted);
            table
                .tracker
                .jobs_in(JobStatus::Pending)
                .filter(|id| !deleted.contains(*id))
                .filter_map(|id| table.jobs.get(&id))
                .map(JobTraits::from)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        self.notify_listeners(NotificationKind::Get, &pending, now)
    }

    /// Run every periodic task once.
    pub async fn housekeeping(&self, now: DateTime<Utc>, purge_batch: usize) -> HousekeepingReport {
        let timed_out = self.check_execution_timeouts(now).await;
        let expired = self.expire_finished(now);
        let purged = self.purge(purge_batch).await;
        if let Err(e) = self.flush_deleted_vectors().await {
            tracing::warn!(queue = %self.name, error = %e, "Failed to flush deleted vectors");
        }
        HousekeepingReport {
            timed_out,
            expired,
            purged,
            pruned: self.prune_listeners(now),
            renotified: self.renotify(now),
        }
    }

    /// Whether a dynamic queue has been empty for its `empty_lifetime`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.kind.is_dynamic() {
            return false;
        }
        let empty = lock(&self.state.jobs).tracker.is_empty();
        let mut schedule = lock(&self.state.schedule);
        if !empty {
            schedule.empty_since = None;
            return false;
        }
        let since = *schedule.empty_since.get_or_insert(now);
        now - since >= to_delta(self.params.empty_lifetime)
    }

    /// Hint for an empty reply: can work of `kind` still appear here?
    pub fn more_jobs(&self, kind: NotificationKind) -> bool {
        let table = lock(&self.state.jobs);
        let t = &table.tracker;
        let upstream =
            t.count(JobStatus::Pending) + t.count(JobStatus::Running) + t.count(JobStatus::Returned);
        match kind {
            NotificationKind::Get => upstream > 0,
            NotificationKind::Read => {
                upstream + t.count(JobStatus::Done) + t.count(JobStatus::Reading) > 0
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = lock(&self.state.stats).clone();
        let table = lock(&self.state.jobs);
        let deleted = lock(&self.state.deleted);
        for status in JobStatus::ALL {
            stats.by_status[status.index()] = table
                .tracker
                .jobs_in(status)
                .filter(|id| !deleted.contains(*id))
                .count() as u64;
        }
        stats
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            params: self.params.clone(),
            stats: self.stats(),
            created_at: self.created_at,
        }
    }

    /// Apply `f` to a visible job under the job lock.
    fn transition(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobStatusTracker, &mut Job) -> Result<(), QueueError>,
    ) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let mut table = lock(&self.state.jobs);
        let deleted = lock(&self.state.deleted);
        if deleted.contains(id) {
            return Err(QueueError::JobNotFound(id));
        }
        let JobTable {
            tracker,
            jobs,
            writes,
        } = &mut *table;
        let job = jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
        f(tracker, job)?;
        job.updated_at = Utc::now();
        begin_write(writes, id);
        Ok(job.clone())
    }

    fn notify_listeners(
        &self,
        kind: NotificationKind,
        candidates: &[JobTraits],
        now: DateTime<Utc>,
    ) -> usize {
        if candidates.is_empty() {
            return 0;
        }

        let preferring: HashMap<&str, HashSet<WorkerId>> = match kind {
            NotificationKind::Get => {
                let affinity = lock(&self.state.affinity);
                candidates
                    .iter()
                    .filter_map(|c| c.affinity.as_deref())
                    .map(|token| (token, affinity.workers_preferring(token)))
                    .collect()
            }
            NotificationKind::Read => HashMap::new(),
        };

        let targets = read(&self.state.listeners).matching(kind, now, |listener| {
            match (kind, &listener.get) {
                (NotificationKind::Read, _) => true,
                (NotificationKind::Get, None) => false,
                (NotificationKind::Get, Some(interest)) => candidates.iter().any(|job| {
                    interest.accepts_group(job.group.as_deref())
                        && match job.affinity.as_deref() {
                            None => true,
                            Some(token) => {
                                interest.any_affinity
                                    || interest.affinities.contains(token)
                                    || preferring
                                        .get(token)
                                        .is_some_and(|workers| workers.contains(&listener.client))
                            }
                        }
                }),
            }
        });
        if targets.is_empty() {
            return 0;
        }

        let notification = Notification::new(kind, &self.name, self.context.server.clone());
        for target in &targets {
            self.context.notifier.notify(target, &notification);
        }
        lock(&self.state.stats).notifications_sent += targets.len() as u64;

        tracing::debug!(
            queue = %self.name,
            kind = kind.as_str(),
            listeners = targets.len(),
            "Listeners notified"
        );
        targets.len()
    }

    /// Save `job`; the write was counted when the change was made.
    async fn persist(&self, job: &Job) {
        let store = &self.context.store;
        if let Err(e) = store.save_job(&self.name, job).await {
            tracing::warn!(queue = %self.name, job_id = %job.id, error = %e, "Failed to persist job");
        }

        let purged = {
            let mut table = lock(&self.state.jobs);
            let deleted = lock(&self.state.deleted);
            end_write(&mut table.writes, job.id);
            deleted.deleted.contains(&job.id)
        };
        if purged {
            tracing::debug!(queue = %self.name, job_id = %job.id, "Erasing job written after purge");
            if let Err(e) = store.erase(&self.name, job.id).await {
                tracing::warn!(queue = %self.name, job_id = %job.id, error = %e, "Failed to erase job record");
            }
        }
    }

    fn denied(&self, host: &str, action: &'static str) -> QueueError {
        QueueError::AccessDenied {
            queue: self.name.clone(),
            host: host.to_string(),
            action,
        }
    }
}
