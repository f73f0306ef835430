//! In-memory job status tracking.

use std::collections::{BTreeSet, HashMap};

use netschedule_core::{JobId, JobStatus, QueueError};

const STATUS_COUNT: usize = JobStatus::ALL.len();

/// Authoritative status of every job of one queue.
///
/// Holds no lock of its own; the owning queue serializes access.
#[derive(Debug, Default)]
pub struct JobStatusTracker {
    statuses: HashMap<JobId, JobStatus>,
    by_status: [BTreeSet<JobId>; STATUS_COUNT],
}

impl JobStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly submitted job as Pending.
    pub fn insert(&mut self, id: JobId) {
        self.restore(id, JobStatus::Pending);
    }

    /// Track `id` in `status` without checking transitions (used on load).
    pub fn restore(&mut self, id: JobId, status: JobStatus) {
        if let Some(previous) = self.statuses.insert(id, status) {
            self.by_status[previous.index()].remove(&id);
        }
        self.by_status[status.index()].insert(id);
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses.get(&id).copied()
    }

    /// Move `id` along one FSM edge and return the previous status.
    pub fn set_status(&mut self, id: JobId, next: JobStatus) -> Result<JobStatus, QueueError> {
        let current = self.status(id).ok_or(QueueError::JobNotFound(id))?;
        if !current.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                job_id: id,
                from: current,
                to: next,
            });
        }
        self.statuses.insert(id, next);
        self.by_status[current.index()].remove(&id);
        self.by_status[next.index()].insert(id);
        Ok(current)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status[status.index()].len()
    }

    /// Jobs in `status`, lowest id first.
    pub fn jobs_in(&self, status: JobStatus) -> impl Iterator<Item = JobId> + '_ {
        self.by_status[status.index()].iter().copied()
    }

    /// Stop tracking `id`, returning its last status.
    pub fn erase(&mut self, id: JobId) -> Option<JobStatus> {
        let status = self.statuses.remove(&id)?;
        self.by_status[status.index()].remove(&id);
        Some(status)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.statuses.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_fsm() {
        let mut tracker = JobStatusTracker::new();
        tracker.insert(JobId(1));

        assert_eq!(
            tracker.set_status(JobId(1), JobStatus::Running),
            Ok(JobStatus::Pending)
        );
        assert_eq!(
            tracker.set_status(JobId(1), JobStatus::Confirmed),
            Err(QueueError::InvalidTransition {
                job_id: JobId(1),
                from: JobStatus::Running,
                to: JobStatus::Confirmed,
            })
        );
        assert_eq!(tracker.status(JobId(1)), Some(JobStatus::Running));

        tracker.set_status(JobId(1), JobStatus::Done).unwrap();
        tracker.set_status(JobId(1), JobStatus::Reading).unwrap();
        tracker.set_status(JobId(1), JobStatus::Confirmed).unwrap();
        assert!(tracker.set_status(JobId(1), JobStatus::Canceled).is_err());
    }

    #[test]
    fn every_status_has_its_own_bucket() {
        let mut tracker = JobStatusTracker::new();
        for (n, status) in JobStatus::ALL.into_iter().enumerate() {
            tracker.restore(JobId(n as u32 + 1), status);
        }
        for (n, status) in JobStatus::ALL.into_iter().enumerate() {
            assert_eq!(tracker.count(status), 1, "{status}");
            assert_eq!(tracker.jobs_in(status).collect::<Vec<_>>(), vec![JobId(n as u32 + 1)]);
        }
    }

    #[test]
    fn counts_move_with_the_job() {
        let mut tracker = JobStatusTracker::new();
        for id in 1..=3 {
            tracker.insert(JobId(id));
        }
        tracker.set_status(JobId(2), JobStatus::Running).unwrap();

        assert_eq!(tracker.count(JobStatus::Pending), 2);
        assert_eq!(tracker.count(JobStatus::Running), 1);
        assert_eq!(
            tracker.jobs_in(JobStatus::Pending).collect::<Vec<_>>(),
            vec![JobId(1), JobId(3)]
        );

        assert_eq!(tracker.erase(JobId(2)), Some(JobStatus::Running));
        assert_eq!(tracker.count(JobStatus::Running), 0);
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.set_status(JobId(2), JobStatus::Done),
            Err(QueueError::JobNotFound(JobId(2)))
        );
    }

    #[test]
    fn restore_replaces_previous_status() {
        let mut tracker = JobStatusTracker::new();
        tracker.restore(JobId(5), JobStatus::Done);
        tracker.restore(JobId(5), JobStatus::Reading);
        assert_eq!(tracker.count(JobStatus::Done), 0);
        assert_eq!(tracker.count(JobStatus::Reading), 1);
    }
}
