//! Deadlines of jobs currently Running or Reading.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use netschedule_core::JobId;

#[derive(Debug, Default)]
pub struct RunTimeline {
    deadlines: BTreeSet<(DateTime<Utc>, JobId)>,
    by_job: HashMap<JobId, DateTime<Utc>>,
}

impl RunTimeline {
    /// Set (or move) the deadline of `id`.
    pub fn schedule(&mut self, id: JobId, deadline: DateTime<Utc>) {
        self.remove(id);
        self.deadlines.insert((deadline, id));
        self.by_job.insert(id, deadline);
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        match self.by_job.remove(&id) {
            Some(deadline) => self.deadlines.remove(&(deadline, id)),
            None => false,
        }
    }

    /// Remove and return every job whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            self.by_job.remove(&id);
            expired.push(id);
        }
        expired
    }

    pub fn deadline(&self, id: JobId) -> Option<DateTime<Utc>> {
        self.by_job.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn expired_jobs_come_out_in_deadline_order() {
        let now = Utc::now();
        let mut timeline = RunTimeline::default();
        timeline.schedule(JobId(1), now + TimeDelta::seconds(20));
        timeline.schedule(JobId(2), now + TimeDelta::seconds(10));
        timeline.schedule(JobId(3), now + TimeDelta::seconds(60));

        assert!(timeline.take_expired(now).is_empty());
        assert_eq!(
            timeline.take_expired(now + TimeDelta::seconds(30)),
            vec![JobId(2), JobId(1)]
        );
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn rescheduling_replaces_the_deadline() {
        let now = Utc::now();
        let mut timeline = RunTimeline::default();
        timeline.schedule(JobId(1), now);
        timeline.schedule(JobId(1), now + TimeDelta::seconds(5));
        assert_eq!(timeline.deadline(JobId(1)), Some(now + TimeDelta::seconds(5)));
        assert!(timeline.take_expired(now).is_empty());

        assert!(timeline.remove(JobId(1)));
        assert!(timeline.is_empty());
    }
}
