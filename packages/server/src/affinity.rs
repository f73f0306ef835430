//! Affinity tokens and worker affinity preferences.

use std::collections::{BTreeSet, HashMap, HashSet};

use netschedule_core::{JobId, WorkerId};

/// Interned affinity token.
pub type AffinityId = u32;

/// Token to id interning plus the affinity to job index.
///
/// Ids stay stable for the life of the queue; tokens are never forgotten.
#[derive(Debug, Default)]
pub struct AffinityDictionary {
    ids: HashMap<String, AffinityId>,
    tokens: Vec<String>,
    jobs: HashMap<AffinityId, BTreeSet<JobId>>,
}

impl AffinityDictionary {
    pub fn get_or_create_id(&mut self, token: &str) -> AffinityId {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        self.tokens.push(token.to_string());
        let id = self.tokens.len() as AffinityId;
        self.ids.insert(token.to_string(), id);
        id
    }

    pub fn id_of(&self, token: &str) -> Option<AffinityId> {
        self.ids.get(token).copied()
    }

    pub fn token(&self, id: AffinityId) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.tokens.get(index).map(String::as_str)
    }

    pub fn add_job(&mut self, id: AffinityId, job: JobId) {
        self.jobs.entry(id).or_default().insert(job);
    }

    pub fn remove_job(&mut self, id: AffinityId, job: JobId) {
        if let Some(jobs) = self.jobs.get_mut(&id) {
            jobs.remove(&job);
            if jobs.is_empty() {
                self.jobs.remove(&id);
            }
        }
    }

    pub fn jobs_with(&self, id: AffinityId) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.get(&id).into_iter().flatten().copied()
    }
}

/// Preferred affinities declared by each worker node.
#[derive(Debug, Default)]
pub struct WorkerAffinityMap {
    preferred: HashMap<WorkerId, BTreeSet<AffinityId>>,
}

impl WorkerAffinityMap {
    /// Add `id` to the preference set of `worker`; returns false if already present.
    pub fn claim(&mut self, worker: &WorkerId, id: AffinityId) -> bool {
        self.preferred.entry(worker.clone()).or_default().insert(id)
    }

    pub fn release(&mut self, worker: &WorkerId, id: AffinityId) -> bool {
        let Some(set) = self.preferred.get_mut(worker) else {
            return false;
        };
        let removed = set.remove(&id);
        if set.is_empty() {
            self.preferred.remove(worker);
        }
        removed
    }

    pub fn preferred(&self, worker: &WorkerId) -> impl Iterator<Item = AffinityId> + '_ {
        self.preferred.get(worker).into_iter().flatten().copied()
    }

    pub fn workers_preferring(&self, id: AffinityId) -> HashSet<WorkerId> {
        self.preferred
            .iter()
            .filter(|(_, set)| set.contains(&id))
            .map(|(worker, _)| worker.clone())
            .collect()
    }
}

/// Both affinity structures, kept behind one queue lock.
#[derive(Debug, Default)]
pub struct AffinityIndex {
    pub dictionary: AffinityDictionary,
    pub workers: WorkerAffinityMap,
}

impl AffinityIndex {
    /// Intern `token` and claim it for `worker`.
    pub fn claim_preferred_affinity(&mut self, worker: &WorkerId, token: &str) -> AffinityId {
        let id = self.dictionary.get_or_create_id(token);
        self.workers.claim(worker, id);
        id
    }

    pub fn release_preferred_affinity(&mut self, worker: &WorkerId, token: &str) {
        if let Some(id) = self.dictionary.id_of(token) {
            self.workers.release(worker, id);
        }
    }

    /// Jobs carrying any of `tokens` or any affinity `worker` prefers.
    pub fn candidate_jobs<'a>(
        &self,
        worker: &WorkerId,
        tokens: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<JobId> {
        let mut ids: BTreeSet<AffinityId> = self.workers.preferred(worker).collect();
        ids.extend(tokens.into_iter().filter_map(|t| self.dictionary.id_of(t)));
        ids.into_iter()
            .flat_map(|id| self.dictionary.jobs_with(id))
            .collect()
    }

    pub fn workers_preferring(&self, token: &str) -> HashSet<WorkerId> {
        self.dictionary
            .id_of(token)
            .map(|id| self.workers.workers_preferring(id))
            .unwrap_or_default()
    }
}
