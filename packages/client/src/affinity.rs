//! Preferred affinities of one worker and their sync state per server.

use std::collections::{BTreeSet, HashMap};

use netschedule_core::{Command, QueueError, ServerAddress, WorkerId, validate_token};

/// Affinities a worker prefers, and what each server has been told.
#[derive(Debug, Clone)]
pub struct AffinityPreferences {
    queue: String,
    client: WorkerId,
    claimed: BTreeSet<String>,
    synced: HashMap<ServerAddress, BTreeSet<String>>,
}

impl AffinityPreferences {
    pub fn new(queue: impl Into<String>, client: WorkerId) -> Self {
        Self {
            queue: queue.into(),
            client,
            claimed: BTreeSet::new(),
            synced: HashMap::new(),
        }
    }

    /// Add `token` to the preference set; idempotent.
    pub fn claim(&mut self, token: &str) -> Result<bool, QueueError> {
        validate_token("affinity", token)?;
        Ok(self.claimed.insert(token.to_string()))
    }

    pub fn release(&mut self, token: &str) -> bool {
        self.claimed.remove(token)
    }

    pub fn claimed(&self) -> impl Iterator<Item = &str> {
        self.claimed.iter().map(String::as_str)
    }

    /// `SETAFF` carrying the whole preference set.
    pub fn build_command(&self) -> Command {
        Command::SetAffinity {
            queue: self.queue.clone(),
            client: self.client.clone(),
            add: self.claimed.iter().cloned().collect(),
            remove: Vec::new(),
        }
    }

    /// `SETAFF` bringing `server` up to date, if it is behind.
    pub fn command_for(&self, server: &ServerAddress) -> Option<Command> {
        let known = self.synced.get(server);
        let add: Vec<String> = self
            .claimed
            .iter()
            .filter(|t| known.is_none_or(|k| !k.contains(*t)))
            .cloned()
            .collect();
        let remove: Vec<String> = known
            .map(|k| k.difference(&self.claimed).cloned().collect())
            .unwrap_or_default();
        if add.is_empty() && remove.is_empty() {
            return None;
        }
        Some(Command::SetAffinity {
            queue: self.queue.clone(),
            client: self.client.clone(),
            add,
            remove,
        })
    }

    pub fn mark_synced(&mut self, server: &ServerAddress) {
        self.synced.insert(server.clone(), self.claimed.clone());
    }

    /// Forget what `server` knows, e.g. after losing the connection.
    pub fn forget(&mut self, server: &ServerAddress) {
        self.synced.remove(server);
    }
}
