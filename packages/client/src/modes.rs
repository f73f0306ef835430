//! What a timeline polls for: jobs to run, or results to read.

use std::sync::{Arc, Mutex, PoisonError};

use netschedule_core::{Command, NotificationKind, ServerAddress, WaitRequest, WorkerId};

use crate::affinity::AffinityPreferences;

/// Request side of one polling strategy.
pub trait PollMode: Send + Sync + 'static {
    /// Notifications that should wake this timeline.
    fn kind(&self) -> NotificationKind;

    /// Command to send before polling `server`, if any.
    fn prepare(&self, _server: &ServerAddress) -> Option<Command> {
        None
    }

    /// `prepare`'s command succeeded on `server`.
    fn prepared(&self, _server: &ServerAddress) {}

    /// `server` is unreachable; forget what it was told.
    fn disconnected(&self, _server: &ServerAddress) {}

    /// One poll request; `wait` registers for notifications when empty.
    fn request(&self, wait: Option<WaitRequest>) -> Command;
}

/// Polls for Pending jobs with `GET2`.
#[derive(Debug, Clone)]
pub struct GetMode {
    queue: String,
    client: WorkerId,
    affinities: Arc<Mutex<AffinityPreferences>>,
    any_affinity: bool,
    group: Option<String>,
}

impl GetMode {
    pub fn new(
        queue: impl Into<String>,
        client: WorkerId,
        affinities: Arc<Mutex<AffinityPreferences>>,
    ) -> Self {
        Self {
            queue: queue.into(),
            client,
            affinities,
            any_affinity: false,
            group: None,
        }
    }

    /// Ask to be notified about jobs of any affinity.
    pub fn with_any_affinity(mut self, any: bool) -> Self {
        self.any_affinity = any;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    fn with_prefs<T>(&self, f: impl FnOnce(&mut AffinityPreferences) -> T) -> T {
        f(&mut self.affinities.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl PollMode for GetMode {
    fn kind(&self) -> NotificationKind {
        NotificationKind::Get
    }

    fn prepare(&self, server: &ServerAddress) -> Option<Command> {
        self.with_prefs(|p| p.command_for(server))
    }

    fn prepared(&self, server: &ServerAddress) {
        self.with_prefs(|p| p.mark_synced(server));
    }

    fn disconnected(&self, server: &ServerAddress) {
        self.with_prefs(|p| p.forget(server));
    }

    fn request(&self, wait: Option<WaitRequest>) -> Command {
        Command::Get {
            queue: self.queue.clone(),
            client: self.client.clone(),
            affinities: self.with_prefs(|p| p.claimed().map(str::to_string).collect()),
            any_affinity: self.any_affinity,
            group: self.group.clone(),
            wait,
        }
    }
}

/// Polls for Done jobs with `READ`.
#[derive(Debug, Clone)]
pub struct ReadMode {
    queue: String,
    client: WorkerId,
}

impl ReadMode {
    pub fn new(queue: impl Into<String>, client: WorkerId) -> Self {
        Self {
            queue: queue.into(),
            client,
        }
    }
}

impl PollMode for ReadMode {
    fn kind(&self) -> NotificationKind {
        NotificationKind::Read
    }

    fn request(&self, wait: Option<WaitRequest>) -> Command {
        Command::Read {
            queue: self.queue.clone(),
            client: self.client.clone(),
            wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mode_syncs_affinities_once_per_server() {
        let prefs = Arc::new(Mutex::new(AffinityPreferences::new(
            "render",
            WorkerId::new("wn1"),
        )));
        let mode = GetMode::new("render", WorkerId::new("wn1"), prefs.clone());
        let server = ServerAddress::new("ns1", 9100);
        assert!(mode.prepare(&server).is_none());

        prefs.lock().unwrap().claim("gpu").unwrap();
        assert!(mode.prepare(&server).is_some());
        mode.prepared(&server);
        assert!(mode.prepare(&server).is_none());
        mode.disconnected(&server);
        assert!(mode.prepare(&server).is_some());

        let Command::Get { affinities, wait, .. } = mode.request(None) else {
            panic!("expected GET2");
        };
        assert_eq!(affinities, vec!["gpu"]);
        assert!(wait.is_none());
    }

    #[test]
    fn read_mode_sends_read() {
        let mode = ReadMode::new("render", WorkerId::new("r1"));
        assert_eq!(mode.kind(), NotificationKind::Read);
        let wait = WaitRequest {
            port: 9300,
            timeout: None,
        };
        assert_eq!(
            mode.request(Some(wait)).encode(),
            "READ queue=render&client=r1&port=9300"
        );
    }
}
