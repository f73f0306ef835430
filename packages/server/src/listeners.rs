//! Worker nodes waiting for new-job or job-done notifications.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use netschedule_core::{NotificationKind, WorkerId, to_delta};

/// Registry key: one listener per UDP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub host: String,
    pub port: u16,
}

impl ListenerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Filters of a Get registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetInterest {
    /// Notify about jobs of any affinity, not only preferred ones.
    pub any_affinity: bool,
    /// Affinities named in the registering request.
    pub affinities: BTreeSet<String>,
    pub group: Option<String>,
}

impl GetInterest {
    /// Whether a job of `group` passes the group filter.
    pub fn accepts_group(&self, group: Option<&str>) -> bool {
        match &self.group {
            None => true,
            Some(wanted) => group == Some(wanted.as_str()),
        }
    }
}

/// A registered worker node.
///
/// Get filters belong to the Get registration only; a Read registration
/// on the same endpoint leaves them alone and is never filtered by them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub key: ListenerKey,
    pub client: WorkerId,
    pub get: Option<GetInterest>,
    pub wants_read: bool,
    pub last_connect: DateTime<Utc>,
    pub timeout: Duration,
    pub auth: String,
}

impl Listener {
    pub fn new(
        key: ListenerKey,
        client: WorkerId,
        kind: NotificationKind,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            auth: client.as_str().to_string(),
            client,
            get: (kind == NotificationKind::Get).then(GetInterest::default),
            wants_read: kind == NotificationKind::Read,
            last_connect: now,
            timeout,
        }
    }

    /// Get listener with the given filters.
    pub fn for_get(
        key: ListenerKey,
        client: WorkerId,
        interest: GetInterest,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            get: Some(interest),
            ..Self::new(key, client, NotificationKind::Get, now, timeout)
        }
    }

    pub fn wants(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Get => self.get.is_some(),
            NotificationKind::Read => self.wants_read,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.last_connect + to_delta(self.timeout) < now
    }
}

/// Listeners of one queue, unique by (host, port).
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener`, or refresh the entry with the same key in place.
    ///
    /// Interests accumulate: a Read registration on an endpoint already
    /// waiting for Get notifications keeps receiving both, under the Get
    /// filters of the last Get registration.
    pub fn register(&mut self, listener: Listener) {
        match self.listeners.iter_mut().find(|l| l.key == listener.key) {
            Some(existing) => {
                let get = listener.get.clone().or_else(|| existing.get.take());
                let wants_read = existing.wants_read || listener.wants_read;
                *existing = Listener {
                    get,
                    wants_read,
                    ..listener
                };
            }
            None => self.listeners.push(listener),
        }
    }

    pub fn unregister(&mut self, key: &ListenerKey) -> Option<Listener> {
        let index = self.listeners.iter().position(|l| &l.key == key)?;
        Some(self.listeners.swap_remove(index))
    }

    /// Drop the `kind` interest of `client` on `host`; entries left with no
    /// interest are removed.
    pub fn withdraw(&mut self, host: &str, client: &WorkerId, kind: NotificationKind) {
        for listener in self
            .listeners
            .iter_mut()
            .filter(|l| l.key.host == host && &l.client == client)
        {
            match kind {
                NotificationKind::Get => listener.get = None,
                NotificationKind::Read => listener.wants_read = false,
            }
        }
        self.listeners
            .retain(|l| l.wants(NotificationKind::Get) || l.wants(NotificationKind::Read));
    }

    /// Remove listeners whose registration expired; returns how many.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|l| !l.is_expired(now));
        before - self.listeners.len()
    }

    /// Keys of live listeners interested in `kind` that satisfy `filter`.
    pub fn matching(
        &self,
        kind: NotificationKind,
        now: DateTime<Utc>,
        mut filter: impl FnMut(&Listener) -> bool,
    ) -> Vec<ListenerKey> {
        self.listeners
            .iter()
            .filter(|l| l.wants(kind) && !l.is_expired(now) && filter(l))
            .map(|l| l.key.clone())
            .collect()
    }

    pub fn get(&self, key: &ListenerKey) -> Option<&Listener> {
        self.listeners.iter().find(|l| &l.key == key)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(port: u16, kind: NotificationKind, now: DateTime<Utc>) -> Listener {
        Listener::new(
            ListenerKey::new("10.0.0.5", port),
            WorkerId::new("wn1"),
            kind,
            now,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn same_endpoint_registers_once() {
        let now = Utc::now();
        let mut registry = ListenerRegistry::new();
        registry.register(listener(9000, NotificationKind::Get, now));

        let later = now + chrono::TimeDelta::seconds(10);
        let mut again = listener(9000, NotificationKind::Read, later);
        again.timeout = Duration::from_secs(90);
        registry.register(again);

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&ListenerKey::new("10.0.0.5", 9000)).unwrap();
        assert_eq!(entry.last_connect, later);
        assert_eq!(entry.timeout, Duration::from_secs(90));
        assert!(entry.wants(NotificationKind::Get) && entry.wants_read);

        registry.register(listener(9001, NotificationKind::Get, now));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn prune_drops_expired_registrations() {
        let now = Utc::now();
        let mut registry = ListenerRegistry::new();
        registry.register(listener(9000, NotificationKind::Get, now));
        registry.register(listener(
            9001,
            NotificationKind::Get,
            now + chrono::TimeDelta::seconds(20),
        ));

        assert_eq!(registry.prune(now + chrono::TimeDelta::seconds(30)), 0);
        assert_eq!(registry.prune(now + chrono::TimeDelta::seconds(31)), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn matching_filters_by_interest_and_predicate() {
        let now = Utc::now();
        let mut registry = ListenerRegistry::new();
        registry.register(listener(9000, NotificationKind::Get, now));
        registry.register(listener(9001, NotificationKind::Read, now));
        let grouped = GetInterest {
            group: Some("batch".into()),
            ..Default::default()
        };
        registry.register(Listener::for_get(
            ListenerKey::new("10.0.0.5", 9002),
            WorkerId::new("wn1"),
            grouped,
            now,
            Duration::from_secs(30),
        ));

        let keys = registry.matching(NotificationKind::Get, now, |l| {
            l.get.as_ref().is_some_and(|get| get.accepts_group(None))
        });
        assert_eq!(keys, vec![ListenerKey::new("10.0.0.5", 9000)]);

        let keys = registry.matching(NotificationKind::Read, now, |_| true);
        assert_eq!(keys, vec![ListenerKey::new("10.0.0.5", 9001)]);
    }

    #[test]
    fn withdraw_removes_only_the_given_interest() {
        let now = Utc::now();
        let mut registry = ListenerRegistry::new();
        registry.register(listener(9000, NotificationKind::Get, now));
        registry.register(listener(9000, NotificationKind::Read, now));

        registry.withdraw("10.0.0.5", &WorkerId::new("wn1"), NotificationKind::Get);
        let entry = registry.get(&ListenerKey::new("10.0.0.5", 9000)).unwrap();
        assert!(entry.get.is_none() && entry.wants_read);

        registry.withdraw("10.0.0.5", &WorkerId::new("wn1"), NotificationKind::Read);
        assert!(registry.is_empty());
    }

    #[test]
    fn read_registration_keeps_the_get_filters() {
        let now = Utc::now();
        let key = ListenerKey::new("10.0.0.5", 9000);
        let interest = GetInterest {
            any_affinity: true,
            affinities: BTreeSet::from(["gpu".to_string()]),
            group: Some("nightly".into()),
        };
        let mut registry = ListenerRegistry::new();
        registry.register(Listener::for_get(
            key.clone(),
            WorkerId::new("wn1"),
            interest.clone(),
            now,
            Duration::from_secs(30),
        ));
        registry.register(listener(9000, NotificationKind::Read, now));

        let entry = registry.get(&key).unwrap();
        assert_eq!(entry.get.as_ref(), Some(&interest));
        assert!(entry.wants_read);

        // A later Get registration replaces the filters.
        registry.register(listener(9000, NotificationKind::Get, now));
        let entry = registry.get(&key).unwrap();
        assert_eq!(entry.get.as_ref(), Some(&GetInterest::default()));
        assert!(entry.wants_read);
    }
}
