//! Queue domain types: identity, parameters and statistics.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::job::JobStatus;

/// Identifier of one queue instance.
///
/// Reconfiguring a queue creates a new instance with a fresh id while the
/// name stays the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub Ulid);

impl QueueId {
    /// Create a new unique queue ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a queue ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a queue came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueKind {
    /// Declared in the server configuration.
    Static,
    /// Created at runtime from a queue class.
    Dynamic { class: String },
}

impl QueueKind {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, QueueKind::Dynamic { .. })
    }
}

/// Serialize a [`Duration`] as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Convert a std duration to a chrono delta, saturating on overflow.
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Hosts allowed to perform an action. Empty means everybody.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostAllowList(pub Vec<String>);

impl HostAllowList {
    pub fn permits(&self, host: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

/// Parameters of one queue, fixed for the lifetime of a queue instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueParams {
    /// How long finished jobs are kept before they are erased.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Default lifetime of a listener registration.
    #[serde(with = "duration_secs")]
    pub notif_timeout: Duration,
    /// Minimum spacing between periodic re-notification rounds.
    #[serde(with = "duration_secs")]
    pub notif_interval: Duration,
    /// How long a job may stay Running or Reading.
    #[serde(with = "duration_secs")]
    pub run_timeout: Duration,
    /// Minimum spacing between execution timeout scans.
    #[serde(with = "duration_secs")]
    pub run_timeout_precision: Duration,
    /// Number of failed runs retried before a job is marked Failed.
    pub failed_retries: u32,
    /// How long a dynamic queue may stay empty before it is deleted.
    #[serde(with = "duration_secs")]
    pub empty_lifetime: Duration,
    /// Hosts allowed to submit jobs.
    pub subm_hosts: HostAllowList,
    /// Hosts allowed to act as worker nodes.
    pub wnode_hosts: HostAllowList,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            notif_timeout: Duration::from_secs(60),
            notif_interval: Duration::from_secs(2),
            run_timeout: Duration::from_secs(3600),
            run_timeout_precision: Duration::from_secs(3),
            failed_retries: 3,
            empty_lifetime: Duration::from_secs(3600),
            subm_hosts: HostAllowList::default(),
            wnode_hosts: HostAllowList::default(),
        }
    }
}

/// Statistics for a queue's current state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Number of visible jobs per status, indexed by [`JobStatus::index`].
    pub by_status: [u64; 9],
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub returned: u64,
    pub canceled: u64,
    pub run_timeouts: u64,
    pub purged: u64,
    pub notifications_sent: u64,
}

impl QueueStats {
    /// Visible jobs in `status`.
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status[status.index()]
    }

    /// Jobs that still need a worker or a reader.
    pub fn active(&self) -> u64 {
        self.count(JobStatus::Pending)
            + self.count(JobStatus::Running)
            + self.count(JobStatus::Returned)
            + self.count(JobStatus::Reading)
    }

    /// Total visible jobs.
    pub fn total(&self) -> u64 {
        self.by_status.iter().sum()
    }
}

/// Snapshot describing a queue instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: QueueId,
    pub name: String,
    pub kind: QueueKind,
    pub params: QueueParams,
    pub stats: QueueStats,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip_through_json_as_seconds() {
        let json = r#"{"run_timeout": 30, "failed_retries": 1, "wnode_hosts": ["10.0.0.1"]}"#;
        let params: QueueParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.run_timeout, Duration::from_secs(30));
        assert_eq!(params.failed_retries, 1);
        assert_eq!(params.timeout, QueueParams::default().timeout);

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["run_timeout"], 30);
    }

    #[test]
    fn empty_allow_list_permits_everyone() {
        assert!(HostAllowList::default().permits("anything"));
        let list = HostAllowList(vec!["Node1".into()]);
        assert!(list.permits("node1"));
        assert!(!list.permits("node2"));
    }

    #[test]
    fn stats_active_counts_unfinished_work() {
        let mut stats = QueueStats::default();
        stats.by_status[JobStatus::Pending.index()] = 2;
        stats.by_status[JobStatus::Reading.index()] = 1;
        stats.by_status[JobStatus::Confirmed.index()] = 5;
        assert_eq!(stats.active(), 3);
        assert_eq!(stats.total(), 8);
    }
}
