//! Job domain types and the job status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Maximum length of an affinity or group token.
pub const MAX_TOKEN_LEN: usize = 255;

/// Per-queue job identifier, allocated from a monotonic counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl JobId {
    /// Parse a job key as sent on the wire.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a worker node or reader client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
///
/// Transitions are restricted to the edges returned by
/// [`JobStatus::can_transition_to`]:
///
/// ```text
/// Pending  -> Running | Canceled
/// Running  -> Done | Failed | Returned | Canceled
/// Returned -> Pending | Canceled
/// Done     -> Reading | Canceled
/// Reading  -> Confirmed | ReadFailed | Canceled
/// ReadFailed -> Canceled
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted and waiting for a worker.
    #[default]
    Pending,
    /// Handed to a worker.
    Running,
    /// Given back by its worker, about to be requeued.
    Returned,
    /// Finished successfully, result not read yet.
    Done,
    /// Failed after exhausting its retries.
    Failed,
    /// Result handed to a reader.
    Reading,
    /// Reader confirmed the result.
    Confirmed,
    /// Reader reported it could not process the result.
    ReadFailed,
    /// Canceled before reaching a terminal state.
    Canceled,
}

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Returned,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Reading,
        JobStatus::Confirmed,
        JobStatus::ReadFailed,
        JobStatus::Canceled,
    ];

    /// Dense index, usable for per-status tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Confirmed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Check if `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (s, Canceled) => !s.is_terminal(),
            (Pending, Running) => true,
            (Running, Done | Failed | Returned) => true,
            (Returned, Pending) => true,
            (Done, Reading) => true,
            (Reading, Confirmed | ReadFailed) => true,
            _ => false,
        }
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Returned => "returned",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Reading => "reading",
            JobStatus::Confirmed => "confirmed",
            JobStatus::ReadFailed => "read_failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::validation("status", s, "unknown job status"))
    }
}

/// Check an affinity or group token against the allowed character set.
///
/// Tokens are non-empty, at most [`MAX_TOKEN_LEN`] bytes, and consist of
/// ASCII alphanumerics plus `_ - . : @ /`. Commas and whitespace are
/// reserved as list separators on the wire.
pub fn validate_token(field: &'static str, token: &str) -> Result<(), QueueError> {
    if token.is_empty() {
        return Err(QueueError::validation(field, token, "empty token"));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(QueueError::validation(field, token, "token too long"));
    }
    match token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '@' | '/')))
    {
        Some(bad) => Err(QueueError::validation(
            field,
            token,
            format!("character {bad:?} is not allowed"),
        )),
        None => Ok(()),
    }
}

/// What a submitter hands to a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Opaque job input.
    pub input: String,
    /// Optional affinity token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
    /// Optional group token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl JobSpec {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Set the affinity token for this job.
    pub fn with_affinity(mut self, affinity: impl Into<String>) -> Self {
        self.affinity = Some(affinity.into());
        self
    }

    /// Set the group token for this job.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Validate the affinity and group tokens.
    pub fn validate(&self) -> Result<(), QueueError> {
        if let Some(affinity) = &self.affinity {
            validate_token("affinity", affinity)?;
        }
        if let Some(group) = &self.group {
            validate_token("group", group)?;
        }
        Ok(())
    }
}

/// A job owned by one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier, unique within the owning queue.
    pub id: JobId,
    /// Name of the owning queue.
    pub queue: String,
    /// Current status.
    pub status: JobStatus,
    /// Opaque job input.
    pub input: String,
    /// Output reported by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Last error reported by a worker or reader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Worker (while Running) or reader (while Reading) holding the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<WorkerId>,
    /// Number of failed runs so far.
    #[serde(default)]
    pub retries: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job from a submission.
    pub fn new(id: JobId, queue: impl Into<String>, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: queue.into(),
            status: JobStatus::Pending,
            input: spec.input,
            output: None,
            error: None,
            affinity: spec.affinity,
            group: spec.group,
            owner: None,
            retries: 0,
            submitted_at: now,
            started_at: None,
            updated_at: now,
        }
    }

    /// Check whether `worker` currently holds this job.
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_edges_are_legal() {
        use JobStatus::*;
        let legal = [
            (Pending, Running),
            (Pending, Canceled),
            (Running, Done),
            (Running, Failed),
            (Running, Returned),
            (Running, Canceled),
            (Returned, Pending),
            (Returned, Canceled),
            (Done, Reading),
            (Done, Canceled),
            (Reading, Confirmed),
            (Reading, ReadFailed),
            (Reading, Canceled),
            (ReadFailed, Canceled),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(JobStatus::ALL.iter().all(|next| !status.can_transition_to(*next)));
        }
    }

    #[test]
    fn status_names_parse_back() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().ok(), Some(status));
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn token_character_set() {
        assert!(validate_token("affinity", "gpu-node_1.a:b@c/d").is_ok());
        assert!(validate_token("affinity", "").is_err());
        assert!(validate_token("affinity", "has space").is_err());
        assert!(validate_token("affinity", "a,b").is_err());
        assert!(validate_token("group", &"x".repeat(MAX_TOKEN_LEN + 1)).is_err());
    }

    #[test]
    fn spec_validation_rejects_bad_group() {
        let spec = JobSpec::new("in").with_affinity("ok").with_group("bad group");
        assert!(matches!(spec.validate(), Err(QueueError::Validation { .. })));
    }
}
