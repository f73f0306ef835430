//! Core domain types for the NetSchedule job queue.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobId and the JobStatus state machine
//! - Queue parameters, statistics and identity
//! - The notification datagram and text-line command codecs
//! - The error taxonomy and the abstract persistence store

mod address;
mod error;
mod job;
mod notification;
mod protocol;
mod queue;
mod store;

pub use address::ServerAddress;
pub use error::{ErrorCode, ProtocolError, QueueError, StoreError};
pub use job::{Job, JobId, JobSpec, JobStatus, MAX_TOKEN_LEN, WorkerId, validate_token};
pub use notification::{MAX_DATAGRAM_LEN, Notification, NotificationKind};
pub use protocol::{Command, JobDescriptor, MAX_LINE_LEN, Reply, WaitRequest};
pub use queue::{
    HostAllowList, QueueId, QueueInfo, QueueKind, QueueParams, QueueStats, duration_secs,
    to_delta,
};
pub use store::{DeletedVectors, JobStore, StoreFuture};
