//! Client side of the NetSchedule job queue.
//!
//! - [`NetScheduleClient`]: submit, inspect and cancel jobs
//! - [`JobExecutor`]: take jobs from every discovered server and report results
//! - [`JobReader`]: collect finished jobs
//!
//! Executors and readers are driven by a [`Timeline`] that polls servers
//! round-robin, defers idle ones and wakes early on UDP notifications.

mod affinity;
mod channel;
mod client;
mod config;
mod error;
mod executor;
mod listener;
mod modes;
mod notifications;
mod reader;
mod timeline;

pub use affinity::AffinityPreferences;
pub use channel::{
    DiscoveryFuture, JobChannel, RpcFuture, ServiceDiscovery, StaticDiscovery, TcpChannel, call,
};
pub use client::NetScheduleClient;
pub use config::{ClientConfig, TimelineConfig};
pub use error::{ClientError, RpcError};
pub use executor::JobExecutor;
pub use listener::NotificationListener;
pub use modes::{GetMode, PollMode, ReadMode};
pub use notifications::{ServerNotifications, WaitOutcome};
pub use reader::JobReader;
pub use timeline::{Outcome, Timeline, TimelineControl};
