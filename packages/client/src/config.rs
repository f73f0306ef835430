//! Client configuration.

use std::time::Duration;

use netschedule_core::{WorkerId, duration_secs};
use serde::{Deserialize, Serialize};

/// Pacing of one timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// How long a server that had nothing is left alone.
    #[serde(with = "duration_secs")]
    pub retry_timeout: Duration,
    /// Spacing of server re-enumeration.
    #[serde(with = "duration_secs")]
    pub discovery_period: Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(10),
            discovery_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub queue: String,
    /// Name this client reports as worker or reader.
    pub client: WorkerId,
    /// Local address of the notification socket.
    pub notification_bind: String,
    /// Bound on each request round trip.
    #[serde(with = "duration_secs")]
    pub receive_timeout: Duration,
    pub timeline: TimelineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            client: WorkerId::new("netschedule-client"),
            notification_bind: "0.0.0.0:0".to_string(),
            receive_timeout: Duration::from_secs(10),
            timeline: TimelineConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(queue: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            client: WorkerId::new(client),
            ..Default::default()
        }
    }
}
