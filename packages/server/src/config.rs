//! Server configuration loaded from a JSON file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use db::DbConfig;
use netschedule_core::{QueueParams, ServerAddress, duration_secs};
use serde::{Deserialize, Serialize};

use crate::messages::ServerError;
use crate::supervisor::StaticQueue;

/// Where job records live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process memory; nothing survives a restart.
    #[default]
    Memory,
    /// SurrealDB; the job tables survive restarts with a persistent endpoint.
    Surreal(DbConfig),
}

/// A statically configured queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Take parameters from this class.
    pub class: Option<String>,
    /// Explicit parameters; win over the class.
    pub params: Option<QueueParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address for requests.
    pub listen: String,
    /// `host:port` clients know this server by; defaults to `listen`.
    pub advertise: Option<String>,
    /// Local address of the notification socket.
    pub udp_bind: String,
    #[serde(with = "duration_secs")]
    pub housekeeping_interval: Duration,
    /// Jobs physically removed per queue and housekeeping pass.
    pub purge_batch: usize,
    pub store: StoreConfig,
    /// Parameter sets dynamic queues are created from.
    pub classes: BTreeMap<String, QueueParams>,
    pub queues: BTreeMap<String, QueueConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9100".to_string(),
            advertise: None,
            udp_bind: "0.0.0.0:0".to_string(),
            housekeeping_interval: Duration::from_secs(1),
            purge_batch: 500,
            store: StoreConfig::default(),
            classes: BTreeMap::new(),
            queues: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> Result<Self, ServerError> {
        serde_json::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Identity carried in notification datagrams.
    pub fn node_address(&self) -> Result<ServerAddress, ServerError> {
        let raw = self.advertise.as_deref().unwrap_or(&self.listen);
        raw.parse()
            .map_err(|e| ServerError::Config(format!("advertise address: {}", e)))
    }

    /// Static queues with their class parameters resolved.
    pub fn static_queues(&self) -> Result<Vec<StaticQueue>, ServerError> {
        self.queues
            .iter()
            .map(|(name, queue)| {
                let params = match (&queue.params, &queue.class) {
                    (Some(params), _) => Some(params.clone()),
                    (None, Some(class)) => Some(self.classes.get(class).cloned().ok_or_else(
                        || ServerError::Config(format!("queue {}: unknown class {}", name, class)),
                    )?),
                    (None, None) => None,
                };
                Ok(StaticQueue {
                    name: name.clone(),
                    params,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(
            config.node_address().unwrap(),
            ServerAddress::new("127.0.0.1", 9100)
        );
    }

    #[test]
    fn loads_queues_classes_and_store_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen": "0.0.0.0:9100",
                "advertise": "ns1.example.org:9100",
                "housekeeping_interval": 5,
                "store": {{"kind": "surreal", "endpoint": "mem://"}},
                "classes": {{"scratch": {{"failed_retries": 0}}}},
                "queues": {{
                    "render": {{"params": {{"run_timeout": 60}}}},
                    "tmp": {{"class": "scratch"}},
                    "plain": {{}}
                }}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.housekeeping_interval, Duration::from_secs(5));
        assert_eq!(
            config.store,
            StoreConfig::Surreal(DbConfig::at("mem://"))
        );
        assert_eq!(
            config.node_address().unwrap(),
            ServerAddress::new("ns1.example.org", 9100)
        );

        let queues = config.static_queues().unwrap();
        let names: Vec<&str> = queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["plain", "render", "tmp"]);
        assert!(queues[0].params.is_none());
        assert_eq!(
            queues[1].params.as_ref().unwrap().run_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(queues[2].params.as_ref().unwrap().failed_retries, 0);
    }

    #[test]
    fn unknown_class_is_a_config_error() {
        let config =
            ServerConfig::from_json(r#"{"queues": {"q": {"class": "nope"}}}"#).unwrap();
        assert!(matches!(config.static_queues(), Err(ServerError::Config(_))));
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(matches!(
            ServerConfig::from_json("{"),
            Err(ServerError::Config(_))
        ));
    }
}
