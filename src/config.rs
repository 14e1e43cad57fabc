//! # Node Configuration
//!
//! Loads the node's TOML configuration. Every field has a default, so a
//! partial file (or a freshly written default one) is always usable.
//!
//! ```toml
//! log_level = "info"
//!
//! [node]
//! id = 5
//!
//! [broker]
//! host = "192.168.1.10"
//! port = 1883
//!
//! [topics]
//! root = "home/"
//! command = "{nodeid}/CMD"
//! ```

use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

use crate::mqtt::topic::{NodeTopics, DEFAULT_MAX_TOPIC_LEN};

const CONFIG_DIR: &str = ".config/nodelink";
const CONFIG_FILE: &str = "node.toml";
const CONFIG_ENV: &str = "NODELINK_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub publish: PublishConfig,
    pub reconnect: ReconnectConfig,
    pub wifi: WifiConfig,
    pub status: StatusConfig,
    /// Largest inbound payload accepted, after chunk reassembly
    pub max_payload_len: usize,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            broker: BrokerConfig::default(),
            topics: TopicConfig::default(),
            publish: PublishConfig::default(),
            reconnect: ReconnectConfig::default(),
            wifi: WifiConfig::default(),
            status: StatusConfig::default(),
            max_payload_len: 4096,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct NodeSection {
    pub id: u8,
    /// Defaults to `node-<id>`
    pub client_id: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
    pub clean_session: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 15,
            request_capacity: 100,
            clean_session: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub root: String,
    pub command: String,
    pub status: String,
    pub debug: String,
    pub max_len: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            root: "nodes/".to_string(),
            command: "{nodeid}/CMD".to_string(),
            status: "{nodeid}/STATUS".to_string(),
            debug: "{nodeid}/DEBUG".to_string(),
            max_len: DEFAULT_MAX_TOPIC_LEN,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    pub qos: u8,
    pub retain: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            qos: 1,
            retain: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before retrying the broker after an MQTT disconnect
    pub mqtt_retry_ms: u64,
    /// Pause after a WiFi drop before asking the link to reconnect
    pub wifi_settle_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mqtt_retry_ms: 2000,
            wifi_settle_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn mqtt_retry(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_ms)
    }

    pub fn wifi_settle(&self) -> Duration {
        Duration::from_millis(self.wifi_settle_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WifiConfig {
    /// Interface to watch; without one the link is treated as always up
    pub interface: Option<String>,
    pub poll_interval_ms: u64,
    /// Program and arguments run to bring the link back, e.g. `["nmcli", "device", "connect", "wlan0"]`
    pub reconnect_command: Vec<String>,
    pub disconnect_command: Vec<String>,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            interface: None,
            poll_interval_ms: 1000,
            reconnect_command: Vec::new(),
            disconnect_command: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    /// Heartbeat period on the status topic, 0 disables it
    pub interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl NodeConfig {
    /// `$NODELINK_CONFIG`, or `~/.config/nodelink/node.toml`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Writes the default configuration to `path` if nothing is there yet.
    ///
    /// Returns `true` when defaults were written. Runs before logging is set
    /// up, so the caller reports it.
    pub async fn ensure_default_config(path: &Path) -> Result<bool> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(false);
        }

        NodeConfig::default().save(path).await?;
        Ok(true)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        let config: NodeConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.publish_qos()?;
        self.log_level()?;
        self.topics()
            .validate()
            .map_err(|e| eyre!("Invalid topic configuration: {}", e))?;
        if self.broker.keep_alive_secs == 0 {
            return Err(eyre!("broker.keep_alive_secs must be at least 1"));
        }
        if self.broker.request_capacity == 0 {
            return Err(eyre!("broker.request_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn publish_qos(&self) -> Result<QoS> {
        qos_from_u8(self.publish.qos)
            .ok_or_else(|| eyre!("publish.qos must be 0, 1 or 2, got {}", self.publish.qos))
    }

    pub fn log_level(&self) -> Result<Level> {
        self.log_level
            .parse()
            .map_err(|_| eyre!("Unknown log level '{}'", self.log_level))
    }

    pub fn client_id(&self) -> String {
        self.node
            .client_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", self.node.id))
    }

    pub fn topics(&self) -> NodeTopics {
        NodeTopics {
            node_id: self.node.id,
            root: self.topics.root.clone(),
            command_template: self.topics.command.clone(),
            status_template: self.topics.status.clone(),
            debug_template: self.topics.debug.clone(),
            max_len: self.topics.max_len,
        }
    }
}

pub fn qos_from_u8(qos: u8) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.publish_qos().unwrap(), QoS::AtLeastOnce);
        assert_eq!(config.reconnect.mqtt_retry(), Duration::from_secs(2));
        assert_eq!(config.client_id(), "node-0");
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [node]
            id = 5

            [topics]
            root = "home/"
            command = "{nodeid}/cmd"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.id, 5);
        assert_eq!(config.topics.root, "home/");
        assert_eq!(config.topics.status, "{nodeid}/STATUS");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.topics().command().unwrap(), "home/5/cmd");
    }

    #[test]
    fn rejects_invalid_qos() {
        let mut config = NodeConfig::default();
        config.publish.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let mut config = NodeConfig::default();
        config.topics.command = "CMD".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_topic_root_too_long() {
        let mut config = NodeConfig::default();
        config.topics.root = "x".repeat(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = NodeConfig::default();
        config.log_level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn writes_and_reloads_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.toml");

        assert!(NodeConfig::ensure_default_config(&path).await.unwrap());
        let loaded = NodeConfig::load(&path).await.unwrap();
        assert_eq!(loaded, NodeConfig::default());
    }

    #[tokio::test]
    async fn ensure_default_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let mut config = NodeConfig::default();
        config.node.id = 42;
        config.save(&path).await.unwrap();

        assert!(!NodeConfig::ensure_default_config(&path).await.unwrap());
        assert_eq!(NodeConfig::load(&path).await.unwrap().node.id, 42);
    }
}
