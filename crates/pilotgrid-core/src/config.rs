//! pilotgrid.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pilot argument layouts this build knows how to produce.
pub const SUPPORTED_PILOT_PROTOCOLS: &[&str] = &["0.2"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pilot.max_memory_mb must be greater than zero")]
    ZeroMemoryCeiling,

    #[error("pilot.processors_per_node must be greater than zero")]
    ZeroProcessors,

    #[error("unsupported pilot protocol version: {0}")]
    UnsupportedProtocol(String),

    #[error("pilot needs at least one of ssh_contact or http_contact")]
    NoNotificationContact,

    #[error("network {0} is declared twice")]
    DuplicateNetwork(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotGridConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pilot: PilotConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub creation: CreationConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pilotgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

/// How pilot jobs are submitted to the batch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub submit_path: String,
    pub cancel_path: String,
    pub pilot_path: String,
    pub queue: Option<String>,
    pub account: Option<String>,
    pub job_name: String,
    pub processors_per_node: u32,
    /// Largest VM memory a single node can host.
    pub max_memory_mb: u64,
    /// Seconds the pilot gives a VM to shut down before killing it.
    pub grace_secs: u64,
    /// Seconds added to the job walltime on top of the VM duration.
    pub padding_secs: u64,
    pub protocol_version: String,
    pub ssh_contact: Option<String>,
    pub http_contact: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            submit_path: "qsub".to_string(),
            cancel_path: "qdel".to_string(),
            pilot_path: "/opt/pilotgrid/bin/pilot".to_string(),
            queue: None,
            account: None,
            job_name: "pilotgrid-slot".to_string(),
            processors_per_node: 1,
            max_memory_mb: 3584,
            grace_secs: 8,
            padding_secs: 10,
            protocol_version: "0.2".to_string(),
            ssh_contact: None,
            http_contact: Some("http://localhost:8443/pilot/v1/notify".to_string()),
            command_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub http_enabled: bool,
    /// Append-only log the pilots write to over SSH.
    pub log_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub cursor_debounce_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            log_path: None,
            poll_interval_ms: 1000,
            cursor_debounce_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreationConfig {
    pub idempotency_enabled: bool,
    pub idempotency_lock_timeout_ms: u64,
    pub max_group_size: u32,
    pub max_duration_secs: u64,
    pub max_cpu_count: u32,
    pub default_charge_ratio: f64,
    /// Where the context bootstrap file lands inside the guest.
    pub bootstrap_path: String,
    pub first_notification_delay_ms: u64,
    pub second_notification_delay_ms: u64,
}

impl Default for CreationConfig {
    fn default() -> Self {
        Self {
            idempotency_enabled: true,
            idempotency_lock_timeout_ms: 30_000,
            max_group_size: 64,
            max_duration_secs: 7 * 24 * 3600,
            max_cpu_count: 32,
            default_charge_ratio: 1.0,
            bootstrap_path: "/var/lib/pilotgrid/ctx-bootstrap.txt".to_string(),
            first_notification_delay_ms: 20,
            second_notification_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub enabled: bool,
    /// Cap on outstanding charged minutes per creator.
    pub max_minutes_per_creator: Option<u64>,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_minutes_per_creator: None,
        }
    }
}

/// A named pool of addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<NetworkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEntry {
    pub ip: String,
    pub hostname: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl PilotGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PilotGridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pilot.max_memory_mb == 0 {
            return Err(ConfigError::ZeroMemoryCeiling);
        }
        if self.pilot.processors_per_node == 0 {
            return Err(ConfigError::ZeroProcessors);
        }
        if !SUPPORTED_PILOT_PROTOCOLS.contains(&self.pilot.protocol_version.as_str()) {
            return Err(ConfigError::UnsupportedProtocol(
                self.pilot.protocol_version.clone(),
            ));
        }
        if self.pilot.ssh_contact.is_none() && self.pilot.http_contact.is_none() {
            return Err(ConfigError::NoNotificationContact);
        }
        let mut seen = std::collections::HashSet::new();
        for net in &self.networks {
            if !seen.insert(net.name.as_str()) {
                return Err(ConfigError::DuplicateNetwork(net.name.clone()));
            }
        }
        Ok(())
    }

    /// Path of the redb database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join("pilotgrid.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PilotGridConfig::default().validate().is_ok());
    }

    #[test]
    fn parse_minimal() {
        let config: PilotGridConfig = toml::from_str("").unwrap();
        assert_eq!(config.pilot.protocol_version, "0.2");
        assert_eq!(config.creation.first_notification_delay_ms, 20);
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[pilot]
queue = "vms"
max_memory_mb = 2048
processors_per_node = 8
ssh_contact = "nimbus@head:/var/log/pilot-notifications"

[notifications]
log_path = "/var/log/pilot-notifications"
poll_interval_ms = 500

[[networks]]
name = "public"
entries = [
    { ip = "10.0.0.10", hostname = "vm10" },
    { ip = "10.0.0.11", hostname = "vm11", gateway = "10.0.0.1" },
]
"#;
        let config: PilotGridConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pilot.queue.as_deref(), Some("vms"));
        assert_eq!(config.pilot.processors_per_node, 8);
        assert_eq!(config.networks[0].entries.len(), 2);
        assert_eq!(config.notifications.poll_interval_ms, 500);
        // Fields not mentioned keep their defaults.
        assert_eq!(config.pilot.grace_secs, 8);
    }

    #[test]
    fn rejects_unknown_protocol() {
        let mut config = PilotGridConfig::default();
        config.pilot.protocol_version = "0.1".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedProtocol("0.1".to_string()))
        );
    }

    #[test]
    fn rejects_missing_contact() {
        let mut config = PilotGridConfig::default();
        config.pilot.http_contact = None;
        assert_eq!(config.validate(), Err(ConfigError::NoNotificationContact));
    }

    #[test]
    fn rejects_duplicate_networks() {
        let mut config = PilotGridConfig::default();
        let net = NetworkConfig {
            name: "private".to_string(),
            entries: Vec::new(),
        };
        config.networks = vec![net.clone(), net];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateNetwork(_))
        ));
    }

    #[test]
    fn from_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilotgrid.toml");
        let config = PilotGridConfig::default();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = PilotGridConfig::from_file(&path).unwrap();
        assert_eq!(loaded.api.port, 8443);
        assert_eq!(loaded.db_path(), PathBuf::from("/var/lib/pilotgrid/pilotgrid.redb"));
    }
}
