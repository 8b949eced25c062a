//! Link configuration
//!
//! TOML file with every section optional, then `LINK_*` environment overrides.
//! Durations are integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatProfile, ProfileKind};
use crate::reconnect::BackoffConfig;
use crate::session::DriverSettings;
use crate::transfer::TransferConfig;
use crate::transport::{OpenOptions, UpgradeRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// ws:// or wss:// URL
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub upgrade: UpgradeSection,

    #[serde(default)]
    pub timeouts: TimeoutSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    #[serde(default)]
    pub backoff: BackoffSection,

    #[serde(default)]
    pub transfer: TransferSection,

    /// Inbound transport event channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Run re-authentication and re-subscription on the first open too
    #[serde(default)]
    pub recover_on_open: bool,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            upgrade: UpgradeSection::default(),
            timeouts: TimeoutSection::default(),
            heartbeat: HeartbeatSection::default(),
            backoff: BackoffSection::default(),
            transfer: TransferSection::default(),
            event_capacity: default_event_capacity(),
            recover_on_open: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSection {
    /// Overrides the path of the endpoint URL
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_upgrade_ms")]
    pub upgrade_ms: u64,
    #[serde(default = "default_send_ms")]
    pub send_ms: u64,
    /// Per recovery step
    #[serde(default = "default_recovery_ms")]
    pub recovery_ms: u64,
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
}

fn default_connect_ms() -> u64 {
    10_000
}
fn default_upgrade_ms() -> u64 {
    10_000
}
fn default_send_ms() -> u64 {
    5_000
}
fn default_recovery_ms() -> u64 {
    10_000
}
fn default_drain_ms() -> u64 {
    5_000
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            upgrade_ms: default_upgrade_ms(),
            send_ms: default_send_ms(),
            recovery_ms: default_recovery_ms(),
            drain_ms: default_drain_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default)]
    pub profile: ProfileKind,
    /// Deadline for each heartbeat reply
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures that force a disconnect
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            profile: ProfileKind::default(),
            timeout_ms: default_heartbeat_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed jitter seed for reproducible schedules
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_base_ms() -> u64 {
    1_000
}
fn default_cap_ms() -> u64 {
    30_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_max_attempts() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: default_max_attempts(),
            enabled: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_staging_capacity")]
    pub staging_capacity: usize,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_staging_capacity() -> usize {
    1024
}
fn default_ack_timeout_ms() -> u64 {
    2_000
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            staging_capacity: default_staging_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl LinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `LINK_CONFIG_PATH` (default `link.toml`), falling back to
    /// defaults, then apply `LINK_*` overrides
    pub fn from_env() -> Self {
        let path = std::env::var("LINK_CONFIG_PATH").unwrap_or_else(|_| "link.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default link config ({}): {}", path, e);
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `LINK_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LINK_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = lookup("LINK_CONNECT_TIMEOUT_MS") {
            self.timeouts.connect_ms = v.parse().unwrap_or(self.timeouts.connect_ms);
        }
        if let Some(v) = lookup("LINK_SEND_TIMEOUT_MS") {
            self.timeouts.send_ms = v.parse().unwrap_or(self.timeouts.send_ms);
        }
        if let Some(v) = lookup("LINK_HEARTBEAT_TIMEOUT_MS") {
            self.heartbeat.timeout_ms = v.parse().unwrap_or(self.heartbeat.timeout_ms);
        }
        if let Some(v) = lookup("LINK_HEARTBEAT_FAILURE_THRESHOLD") {
            self.heartbeat.failure_threshold = v.parse().unwrap_or(self.heartbeat.failure_threshold);
        }
        if let Some(v) = lookup("LINK_BACKOFF_BASE_MS") {
            self.backoff.base_ms = v.parse().unwrap_or(self.backoff.base_ms);
        }
        if let Some(v) = lookup("LINK_BACKOFF_CAP_MS") {
            self.backoff.cap_ms = v.parse().unwrap_or(self.backoff.cap_ms);
        }
        if let Some(v) = lookup("LINK_MAX_ATTEMPTS") {
            self.backoff.max_attempts = v.parse().unwrap_or(self.backoff.max_attempts);
        }
        if let Some(v) = lookup("LINK_RECONNECT_ENABLED") {
            self.backoff.enabled = v.parse().unwrap_or(self.backoff.enabled);
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(ConfigError::new("endpoint", "expected a ws:// or wss:// URL"));
        }
        let timeouts = [
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.upgrade_ms", self.timeouts.upgrade_ms),
            ("timeouts.send_ms", self.timeouts.send_ms),
            ("timeouts.recovery_ms", self.timeouts.recovery_ms),
            ("heartbeat.timeout_ms", self.heartbeat.timeout_ms),
            ("transfer.ack_timeout_ms", self.transfer.ack_timeout_ms),
            ("backoff.base_ms", self.backoff.base_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::new(field, "must be greater than zero"));
            }
        }
        if self.heartbeat.failure_threshold == 0 {
            return Err(ConfigError::new("heartbeat.failure_threshold", "must be at least 1"));
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(ConfigError::new("backoff.cap_ms", "must not be below backoff.base_ms"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigError::new("backoff.jitter_ratio", "must be within [0, 1]"));
        }
        if self.transfer.staging_capacity == 0 {
            return Err(ConfigError::new("transfer.staging_capacity", "must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::new("event_capacity", "must be at least 1"));
        }
        if let ProfileKind::Chain { profiles } = &self.heartbeat.profile {
            if profiles.is_empty() {
                return Err(ConfigError::new("heartbeat.profile", "chain needs at least one profile"));
            }
        }
        Ok(())
    }

    pub fn heartbeat_config(&self, profile: std::sync::Arc<dyn HeartbeatProfile>) -> HeartbeatConfig {
        HeartbeatConfig::new(
            profile,
            Duration::from_millis(self.heartbeat.timeout_ms),
            self.heartbeat.failure_threshold,
        )
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff.base_ms),
            cap: Duration::from_millis(self.backoff.cap_ms),
            jitter_ratio: self.backoff.jitter_ratio,
            max_attempts: self.backoff.max_attempts,
            enabled: self.backoff.enabled,
            seed: self.backoff.seed,
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            endpoint: self.endpoint.clone(),
            open: OpenOptions {
                connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
                event_capacity: self.event_capacity,
                ..OpenOptions::default()
            },
            upgrade: UpgradeRequest {
                path: self.upgrade.path.clone(),
                headers: self.upgrade.headers.clone(),
            },
            upgrade_timeout: Duration::from_millis(self.timeouts.upgrade_ms),
            send_timeout: Duration::from_millis(self.timeouts.send_ms),
            recovery_step_timeout: Duration::from_millis(self.timeouts.recovery_ms),
            drain_timeout: Duration::from_millis(self.timeouts.drain_ms),
            transfer: TransferConfig {
                staging_capacity: self.transfer.staging_capacity,
                ack_timeout: Duration::from_millis(self.transfer.ack_timeout_ms),
            },
            ..DriverSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: LinkConfig = toml::from_str(
            r#"
            endpoint = "wss://stream.example.com/ws"

            [heartbeat]
            timeout_ms = 750

            [heartbeat.profile]
            kind = "json_op"
            "#,
        )
        .unwrap();

        assert_eq!(config.heartbeat.timeout_ms, 750);
        assert_eq!(config.heartbeat.failure_threshold, 3);
        assert_eq!(
            config.heartbeat.profile,
            ProfileKind::JsonOp {
                field: "op".into(),
                probe: "ping".into(),
                reply: "pong".into(),
            }
        );
        assert_eq!(config.backoff, BackoffSection::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");

        let mut config = LinkConfig::new("ws://127.0.0.1:9001");
        config.backoff.seed = Some(7);
        config.upgrade.headers.push(("X-Api-Key".into(), "abc".into()));
        config.save(&path).unwrap();

        let loaded = LinkConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LinkConfig::load(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("LINK_ENDPOINT", "wss://override.example.com"),
            ("LINK_MAX_ATTEMPTS", "4"),
            ("LINK_BACKOFF_BASE_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = LinkConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.endpoint, "wss://override.example.com");
        assert_eq!(config.backoff.max_attempts, 4);
        assert_eq!(config.backoff.base_ms, 1_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LinkConfig::new("https://not-a-websocket");
        assert_eq!(config.validate().unwrap_err().field, "endpoint");

        config.endpoint = "wss://ok".into();
        config.heartbeat.failure_threshold = 0;
        assert_eq!(config.validate().unwrap_err().field, "heartbeat.failure_threshold");

        config.heartbeat.failure_threshold = 3;
        config.backoff.cap_ms = 10;
        assert_eq!(config.validate().unwrap_err().field, "backoff.cap_ms");

        config.backoff.cap_ms = 30_000;
        config.backoff.jitter_ratio = 1.5;
        assert_eq!(config.validate().unwrap_err().field, "backoff.jitter_ratio");
    }

    #[test]
    fn test_conversions() {
        let mut config = LinkConfig::new("ws://localhost:1234/stream");
        config.timeouts.send_ms = 250;
        config.transfer.ack_timeout_ms = 100;

        let settings = config.driver_settings();
        assert_eq!(settings.endpoint, "ws://localhost:1234/stream");
        assert_eq!(settings.send_timeout, Duration::from_millis(250));
        assert_eq!(settings.transfer.ack_timeout, Duration::from_millis(100));

        let backoff = config.backoff_config();
        assert_eq!(backoff, BackoffConfig::default());

        let heartbeat = config.heartbeat_config(config.heartbeat.profile.build());
        assert_eq!(heartbeat.profile_name(), "control_ping");
        assert_eq!(heartbeat.timeout(), Duration::from_secs(5));
    }
}
