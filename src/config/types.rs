//! Connection and engine configuration types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sftp::retry::RetryConfig;
use crate::sftp::types::ConflictPolicy;

/// Current version of the saved-connections file
pub const CONFIG_VERSION: u32 = 1;

/// Opaque connection identifier, generated when a connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::UnknownConnection(s.to_string()))
    }
}

/// Authentication method of a connection. The secret itself lives in the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    PrivateKey,
}

fn default_port() -> u16 {
    22
}

/// Connection parameters as entered by the user (no secrets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Display label
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
}

impl ConnectionConfig {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Reject configurations the connection form would not submit.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("connection name is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host is required".into()));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(Error::InvalidConfig(format!(
                "host {:?} contains whitespace",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be between 1 and 65535".into()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username is required".into()));
        }
        Ok(())
    }

    /// `user@host:port`, for logs
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Host key handling for the SSH transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Trust and record unknown hosts, reject changed keys
    #[default]
    AcceptNew,
    /// Reject unknown and changed keys
    Strict,
    /// Accept any key without recording it
    AcceptAny,
}

/// Transfer manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per chunk; progress and resume offsets land on chunk boundaries
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Transfers running at once; the rest stay Queued
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// How long Failed tasks stay available for retry
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_max_concurrent() -> usize {
    3
}

fn default_failed_retention_secs() -> u64 {
    600
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            retry: RetryConfig::default(),
            failed_retention_secs: default_failed_retention_secs(),
        }
    }
}

impl TransferConfig {
    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }
}

/// Engine-wide settings, loadable from JSON with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent operations admitted per session
    #[serde(default = "default_max_inflight_ops")]
    pub max_inflight_ops: usize,

    /// Operations allowed to wait for admission before `Overloaded`
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// SFTP channels per session
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    /// Seconds between liveness probes (0 = disabled)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Listing cache lifetime (0 = disabled)
    #[serde(default = "default_listing_cache_ttl_ms")]
    pub listing_cache_ttl_ms: u64,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// Upper bound for `read_file`
    #[serde(default = "default_read_limit_bytes")]
    pub read_limit_bytes: u64,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_max_inflight_ops() -> usize {
    8
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_max_channels() -> usize {
    4
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_op_timeout_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_listing_cache_ttl_ms() -> u64 {
    2000
}

fn default_read_limit_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inflight_ops: default_max_inflight_ops(),
            max_queue_depth: default_max_queue_depth(),
            max_channels: default_max_channels(),
            connect_timeout_secs: default_connect_timeout_secs(),
            op_timeout_secs: default_op_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            conflict_policy: ConflictPolicy::default(),
            listing_cache_ttl_ms: default_listing_cache_ttl_ms(),
            transfer: TransferConfig::default(),
            read_limit_bytes: default_read_limit_bytes(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_inflight_ops == 0 {
            return Err(Error::InvalidConfig("max_inflight_ops must be at least 1".into()));
        }
        if self.max_channels == 0 {
            return Err(Error::InvalidConfig("max_channels must be at least 1".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::InvalidConfig("transfer.chunk_size must be at least 1".into()));
        }
        if self.transfer.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "transfer.max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn listing_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.listing_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_connection() {
        let ok = ConnectionConfig::new("prod", "example.com", 22, "deploy");
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.host = "  ".into();
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));

        let mut bad = ok.clone();
        bad.port = 0;
        assert!(bad.validate().is_err());

        let mut bad = ok;
        bad.username = String::new();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_engine_defaults_from_empty_json() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_inflight_ops, 8);
        assert_eq!(config.transfer.chunk_size, 256 * 1024);
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_engine_partial_json() {
        let config = EngineConfig::from_json(
            r#"{"max_channels": 2, "heartbeat_interval_secs": 0,
                "conflict_policy": "overwrite", "transfer": {"chunk_size": 1024}}"#,
        )
        .unwrap();
        assert_eq!(config.max_channels, 2);
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.conflict_policy, ConflictPolicy::Overwrite);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.max_concurrent, 3);
    }

    #[test]
    fn test_engine_rejects_zero_limits() {
        assert!(EngineConfig::from_json(r#"{"max_channels": 0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"transfer": {"chunk_size": 0}}"#).is_err());
    }

    #[test]
    fn test_connection_id_parse() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().parse::<ConnectionId>().unwrap(), id);
        assert!("nope".parse::<ConnectionId>().is_err());
    }
}
