// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! A configuration file declares named instances (broker connections and
//! passive sinks) and the static routing rules between them:
//!
//! ```toml
//! [instances.home]
//! kind = "broker"
//! server = "127.0.0.1"
//! port = 1883
//!
//! [instances.archive]
//! kind = "file"
//! path = "/var/log/mqrelay/archive.csv"
//!
//! [instances.state]
//! kind = "sqlite"
//! path = "/var/tmp/mqrelay.db"
//!
//! [[routes]]
//! from = "home"
//! topic = "/home/sensor/temp"
//! to = "state"
//! ```
//!
//! Optional broker fields fall back to documented defaults; `label` defaults
//! to the instance name. Shape validation happens here; cross-reference
//! checks (routes naming undeclared instances) happen when the routing table
//! is built, and environment checks (sink writability, schema creation)
//! happen at bootstrap.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level parsed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Declared instances by name.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSettings>,

    /// Routing rules, in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteLine>,

    /// Service-level timing knobs.
    #[serde(default)]
    pub service: ServiceSettings,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate instance shapes. Route cross-references are checked by
    /// [`crate::routing::RoutingTable::build`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in &self.instances {
            match settings {
                InstanceSettings::Broker(broker) => {
                    if broker.server.is_empty() {
                        return Err(ConfigError::Invalid {
                            name: name.clone(),
                            reason: "server must not be empty".into(),
                        });
                    }
                    if broker.qos > 2 {
                        return Err(ConfigError::Invalid {
                            name: name.clone(),
                            reason: format!("qos {} out of range (0..=2)", broker.qos),
                        });
                    }
                    if broker.tls && broker.cacert.is_none() {
                        return Err(ConfigError::Invalid {
                            name: name.clone(),
                            reason: "tls enabled but no cacert given".into(),
                        });
                    }
                }
                InstanceSettings::File(sink) => {
                    if sink.path.is_none() {
                        return Err(ConfigError::SinkLocation {
                            name: name.clone(),
                            reason: "missing path for file output".into(),
                        });
                    }
                }
                InstanceSettings::Sqlite(sink) => {
                    if sink.path.is_none() {
                        return Err(ConfigError::SinkLocation {
                            name: name.clone(),
                            reason: "missing path for sqlite output".into(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Example configuration for `mqrelay gen-config`.
    pub fn example() -> Self {
        let mut instances = BTreeMap::new();
        instances.insert(
            "home".to_string(),
            InstanceSettings::Broker(BrokerSettings {
                server: "127.0.0.1".into(),
                port: 1883,
                ..BrokerSettings::default()
            }),
        );
        instances.insert(
            "cloud".to_string(),
            InstanceSettings::Broker(BrokerSettings {
                username: "relay".into(),
                password: "secret".into(),
                server: "broker.example.net".into(),
                port: 8883,
                tls: true,
                cacert: Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt")),
                ..BrokerSettings::default()
            }),
        );
        instances.insert(
            "archive".to_string(),
            InstanceSettings::File(FileSettings {
                path: Some(PathBuf::from("/var/log/mqrelay/archive.csv")),
            }),
        );
        instances.insert(
            "state".to_string(),
            InstanceSettings::Sqlite(SqliteSettings {
                path: Some(PathBuf::from("/var/tmp/mqrelay.db")),
            }),
        );

        Self {
            instances,
            routes: vec![
                RouteLine {
                    from: "home".into(),
                    topic: "/home/sensor/temp".into(),
                    to: "cloud".into(),
                    publish_topic: Some("/mirror/temp".into()),
                },
                RouteLine {
                    from: "home".into(),
                    topic: "/home/sensor/temp".into(),
                    to: "state".into(),
                    publish_topic: None,
                },
                RouteLine {
                    from: "home".into(),
                    topic: "/home/sensor/humidity".into(),
                    to: "archive".into(),
                    publish_topic: None,
                },
            ],
            service: ServiceSettings::default(),
        }
    }
}

/// A declared endpoint: broker connection or passive sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstanceSettings {
    Broker(BrokerSettings),
    File(FileSettings),
    Sqlite(SqliteSettings),
}

impl InstanceSettings {
    /// Lightweight discriminant for routing and dispatch.
    pub fn kind(&self) -> InstanceKind {
        match self {
            Self::Broker(_) => InstanceKind::Broker,
            Self::File(_) => InstanceKind::File,
            Self::Sqlite(_) => InstanceKind::Sqlite,
        }
    }
}

/// Instance kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Broker,
    File,
    Sqlite,
}

impl InstanceKind {
    /// Sinks never initiate subscriptions and get no connection worker.
    pub fn is_sink(self) -> bool {
        matches!(self, Self::File | Self::Sqlite)
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Account name, empty for anonymous access.
    #[serde(default)]
    pub username: String,

    /// Account password. Redacted in logs.
    #[serde(default)]
    pub password: String,

    /// Broker host name or address.
    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Client identifier; generated from the instance name when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Quality-of-service level (0..=2) used for subscriptions on this
    /// instance and for publishes directed at it.
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Connect attempts before the process gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Enable TLS; requires `cacert`.
    #[serde(default)]
    pub tls: bool,

    /// CA certificate bundle path for TLS.
    #[serde(default)]
    pub cacert: Option<PathBuf>,

    /// Label recorded as `source_label` in the last-value store.
    /// Defaults to the instance name.
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            server: String::new(),
            port: default_port(),
            keepalive: default_keepalive(),
            client_id: None,
            qos: default_qos(),
            max_retries: default_max_retries(),
            tls: false,
            cacert: None,
            label: None,
        }
    }
}

/// Append-only CSV sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    pub path: Option<PathBuf>,
}

/// SQLite last-value sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSettings {
    pub path: Option<PathBuf>,
}

/// One routing rule. Broker destinations need a `publish_topic`; file and
/// sqlite destinations ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLine {
    /// Source instance name.
    pub from: String,

    /// Incoming topic, matched exactly.
    pub topic: String,

    /// Destination instance name.
    pub to: String,

    /// Outgoing topic for broker destinations.
    #[serde(default)]
    pub publish_topic: Option<String>,
}

/// Service-level timing settings. Defaults match the operational values the
/// relay has always used; tests compress them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Delay between connect attempts, milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Settle delay after an unexpected disconnect, milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Delay before a dead worker is restarted, milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Bound on any single sink call, milliseconds.
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,

    /// Inbound message channel capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Dispatch statistics logging interval, seconds (0 disables).
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            sink_timeout_ms: default_sink_timeout_ms(),
            channel_capacity: default_channel_capacity(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    3600
}

fn default_qos() -> u8 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_restart_delay_ms() -> u64 {
    500
}

fn default_sink_timeout_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_stats_interval_secs() -> u64 {
    10
}
