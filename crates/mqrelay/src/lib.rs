// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqrelay - pub/sub message repeater.
//!
//! Maintains independent connections to multiple brokers, routes every
//! inbound message through a static exact-match routing table, and forwards
//! it to other brokers, an append-only CSV log, or a SQLite last-value
//! store. A supervisor restarts dead connection workers; a connection that
//! exhausts its retry budget takes the whole relay down after disconnecting
//! every other instance.
//!
//! # Architecture
//!
//! ```text
//! RelayService
//! +-- InstanceRegistry    (per-instance settings + runtime state)
//! +-- RoutingTable        (static, read-only after build)
//! +-- ConnectionWorker    (one task per broker instance)
//! +-- Dispatcher          (one task, fans messages out to sinks)
//! +-- Supervisor          (restarts dead workers, escalates fatals)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mqrelay::{MqttConnector, RelayConfig, RelayService};
//! use std::sync::Arc;
//!
//! let config = RelayConfig::from_file("mqrelay.toml")?;
//! let service = RelayService::new(config, Arc::new(MqttConnector::new()))?;
//! service.run().await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod file_sink;
pub mod mqtt;
pub mod registry;
pub mod routing;
pub mod state_store;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::{BrokerSettings, InstanceKind, InstanceSettings, RelayConfig, ServiceSettings};
pub use dispatch::{Dispatcher, DispatchStats, DispatchStatsSnapshot, Inbound};
pub use error::{ConfigError, ConnectionError, RelayError, SinkError};
pub use file_sink::FileSink;
pub use mqtt::MqttConnector;
pub use registry::{ConnectionState, InstanceEntry, InstanceRegistry};
pub use routing::{RouteTarget, RoutingTable};
pub use state_store::{StateRow, StateStore};
pub use supervisor::Supervisor;
pub use transport::{BrokerConnector, BrokerEvent, BrokerLink, BrokerSession, MockConnector};
pub use worker::{ConnectionWorker, WorkerExit};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The assembled relay: validated configuration, prepared sinks, and the
/// wiring between workers, dispatcher, and supervisor.
pub struct RelayService {
    config: RelayConfig,
    registry: Arc<InstanceRegistry>,
    table: Arc<RoutingTable>,
    connector: Arc<dyn BrokerConnector>,
    files: HashMap<String, FileSink>,
    stores: HashMap<String, StateStore>,
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService").finish_non_exhaustive()
    }
}

impl RelayService {
    /// Validate configuration and prepare every sink.
    ///
    /// File sinks are probed for writability and SQLite sinks get their
    /// schema created, so misconfigured outputs fail here with a distinct
    /// exit code instead of at first dispatch.
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let table = Arc::new(RoutingTable::build(&config)?);
        let registry = Arc::new(InstanceRegistry::from_config(&config));

        let mut files = HashMap::new();
        let mut stores = HashMap::new();
        for (name, settings) in &config.instances {
            match settings {
                InstanceSettings::File(sink) => {
                    let path = sink.path.as_ref().ok_or_else(|| ConfigError::SinkLocation {
                        name: name.clone(),
                        reason: "missing path for file output".into(),
                    })?;
                    let file = FileSink::new(path.clone());
                    file.probe().map_err(|err| ConfigError::SinkLocation {
                        name: name.clone(),
                        reason: format!("{} not writable: {}", path.display(), err),
                    })?;
                    files.insert(name.clone(), file);
                }
                InstanceSettings::Sqlite(sink) => {
                    let path = sink.path.as_ref().ok_or_else(|| ConfigError::SinkLocation {
                        name: name.clone(),
                        reason: "missing path for sqlite output".into(),
                    })?;
                    let store =
                        StateStore::open(path).map_err(|err| ConfigError::SinkLocation {
                            name: name.clone(),
                            reason: format!("{} not usable: {}", path.display(), err),
                        })?;
                    stores.insert(name.clone(), store);
                }
                InstanceSettings::Broker(_) => {}
            }
        }

        Ok(Self {
            config,
            registry,
            table,
            connector,
            files,
            stores,
        })
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        self.registry.clone()
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.table.clone()
    }

    /// Run until a fatal error or until every worker stopped.
    pub async fn run(self) -> Result<(), RelayError> {
        let service = self.config.service.clone();
        tracing::info!(
            "starting relay: {} instances, {} routes",
            self.registry.len(),
            self.table.len()
        );

        let (tx, rx) = mpsc::channel(service.channel_capacity);
        let dispatcher = Dispatcher::new(
            self.table.clone(),
            self.registry.clone(),
            self.files,
            self.stores,
            Duration::from_millis(service.sink_timeout_ms),
        );
        let stats = dispatcher.stats();
        tokio::spawn(dispatcher.run(rx));

        if service.stats_interval_secs > 0 {
            let stats = stats.clone();
            let interval = Duration::from_secs(service.stats_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let snapshot = stats.snapshot();
                    tracing::info!(
                        "dispatch: {} received, {} forwarded, {} misses, {} sink errors",
                        snapshot.received,
                        snapshot.forwarded,
                        snapshot.route_misses,
                        snapshot.sink_errors
                    );
                }
            });
        }

        let mut supervisor = Supervisor::new(
            self.registry.clone(),
            self.table.clone(),
            self.connector.clone(),
            tx,
            service,
        );
        supervisor.spawn_all();
        supervisor.run().await
    }
}
