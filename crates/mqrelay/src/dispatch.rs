// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message dispatch.
//!
//! The dispatcher consumes typed inbound messages from every connection
//! worker over one channel, consults the routing table, and fans each
//! message out to its destinations in declaration order.
//!
//! Every sink call is bounded by a timeout and its failure is isolated:
//! a destination that errors or stalls is logged and counted, and dispatch
//! proceeds to the remaining destinations. Blocking sinks (file append,
//! SQLite upsert) run on the blocking pool so a slow disk never stalls the
//! event loop.

use crate::config::InstanceKind;
use crate::error::SinkError;
use crate::file_sink::FileSink;
use crate::registry::InstanceRegistry;
use crate::routing::{RouteTarget, RoutingTable};
use crate::state_store::StateStore;
use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Typed inbound message emitted by a connection worker.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Source instance name.
    pub instance: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub route_misses: AtomicU64,
    pub sink_errors: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            route_misses: self.route_misses.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub route_misses: u64,
    pub sink_errors: u64,
}

/// Routes inbound messages to broker, file, and sqlite destinations.
pub struct Dispatcher {
    table: Arc<RoutingTable>,
    registry: Arc<InstanceRegistry>,
    files: HashMap<String, FileSink>,
    stores: HashMap<String, StateStore>,
    stats: Arc<DispatchStats>,
    sink_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        table: Arc<RoutingTable>,
        registry: Arc<InstanceRegistry>,
        files: HashMap<String, FileSink>,
        stores: HashMap<String, StateStore>,
        sink_timeout: Duration,
    ) -> Self {
        Self {
            table,
            registry,
            files,
            stores,
            stats: Arc::new(DispatchStats::default()),
            sink_timeout,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Consume the inbound channel until every worker is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(msg) = rx.recv().await {
            self.dispatch(msg).await;
        }
        tracing::debug!("dispatcher channel closed");
    }

    /// Fan one message out to all of its destinations.
    pub async fn dispatch(&self, msg: Inbound) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let targets = self.table.lookup(&msg.instance, &msg.topic);
        if targets.is_empty() {
            self.stats.route_misses.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "no matching topic for ('{}') {}, ignoring",
                msg.instance,
                msg.topic
            );
            return;
        }

        let label = self
            .registry
            .get(&msg.instance)
            .map(|entry| entry.label().to_string())
            .unwrap_or_else(|| msg.instance.clone());

        for target in targets {
            match self.forward(&msg, &label, target).await {
                Ok(()) => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("{} -> forward ({})", target.instance, msg.topic);
                }
                Err(err) => {
                    self.stats.sink_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("dispatch to '{}' failed: {}", target.instance, err);
                }
            }
        }
    }

    async fn forward(
        &self,
        msg: &Inbound,
        label: &str,
        target: &RouteTarget,
    ) -> Result<(), SinkError> {
        let timeout_ms = self.sink_timeout.as_millis() as u64;
        let timed_out = || SinkError::Timeout {
            instance: target.instance.clone(),
            timeout_ms,
        };

        match target.kind {
            InstanceKind::Broker => {
                let session = self
                    .registry
                    .get(&target.instance)
                    .and_then(|entry| entry.session())
                    .ok_or_else(|| SinkError::NoSession {
                        instance: target.instance.clone(),
                    })?;
                let qos = self
                    .registry
                    .get(&target.instance)
                    .and_then(|entry| entry.broker())
                    .map(|broker| broker.qos)
                    .unwrap_or(1);
                let topic = target.publish_topic.as_deref().unwrap_or(&msg.topic);

                tokio::time::timeout(self.sink_timeout, session.publish(topic, &msg.payload, qos))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|source| SinkError::Publish {
                        instance: target.instance.clone(),
                        source,
                    })
            }
            InstanceKind::File => {
                let sink = self.files.get(&target.instance).cloned().ok_or_else(|| {
                    SinkError::Append {
                        instance: target.instance.clone(),
                        source: io::Error::new(io::ErrorKind::NotFound, "sink not prepared"),
                    }
                })?;
                let timestamp = Utc::now().to_rfc3339();
                let instance = msg.instance.clone();
                let topic = msg.topic.clone();
                let payload = String::from_utf8_lossy(&msg.payload).into_owned();

                let write = tokio::task::spawn_blocking(move || {
                    sink.append(&timestamp, &instance, &topic, &payload)
                });
                tokio::time::timeout(self.sink_timeout, write)
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|_| SinkError::Task {
                        instance: target.instance.clone(),
                    })?
                    .map_err(|source| SinkError::Append {
                        instance: target.instance.clone(),
                        source,
                    })
            }
            InstanceKind::Sqlite => {
                let store = self.stores.get(&target.instance).cloned().ok_or_else(|| {
                    SinkError::Upsert {
                        instance: target.instance.clone(),
                        source: rusqlite::Error::InvalidQuery,
                    }
                })?;
                let timestamp = Utc::now().to_rfc3339();
                let label = label.to_string();
                let feed = msg.topic.clone();
                let value = String::from_utf8_lossy(&msg.payload).into_owned();

                let write = tokio::task::spawn_blocking(move || {
                    store.upsert(&label, &feed, &value, &timestamp)
                });
                tokio::time::timeout(self.sink_timeout, write)
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|_| SinkError::Task {
                        instance: target.instance.clone(),
                    })?
                    .map_err(|source| SinkError::Upsert {
                        instance: target.instance.clone(),
                        source,
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::ConnectionState;
    use crate::routing::RoutingTable;
    use crate::transport::{BrokerConnector, MockConnector};

    const CONFIG: &str = r#"
        [instances.a]
        kind = "broker"
        server = "127.0.0.1"

        [instances.b]
        kind = "broker"
        server = "127.0.0.2"
        qos = 2

        [instances.archive]
        kind = "file"
        path = "/tmp/archive.csv"

        [instances.state]
        kind = "sqlite"
        path = "/tmp/state.db"

        [[routes]]
        from = "a"
        topic = "/home/sensor/temp"
        to = "b"
        publish_topic = "/mirror/temp"

        [[routes]]
        from = "a"
        topic = "/home/sensor/temp"
        to = "state"

        [[routes]]
        from = "a"
        topic = "/home/sensor/humidity"
        to = "archive"
    "#;

    struct Fixture {
        dispatcher: Dispatcher,
        connector: MockConnector,
        registry: Arc<InstanceRegistry>,
        store: StateStore,
        file: FileSink,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let config = RelayConfig::from_str(CONFIG).expect("parse");
        let table = Arc::new(RoutingTable::build(&config).expect("table"));
        let registry = Arc::new(InstanceRegistry::from_config(&config));
        let connector = MockConnector::new();

        // Bring destination broker 'b' online.
        let entry = registry.get("b").unwrap();
        let link = connector
            .connect("b", entry.broker().unwrap())
            .await
            .expect("connect");
        entry.set_session(link.session);
        entry.set_state(ConnectionState::Connected);

        let dir = tempfile::tempdir().expect("tempdir");
        let file = FileSink::new(dir.path().join("archive.csv"));
        let store = StateStore::open_in_memory().expect("store");

        let mut files = HashMap::new();
        files.insert("archive".to_string(), file.clone());
        let mut stores = HashMap::new();
        stores.insert("state".to_string(), store.clone());

        let dispatcher = Dispatcher::new(
            table,
            registry.clone(),
            files,
            stores,
            Duration::from_millis(500),
        );

        Fixture {
            dispatcher,
            connector,
            registry,
            store,
            file,
            _dir: dir,
        }
    }

    fn inbound(topic: &str, payload: &[u8]) -> Inbound {
        Inbound {
            instance: "a".to_string(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_broker_and_store() {
        let fx = fixture().await;

        fx.dispatcher
            .dispatch(inbound("/home/sensor/temp", b"21.5"))
            .await;

        let session = fx.connector.latest_session("b").expect("session");
        let published = session.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/mirror/temp");
        assert_eq!(published[0].payload, b"21.5");
        assert_eq!(published[0].qos, 2);

        assert_eq!(
            fx.store.get("a", "/home/sensor/temp").unwrap(),
            Some("21.5".to_string())
        );

        let stats = fx.dispatcher.stats().snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.sink_errors, 0);
    }

    #[tokio::test]
    async fn test_file_sink_line_format() {
        let fx = fixture().await;

        fx.dispatcher
            .dispatch(inbound("/home/sensor/humidity", b"55"))
            .await;

        let content = std::fs::read_to_string(fx.file.path()).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let fields: Vec<_> = lines[0].split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[1..].to_vec(), vec!["a", "/home/sensor/humidity", "55"]);
    }

    #[tokio::test]
    async fn test_route_miss_is_counted_not_failed() {
        let fx = fixture().await;

        fx.dispatcher.dispatch(inbound("/unrouted", b"x")).await;

        let stats = fx.dispatcher.stats().snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.route_misses, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn test_failing_destination_does_not_block_later_ones() {
        let fx = fixture().await;
        fx.connector
            .latest_session("b")
            .expect("session")
            .set_fail_publish(true);

        fx.dispatcher
            .dispatch(inbound("/home/sensor/temp", b"21.5"))
            .await;

        // Broker publish failed but the sqlite upsert still happened.
        assert_eq!(
            fx.store.get("a", "/home/sensor/temp").unwrap(),
            Some("21.5".to_string())
        );
        let stats = fx.dispatcher.stats().snapshot();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.sink_errors, 1);
    }

    #[tokio::test]
    async fn test_offline_destination_is_isolated() {
        let fx = fixture().await;
        fx.registry.get("b").unwrap().take_session();

        fx.dispatcher
            .dispatch(inbound("/home/sensor/temp", b"21.5"))
            .await;

        assert_eq!(
            fx.store.get("a", "/home/sensor/temp").unwrap(),
            Some("21.5".to_string())
        );
        let stats = fx.dispatcher.stats().snapshot();
        assert_eq!(stats.sink_errors, 1);
    }

    #[tokio::test]
    async fn test_binary_payload_never_fails_text_sinks() {
        let fx = fixture().await;

        fx.dispatcher
            .dispatch(inbound("/home/sensor/temp", &[0xff, 0xfe, 0x21]))
            .await;

        let stats = fx.dispatcher.stats().snapshot();
        assert_eq!(stats.sink_errors, 0);
        assert!(fx.store.get("a", "/home/sensor/temp").unwrap().is_some());
    }
}
