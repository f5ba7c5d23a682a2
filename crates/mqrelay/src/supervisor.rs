// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker supervision.
//!
//! The supervisor owns one task per broker instance and reacts to task
//! exits instead of polling liveness. A worker that lost its transport (or
//! panicked) gets its stale session disconnected and is restarted after a
//! short delay; a worker that exhausted its retry budget takes the whole
//! relay down: every other live instance is disconnected first, then the
//! fatal error is returned to the caller.
//!
//! At most one worker is ever alive for an instance: a replacement is only
//! spawned after the previous task's exit has been observed.

use crate::config::ServiceSettings;
use crate::dispatch::Inbound;
use crate::error::RelayError;
use crate::registry::{ConnectionState, InstanceRegistry};
use crate::routing::RoutingTable;
use crate::transport::BrokerConnector;
use crate::worker::{ConnectionWorker, WorkerExit};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Restarts dead connection workers; escalates retry exhaustion.
pub struct Supervisor {
    registry: Arc<InstanceRegistry>,
    table: Arc<RoutingTable>,
    connector: Arc<dyn BrokerConnector>,
    tx: mpsc::Sender<Inbound>,
    service: ServiceSettings,
    tasks: JoinSet<WorkerExit>,
    names: HashMap<tokio::task::Id, String>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        table: Arc<RoutingTable>,
        connector: Arc<dyn BrokerConnector>,
        tx: mpsc::Sender<Inbound>,
        service: ServiceSettings,
    ) -> Self {
        Self {
            registry,
            table,
            connector,
            tx,
            service,
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// Spawn a worker for every broker instance.
    pub fn spawn_all(&mut self) {
        let names: Vec<String> = self
            .registry
            .brokers()
            .map(|entry| entry.name().to_string())
            .collect();
        for name in names {
            self.spawn_worker(&name);
        }
    }

    fn spawn_worker(&mut self, name: &str) {
        let Some(entry) = self.registry.get(name).cloned() else {
            tracing::error!("cannot spawn worker for unknown instance '{}'", name);
            return;
        };
        let worker = ConnectionWorker::new(
            entry,
            self.table.clone(),
            self.connector.clone(),
            self.tx.clone(),
            self.service.clone(),
        );
        let handle = self.tasks.spawn(worker.run());
        self.names.insert(handle.id(), name.to_string());
        tracing::debug!("spawned worker for instance '{}'", name);
    }

    /// Watch workers until shutdown or a fatal exit.
    ///
    /// Returns `Ok(())` when every worker stopped in an orderly way (the
    /// dispatcher went away during shutdown) and `Err` on retry exhaustion.
    pub async fn run(mut self) -> Result<(), RelayError> {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((id, exit)) => {
                    let name = self
                        .names
                        .remove(&id)
                        .unwrap_or_else(|| "<unknown>".to_string());
                    match exit {
                        WorkerExit::RetriesExhausted => {
                            tracing::error!(
                                "instance '{}' exhausted retries, shutting relay down",
                                name
                            );
                            self.registry.disconnect_all().await;
                            return Err(RelayError::RetriesExhausted(name));
                        }
                        WorkerExit::Stopped => {
                            tracing::info!("worker for '{}' stopped", name);
                        }
                        WorkerExit::LinkLost => {
                            self.restart(&name).await;
                        }
                    }
                }
                Err(join_err) => {
                    let name = self
                        .names
                        .remove(&join_err.id())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    tracing::error!("worker for '{}' terminated abnormally: {}", name, join_err);
                    self.restart(&name).await;
                }
            }
        }
        Ok(())
    }

    /// Disconnect the stale session and bring a fresh worker up.
    async fn restart(&mut self, name: &str) {
        tracing::error!("worker dead: '{}', restarting", name);
        if let Some(entry) = self.registry.get(name) {
            // Idempotent: the session may already be gone.
            if let Some(session) = entry.take_session() {
                session.disconnect().await;
            }
            entry.set_state(ConnectionState::Disconnected);
        }
        tokio::time::sleep(Duration::from_millis(self.service.restart_delay_ms)).await;
        self.spawn_worker(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::transport::MockConnector;
    use tokio::time::timeout;

    fn config() -> RelayConfig {
        RelayConfig::from_str(
            r#"
            [service]
            retry_delay_ms = 1
            settle_delay_ms = 1
            restart_delay_ms = 1

            [instances.a]
            kind = "broker"
            server = "127.0.0.1"
            max_retries = 3

            [instances.b]
            kind = "broker"
            server = "127.0.0.2"

            [instances.state]
            kind = "sqlite"
            path = "/tmp/state.db"

            [[routes]]
            from = "a"
            topic = "/t"
            to = "state"

            [[routes]]
            from = "b"
            topic = "/u"
            to = "state"
            "#,
        )
        .expect("parse")
    }

    struct Fixture {
        registry: Arc<InstanceRegistry>,
        connector: Arc<MockConnector>,
        supervisor: Supervisor,
        _rx: mpsc::Receiver<Inbound>,
    }

    fn fixture() -> Fixture {
        let config = config();
        let table = Arc::new(RoutingTable::build(&config).expect("table"));
        let registry = Arc::new(InstanceRegistry::from_config(&config));
        let connector = Arc::new(MockConnector::new());
        let (tx, rx) = mpsc::channel(16);

        let supervisor = Supervisor::new(
            registry.clone(),
            table,
            connector.clone(),
            tx,
            config.service.clone(),
        );

        Fixture {
            registry,
            connector,
            supervisor,
            _rx: rx,
        }
    }

    #[tokio::test]
    async fn test_dead_worker_is_restarted_once() {
        let mut fx = fixture();
        fx.supervisor.spawn_all();
        let run = tokio::spawn(fx.supervisor.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.connector.connect_count("a"), 1);

        // Kill a's transport out from under the worker.
        let stale = fx.connector.latest_session("a").expect("session");
        stale.kill_link();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The stale handle was disconnected and a fresh worker connected.
        assert_eq!(stale.disconnect_count(), 1);
        assert_eq!(fx.connector.connect_count("a"), 2);
        assert_eq!(
            fx.registry.get("a").unwrap().state(),
            ConnectionState::Connected
        );
        // Exactly one live session for 'a': the replacement.
        let sessions = fx.connector.sessions_for("a");
        assert_eq!(sessions.len(), 2);

        run.abort();
    }

    #[tokio::test]
    async fn test_restarted_worker_resumes_delivery() {
        let mut fx = fixture();
        fx.supervisor.spawn_all();
        let run = tokio::spawn(fx.supervisor.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.connector.latest_session("a").expect("session").kill_link();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fresh = fx.connector.latest_session("a").expect("session");
        fresh.inject_message("/t", b"42").await;
        let inbound = timeout(Duration::from_secs(1), fx._rx.recv())
            .await
            .expect("recv")
            .expect("inbound");
        assert_eq!(inbound.instance, "a");
        assert_eq!(inbound.payload, b"42");

        run.abort();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_shuts_everything_down() {
        let mut fx = fixture();
        fx.connector.fail_next("a", 10);
        fx.supervisor.spawn_all();

        let result = timeout(Duration::from_secs(2), fx.supervisor.run())
            .await
            .expect("run returns");

        match result {
            Err(RelayError::RetriesExhausted(name)) => assert_eq!(name, "a"),
            other => panic!("unexpected result: {:?}", other),
        }

        // The healthy instance received a disconnect before the relay exited.
        let session = fx.connector.latest_session("b").expect("session");
        assert_eq!(session.disconnect_count(), 1);
        assert_eq!(
            fx.registry.get("a").unwrap().state(),
            ConnectionState::RetryExhausted
        );
    }
}
