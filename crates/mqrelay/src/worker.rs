// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection worker.
//!
//! One worker owns one broker instance: it runs the connect/retry state
//! machine, subscribes to every routed topic after a successful handshake,
//! and forwards inbound messages to the dispatcher channel as typed
//! [`Inbound`] values.
//!
//! Retry policy: the counter starts at 1, is checked against `max_retries`
//! before every retry, and resets to 1 on a successful handshake. An
//! unexpected disconnect takes a settle delay, bumps the counter, and
//! re-enters the connect loop. Exhausting the budget is fatal for the whole
//! process; the supervisor performs the coordinated shutdown.

use crate::config::ServiceSettings;
use crate::dispatch::Inbound;
use crate::registry::{ConnectionState, InstanceEntry};
use crate::routing::RoutingTable;
use crate::transport::{BrokerConnector, BrokerEvent, BrokerLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The retry budget is spent. Fatal for the whole process.
    RetriesExhausted,
    /// The transport died without a disconnect notification. The supervisor
    /// restarts the worker.
    LinkLost,
    /// The dispatcher went away; the relay is shutting down.
    Stopped,
}

enum Pump {
    Disconnected,
    LinkLost,
    Stopped,
}

/// Worker for a single broker instance.
pub struct ConnectionWorker {
    entry: Arc<InstanceEntry>,
    table: Arc<RoutingTable>,
    connector: Arc<dyn BrokerConnector>,
    tx: mpsc::Sender<Inbound>,
    service: ServiceSettings,
}

impl ConnectionWorker {
    pub fn new(
        entry: Arc<InstanceEntry>,
        table: Arc<RoutingTable>,
        connector: Arc<dyn BrokerConnector>,
        tx: mpsc::Sender<Inbound>,
        service: ServiceSettings,
    ) -> Self {
        Self {
            entry,
            table,
            connector,
            tx,
            service,
        }
    }

    /// Drive the connection until shutdown, link loss, or retry exhaustion.
    pub async fn run(self) -> WorkerExit {
        let name = self.entry.name().to_string();
        let Some(broker) = self.entry.broker().cloned() else {
            tracing::error!("instance '{}' is a sink, refusing to start worker", name);
            return WorkerExit::Stopped;
        };
        let retry_delay = Duration::from_millis(self.service.retry_delay_ms);
        let settle_delay = Duration::from_millis(self.service.settle_delay_ms);

        loop {
            self.entry.set_state(ConnectionState::Connecting);
            tracing::info!(
                "connecting instance '{}' to {}:{}",
                name,
                broker.server,
                broker.port
            );

            match self.connector.connect(&name, &broker).await {
                Err(err) => {
                    let attempt = self.entry.retry_count();
                    if attempt > broker.max_retries {
                        tracing::error!(
                            "giving up retries to {} ('{}'), terminating",
                            broker.server,
                            name
                        );
                        self.entry.set_state(ConnectionState::RetryExhausted);
                        return WorkerExit::RetriesExhausted;
                    }
                    tracing::warn!("connect error for '{}': {} (retry #{})", name, err, attempt);
                    self.entry.bump_retries();
                    tokio::time::sleep(retry_delay).await;
                }
                Ok(mut link) => {
                    self.entry.reset_retries();
                    self.entry.set_state(ConnectionState::Connected);
                    self.entry.set_session(link.session.clone());
                    tracing::info!("connected to {} ('{}'), subscribing", broker.server, name);

                    let topics = self.table.topics_for(&name);
                    if topics.is_empty() {
                        tracing::warn!("no subscriptions on instance '{}'", name);
                    }
                    for topic in topics {
                        tracing::info!("subscribe '{}': {} (qos {})", name, topic, broker.qos);
                        if let Err(err) = link.session.subscribe(topic, broker.qos).await {
                            tracing::warn!("subscribe {} failed on '{}': {}", topic, name, err);
                        }
                    }

                    match self.pump(&name, &mut link).await {
                        Pump::Disconnected => {
                            self.entry.take_session();
                            tracing::error!(
                                "disconnected from {} ('{}'), retrying",
                                broker.server,
                                name
                            );
                            tokio::time::sleep(settle_delay).await;
                            let attempt = self.entry.retry_count();
                            if attempt > broker.max_retries {
                                tracing::error!(
                                    "giving up retries to {} ('{}'), terminating",
                                    broker.server,
                                    name
                                );
                                self.entry.set_state(ConnectionState::RetryExhausted);
                                return WorkerExit::RetriesExhausted;
                            }
                            self.entry.bump_retries();
                        }
                        Pump::LinkLost => {
                            // The stale session stays registered; the
                            // supervisor disconnects it before restarting.
                            self.entry.set_state(ConnectionState::Disconnected);
                            tracing::error!("transport for '{}' died unexpectedly", name);
                            return WorkerExit::LinkLost;
                        }
                        Pump::Stopped => {
                            if let Some(session) = self.entry.take_session() {
                                session.disconnect().await;
                            }
                            self.entry.set_state(ConnectionState::Disconnected);
                            return WorkerExit::Stopped;
                        }
                    }
                }
            }
        }
    }

    /// Deliver events until the link drops or the dispatcher goes away.
    async fn pump(&self, name: &str, link: &mut BrokerLink) -> Pump {
        while let Some(event) = link.events.recv().await {
            match event {
                BrokerEvent::Message { topic, payload } => {
                    tracing::info!("{} <- receive ({})", name, topic);
                    let inbound = Inbound {
                        instance: name.to_string(),
                        topic,
                        payload,
                    };
                    if self.tx.send(inbound).await.is_err() {
                        return Pump::Stopped;
                    }
                }
                BrokerEvent::Disconnected => return Pump::Disconnected,
            }
        }
        Pump::LinkLost
    }
}
