// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT transport backend.
//!
//! Implements [`BrokerConnector`] over rumqttc. `connect` drives the event
//! loop until the broker acknowledges the handshake, then hands the loop to
//! a background pump that translates incoming packets into [`BrokerEvent`]s.
//! Reconnect policy stays in the connection worker: after a transport error
//! the pump reports `Disconnected` and stops polling, and the worker asks
//! for a fresh connection.

use crate::config::BrokerSettings;
use crate::error::ConnectionError;
use crate::transport::{BrokerConnector, BrokerEvent, BrokerLink, BrokerSession};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// rumqttc-backed connector used by the `mqrelay` binary.
#[derive(Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(instance: &str, settings: &BrokerSettings) -> Result<MqttOptions, ConnectionError> {
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqrelay-{}", instance));
        let mut options = MqttOptions::new(client_id, settings.server.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keepalive));
        if !settings.username.is_empty() {
            options.set_credentials(settings.username.clone(), settings.password.clone());
        }
        if settings.tls {
            let cacert = settings.cacert.as_ref().ok_or_else(|| {
                ConnectionError::Connect("tls enabled but no cacert configured".into())
            })?;
            let ca = std::fs::read(cacert).map_err(|err| {
                ConnectionError::Connect(format!("read {}: {}", cacert.display(), err))
            })?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }
        Ok(options)
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        instance: &str,
        settings: &BrokerSettings,
    ) -> Result<BrokerLink, ConnectionError> {
        let options = Self::options(instance, settings)?;
        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        // Drive the loop until the broker acknowledges or refuses us.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectionError::Connect(format!(
                            "connection rejected: {:?}",
                            ack.code
                        )));
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => return Err(ConnectionError::Connect(err.to_string())),
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let name = instance.to_string();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let event = BrokerEvent::Message {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(event).await.is_err() {
                            // Receiver gone: the worker is shutting down.
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        let _ = tx.send(BrokerEvent::Disconnected).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!("transport error on '{}': {}", name, err);
                        let _ = tx.send(BrokerEvent::Disconnected).await;
                        break;
                    }
                }
            }
        });

        Ok(BrokerLink {
            session: Arc::new(MqttSession { client }),
            events: rx,
        })
    }
}

struct MqttSession {
    client: AsyncClient,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectionError> {
        self.client
            .subscribe(topic, to_qos(qos))
            .await
            .map_err(|err| ConnectionError::Subscribe(err.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ConnectionError> {
        self.client
            .publish(topic, to_qos(qos), false, payload.to_vec())
            .await
            .map_err(|err| ConnectionError::Publish(err.to_string()))
    }

    async fn disconnect(&self) {
        // Idempotent by contract: a second disconnect on a dead client just
        // errors internally and is ignored.
        let _ = self.client.disconnect().await;
    }
}
