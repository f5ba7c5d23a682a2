// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction.
//!
//! The relay core never talks to a wire protocol directly; it drives a
//! [`BrokerConnector`] that hands back a live [`BrokerSession`] plus an event
//! receiver. This keeps the connection workers testable without a broker --
//! see [`MockConnector`] -- and keeps protocol details in one place
//! ([`crate::mqtt`] for the real client).
//!
//! Contract:
//!
//! - `connect` returns only after the handshake completed, or fails with a
//!   [`ConnectionError`]. Retry policy lives in the worker, not here.
//! - The event receiver delivers [`BrokerEvent::Message`] for inbound
//!   messages and [`BrokerEvent::Disconnected`] when the link drops. A
//!   receiver that ends without a disconnect notification means the
//!   transport died unexpectedly.
//! - `disconnect` is idempotent: disconnecting an already-dead session must
//!   not fail.

use crate::config::BrokerSettings;
use crate::error::ConnectionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Event delivered by a live broker link.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// The link dropped; the owning worker decides whether to reconnect.
    Disconnected,
    /// An inbound message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// A freshly connected link: command handle plus event stream.
pub struct BrokerLink {
    pub session: Arc<dyn BrokerSession>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink").finish_non_exhaustive()
    }
}

/// Factory for broker connections. One connector serves every instance.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Perform the handshake for `instance` and return a live link.
    async fn connect(
        &self,
        instance: &str,
        settings: &BrokerSettings,
    ) -> Result<BrokerLink, ConnectionError>;
}

/// Command surface of a live connection.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectionError>;

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ConnectionError>;

    /// Tear down the connection. Must be idempotent.
    async fn disconnect(&self);
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock connector for tests: scriptable connect failures, recorded sessions.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<MockConnectorState>,
}

#[derive(Default)]
struct MockConnectorState {
    /// Remaining connect attempts to fail, per instance.
    fail_remaining: Mutex<HashMap<String, u32>>,
    /// Successful connects, per instance.
    connects: Mutex<HashMap<String, u32>>,
    /// Every session ever handed out, in connect order.
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts for `instance` fail.
    pub fn fail_next(&self, instance: &str, count: u32) {
        self.inner
            .fail_remaining
            .lock()
            .unwrap()
            .insert(instance.to_string(), count);
    }

    /// Number of successful connects for `instance`.
    pub fn connect_count(&self, instance: &str) -> u32 {
        self.inner
            .connects
            .lock()
            .unwrap()
            .get(instance)
            .copied()
            .unwrap_or(0)
    }

    /// Sessions handed out for `instance`, oldest first.
    pub fn sessions_for(&self, instance: &str) -> Vec<Arc<MockSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.instance == instance)
            .cloned()
            .collect()
    }

    /// Most recent session for `instance`, if any connect succeeded yet.
    pub fn latest_session(&self, instance: &str) -> Option<Arc<MockSession>> {
        self.sessions_for(instance).pop()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(
        &self,
        instance: &str,
        _settings: &BrokerSettings,
    ) -> Result<BrokerLink, ConnectionError> {
        {
            let mut failures = self.inner.fail_remaining.lock().unwrap();
            if let Some(remaining) = failures.get_mut(instance) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectionError::Connect("scripted failure".into()));
                }
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(MockSession {
            instance: instance.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
            fail_publish: AtomicBool::new(false),
            events: Mutex::new(Some(tx)),
        });

        self.inner.sessions.lock().unwrap().push(session.clone());
        *self
            .inner
            .connects
            .lock()
            .unwrap()
            .entry(instance.to_string())
            .or_insert(0) += 1;

        Ok(BrokerLink {
            session: session.clone(),
            events: rx,
        })
    }
}

/// A recorded message published through a [`MockSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

/// Mock session: records commands, lets tests inject events.
pub struct MockSession {
    instance: String,
    subscriptions: Mutex<Vec<(String, u8)>>,
    published: Mutex<Vec<MockPublish>>,
    disconnects: AtomicU32,
    fail_publish: AtomicBool,
    events: Mutex<Option<mpsc::Sender<BrokerEvent>>>,
}

impl MockSession {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<MockPublish> {
        self.published.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Make subsequent publishes through this session fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Deliver an inbound message to the owning worker.
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .await;
        }
    }

    /// Deliver an orderly disconnect notification.
    pub async fn inject_disconnect(&self) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(BrokerEvent::Disconnected).await;
        }
    }

    /// Drop the event channel without a disconnect notification, simulating
    /// the transport dying out from under the worker.
    pub fn kill_link(&self) {
        self.events.lock().unwrap().take();
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ConnectionError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ConnectionError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ConnectionError::Publish("scripted failure".into()));
        }
        self.published.lock().unwrap().push(MockPublish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        // Idempotent: counting instead of guarding lets tests assert it.
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;

    fn settings() -> BrokerSettings {
        BrokerSettings {
            server: "127.0.0.1".into(),
            ..BrokerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_mock_connect_and_publish() {
        let connector = MockConnector::new();
        let link = connector.connect("a", &settings()).await.expect("connect");

        link.session.subscribe("t", 1).await.expect("subscribe");
        link.session.publish("t", b"x", 1).await.expect("publish");

        let session = connector.latest_session("a").expect("session");
        assert_eq!(session.subscriptions(), vec![("t".to_string(), 1)]);
        assert_eq!(session.published().len(), 1);
        assert_eq!(connector.connect_count("a"), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let connector = MockConnector::new();
        connector.fail_next("a", 2);

        assert!(connector.connect("a", &settings()).await.is_err());
        assert!(connector.connect("a", &settings()).await.is_err());
        assert!(connector.connect("a", &settings()).await.is_ok());
        assert_eq!(connector.connect_count("a"), 1);
    }

    #[tokio::test]
    async fn test_mock_event_injection() {
        let connector = MockConnector::new();
        let mut link = connector.connect("a", &settings()).await.expect("connect");
        let session = connector.latest_session("a").expect("session");

        session.inject_message("t", b"21.5").await;
        match link.events.recv().await {
            Some(BrokerEvent::Message { topic, payload }) => {
                assert_eq!(topic, "t");
                assert_eq!(payload, b"21.5");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        session.inject_disconnect().await;
        assert!(matches!(
            link.events.recv().await,
            Some(BrokerEvent::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_disconnect_idempotent() {
        let connector = MockConnector::new();
        let link = connector.connect("a", &settings()).await.expect("connect");

        link.session.disconnect().await;
        link.session.disconnect().await;

        let session = connector.latest_session("a").expect("session");
        assert_eq!(session.disconnect_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_kill_link_closes_stream() {
        let connector = MockConnector::new();
        let mut link = connector.connect("a", &settings()).await.expect("connect");
        let session = connector.latest_session("a").expect("session");

        session.kill_link();
        assert!(link.events.recv().await.is_none());
    }
}
