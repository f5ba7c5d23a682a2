// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Instance registry.
//!
//! Owns the immutable per-instance configuration plus the mutable runtime
//! cells: connection state, retry counter, and (for brokers) the live
//! session handle. Workers mutate their own entry; the supervisor and
//! dispatcher read through shared references.

use crate::config::{BrokerSettings, InstanceKind, InstanceSettings, RelayConfig};
use crate::transport::BrokerSession;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Connection lifecycle state of a broker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the instance gave up its retry budget. The whole process
    /// shuts down when any instance reaches this state.
    RetryExhausted,
}

/// One declared instance with its runtime cells.
pub struct InstanceEntry {
    name: String,
    settings: InstanceSettings,
    state: Mutex<ConnectionState>,
    retries: AtomicU32,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl InstanceEntry {
    fn new(name: String, settings: InstanceSettings) -> Self {
        Self {
            name,
            settings,
            state: Mutex::new(ConnectionState::Disconnected),
            retries: AtomicU32::new(1),
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstanceKind {
        self.settings.kind()
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    /// Broker settings, or `None` for sink instances.
    pub fn broker(&self) -> Option<&BrokerSettings> {
        match &self.settings {
            InstanceSettings::Broker(broker) => Some(broker),
            _ => None,
        }
    }

    /// Label recorded as `source_label` in the last-value store.
    pub fn label(&self) -> &str {
        self.broker()
            .and_then(|b| b.label.as_deref())
            .unwrap_or(&self.name)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Current retry counter. Starts at 1 and resets to 1 after a
    /// successful handshake.
    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_retries(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retries.store(1, Ordering::SeqCst);
    }

    /// Live session handle, if this broker instance is currently connected.
    pub fn session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.lock().unwrap().clone()
    }

    pub(crate) fn set_session(&self, session: Arc<dyn BrokerSession>) {
        *self.session.lock().unwrap() = Some(session);
    }

    /// Remove and return the live session, leaving the entry disconnected.
    pub(crate) fn take_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.lock().unwrap().take()
    }
}

/// All declared instances, keyed by name.
pub struct InstanceRegistry {
    instances: BTreeMap<String, Arc<InstanceEntry>>,
}

impl InstanceRegistry {
    /// Build the registry from parsed configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        let instances = config
            .instances
            .iter()
            .map(|(name, settings)| {
                (
                    name.clone(),
                    Arc::new(InstanceEntry::new(name.clone(), settings.clone())),
                )
            })
            .collect();
        Self { instances }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<InstanceEntry>> {
        self.instances.get(name)
    }

    /// Broker instances in name order; these get connection workers.
    pub fn brokers(&self) -> impl Iterator<Item = &Arc<InstanceEntry>> {
        self.instances
            .values()
            .filter(|e| e.kind() == InstanceKind::Broker)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Disconnect every live session. Used for the coordinated shutdown
    /// after retry exhaustion and on operator interrupt; safe to call more
    /// than once.
    pub async fn disconnect_all(&self) {
        for entry in self.brokers() {
            if let Some(session) = entry.take_session() {
                session.disconnect().await;
                entry.set_state(ConnectionState::Disconnected);
                tracing::info!("disconnected instance '{}'", entry.name());
            }
        }
    }
}
