// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Static routing table.
//!
//! Built once from configuration before any worker starts and read-only
//! afterwards, so lookups need no synchronization. Topics match exactly;
//! there is no wildcard matching. Multiple route lines for the same
//! `(instance, topic)` pair append to one target list in declaration order,
//! and forwarding follows that order.

use crate::config::{InstanceKind, RelayConfig};
use crate::error::ConfigError;
use std::collections::HashMap;

/// One forwarding target of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Destination instance name.
    pub instance: String,

    /// Destination kind, resolved at build time.
    pub kind: InstanceKind,

    /// Outgoing topic; always `Some` for broker targets, `None` for sinks.
    pub publish_topic: Option<String>,
}

#[derive(Default)]
struct InstanceRoutes {
    by_topic: HashMap<String, Vec<RouteTarget>>,
    /// Distinct topics in declaration order; the subscription list.
    topics: Vec<String>,
}

/// Exact-match routing table.
pub struct RoutingTable {
    instances: HashMap<String, InstanceRoutes>,
    route_count: usize,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("instances", &self.instances.len())
            .field("route_count", &self.route_count)
            .finish()
    }
}

impl RoutingTable {
    /// Build the table, validating every cross-reference.
    ///
    /// Fails when a route names an undeclared source or destination, when a
    /// route's source is not a broker, or when a broker destination has no
    /// outgoing topic. All of these are fatal configuration errors.
    pub fn build(config: &RelayConfig) -> Result<Self, ConfigError> {
        let mut instances: HashMap<String, InstanceRoutes> = HashMap::new();
        let mut route_count = 0;

        for (index, route) in config.routes.iter().enumerate() {
            let source = config.instances.get(&route.from).ok_or_else(|| {
                ConfigError::UndefinedInstance {
                    index,
                    name: route.from.clone(),
                }
            })?;
            if source.kind().is_sink() {
                return Err(ConfigError::MalformedRoute {
                    index,
                    reason: format!("source '{}' is a sink and cannot subscribe", route.from),
                });
            }

            let dest = config.instances.get(&route.to).ok_or_else(|| {
                ConfigError::UndefinedInstance {
                    index,
                    name: route.to.clone(),
                }
            })?;
            let kind = dest.kind();
            if kind == InstanceKind::Broker && route.publish_topic.is_none() {
                return Err(ConfigError::MalformedRoute {
                    index,
                    reason: format!(
                        "broker destination '{}' requires publish_topic",
                        route.to
                    ),
                });
            }

            let entry = instances.entry(route.from.clone()).or_default();
            if !entry.by_topic.contains_key(&route.topic) {
                entry.topics.push(route.topic.clone());
            }
            entry
                .by_topic
                .entry(route.topic.clone())
                .or_default()
                .push(RouteTarget {
                    instance: route.to.clone(),
                    kind,
                    // The placeholder is ignored for sink destinations.
                    publish_topic: if kind == InstanceKind::Broker {
                        route.publish_topic.clone()
                    } else {
                        None
                    },
                });
            route_count += 1;
        }

        Ok(Self {
            instances,
            route_count,
        })
    }

    /// Destinations for an inbound message, in declaration order. Empty when
    /// no route matches -- a normal, loggable condition.
    pub fn lookup(&self, instance: &str, topic: &str) -> &[RouteTarget] {
        self.instances
            .get(instance)
            .and_then(|routes| routes.by_topic.get(topic))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct topics a broker instance must subscribe to, in declaration
    /// order.
    pub fn topics_for(&self, instance: &str) -> &[String] {
        self.instances
            .get(instance)
            .map(|routes| routes.topics.as_slice())
            .unwrap_or(&[])
    }

    /// Total number of route lines.
    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn config(routes: &str) -> RelayConfig {
        RelayConfig::from_str(&format!(
            r#"
            [instances.a]
            kind = "broker"
            server = "127.0.0.1"

            [instances.b]
            kind = "broker"
            server = "127.0.0.2"

            [instances.archive]
            kind = "file"
            path = "/tmp/archive.csv"

            [instances.state]
            kind = "sqlite"
            path = "/tmp/state.db"

            {routes}
            "#
        ))
        .expect("parse")
    }

    #[test]
    fn test_lookup_preserves_declaration_order() {
        let table = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t"
            to = "b"
            publish_topic = "/mirror"

            [[routes]]
            from = "a"
            topic = "/t"
            to = "state"

            [[routes]]
            from = "a"
            topic = "/t"
            to = "archive"
            "#,
        ))
        .expect("build");

        let targets: Vec<_> = table.lookup("a", "/t").to_vec();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].instance, "b");
        assert_eq!(targets[0].publish_topic.as_deref(), Some("/mirror"));
        assert_eq!(targets[1].instance, "state");
        assert_eq!(targets[1].publish_topic, None);
        assert_eq!(targets[2].instance, "archive");

        // Repeated lookups return the same structure.
        assert_eq!(table.lookup("a", "/t"), targets.as_slice());
    }

    #[test]
    fn test_lookup_miss_is_empty_not_error() {
        let table = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t"
            to = "b"
            publish_topic = "/mirror"
            "#,
        ))
        .expect("build");

        assert!(table.lookup("a", "/other").is_empty());
        assert!(table.lookup("nobody", "/t").is_empty());
    }

    #[test]
    fn test_topics_for_distinct_in_order() {
        let table = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t2"
            to = "archive"

            [[routes]]
            from = "a"
            topic = "/t1"
            to = "state"

            [[routes]]
            from = "a"
            topic = "/t2"
            to = "state"
            "#,
        ))
        .expect("build");

        assert_eq!(table.topics_for("a"), &["/t2".to_string(), "/t1".into()]);
        assert!(table.topics_for("b").is_empty());
    }

    #[test]
    fn test_undeclared_destination_fails() {
        let err = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t"
            to = "ghost"
            "#,
        ))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::UndefinedInstance { ref name, .. } if name == "ghost"
        ));
    }

    #[test]
    fn test_undeclared_source_fails() {
        let err = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "ghost"
            topic = "/t"
            to = "b"
            publish_topic = "/mirror"
            "#,
        ))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::UndefinedInstance { ref name, .. } if name == "ghost"
        ));
    }

    #[test]
    fn test_sink_source_rejected() {
        let err = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "archive"
            topic = "/t"
            to = "b"
            publish_topic = "/mirror"
            "#,
        ))
        .unwrap_err();

        assert!(matches!(err, ConfigError::MalformedRoute { .. }));
    }

    #[test]
    fn test_broker_destination_requires_publish_topic() {
        let err = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t"
            to = "b"
            "#,
        ))
        .unwrap_err();

        assert!(matches!(err, ConfigError::MalformedRoute { .. }));
    }

    #[test]
    fn test_sink_destination_ignores_placeholder() {
        let table = RoutingTable::build(&config(
            r#"
            [[routes]]
            from = "a"
            topic = "/t"
            to = "state"
            publish_topic = "/ignored"
            "#,
        ))
        .expect("build");

        assert_eq!(table.lookup("a", "/t")[0].publish_topic, None);
    }
}
