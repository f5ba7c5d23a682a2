// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy and process exit codes.
//!
//! Configuration errors are fatal at startup and never retried. Connection
//! errors are retried per instance up to its `max_retries`, then escalate to
//! a coordinated shutdown. Sink errors are isolated per destination and
//! logged; they never abort dispatch to the remaining destinations. A route
//! miss is not an error at all.

use thiserror::Error;

/// Exit code when a connection gives up after its retry budget.
pub const EXIT_RETRIES_EXHAUSTED: i32 = 1;
/// Exit code for an unparsable configuration file or malformed route.
pub const EXIT_CONFIG_MALFORMED: i32 = 11;
/// Exit code for a route referencing an undeclared instance.
pub const EXIT_UNDEFINED_INSTANCE: i32 = 12;
/// Exit code for a sink without a usable location.
pub const EXIT_SINK_LOCATION: i32 = 13;

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("route {index}: {reason}")]
    MalformedRoute { index: usize, reason: String },

    #[error("route {index}: instance '{name}' is not declared")]
    UndefinedInstance { index: usize, name: String },

    #[error("sink '{name}': {reason}")]
    SinkLocation { name: String, reason: String },

    #[error("instance '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UndefinedInstance { .. } => EXIT_UNDEFINED_INSTANCE,
            Self::SinkLocation { .. } => EXIT_SINK_LOCATION,
            _ => EXIT_CONFIG_MALFORMED,
        }
    }
}

/// Broker transport errors surfaced by a connector or session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("not connected")]
    NotConnected,
}

/// Per-destination sink failures. Isolated and logged, never fatal.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("destination '{instance}' has no live session")]
    NoSession { instance: String },

    #[error("publish to '{instance}' failed: {source}")]
    Publish {
        instance: String,
        source: ConnectionError,
    },

    #[error("append to '{instance}' failed: {source}")]
    Append {
        instance: String,
        source: std::io::Error,
    },

    #[error("upsert into '{instance}' failed: {source}")]
    Upsert {
        instance: String,
        source: rusqlite::Error,
    },

    #[error("sink '{instance}' timed out after {timeout_ms} ms")]
    Timeout { instance: String, timeout_ms: u64 },

    #[error("sink task for '{instance}' aborted")]
    Task { instance: String },
}

/// Top-level fatal errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("instance '{0}': retries exhausted, shutting down")]
    RetriesExhausted(String),
}

impl RelayError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(err) => err.exit_code(),
            Self::RetriesExhausted(_) => EXIT_RETRIES_EXHAUSTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinct() {
        let malformed = ConfigError::MalformedRoute {
            index: 0,
            reason: "bad".into(),
        };
        let undefined = ConfigError::UndefinedInstance {
            index: 0,
            name: "x".into(),
        };
        let sink = ConfigError::SinkLocation {
            name: "x".into(),
            reason: "missing path".into(),
        };
        let fatal = RelayError::RetriesExhausted("x".into());

        let codes = [
            malformed.exit_code(),
            undefined.exit_code(),
            sink.exit_code(),
            fatal.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_config_error_propagates_through_relay_error() {
        let err = RelayError::from(ConfigError::UndefinedInstance {
            index: 2,
            name: "ghost".into(),
        });
        assert_eq!(err.exit_code(), EXIT_UNDEFINED_INSTANCE);
    }
}
