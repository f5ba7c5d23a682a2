// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite last-value store.
//!
//! One row per `(source_label, source_feed)` pair holding the latest value
//! and its timestamp. Rows are upserted on every forwarded message and never
//! deleted by the relay. The companion `mqrelay-query` and `mqrelay-dump`
//! tools read the same table.
//!
//! Thread-safe via internal Mutex (SQLite `Connection` is not Sync); clones
//! share one connection, and dispatch runs writes on the blocking pool.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE states (
//!     source_label TEXT NOT NULL,
//!     source_feed TEXT NOT NULL,
//!     value TEXT NOT NULL,
//!     last_timestamp TEXT NOT NULL,
//!     PRIMARY KEY (source_label, source_feed)
//! );
//! ```

use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One row of the `states` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRow {
    pub source_label: String,
    pub source_feed: String,
    pub value: String,
    pub last_timestamp: String,
}

/// Mutex-guarded last-value store over one SQLite connection.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (creating if needed) a file-backed store and ensure the schema
    /// exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS states (
                source_label TEXT NOT NULL,
                source_feed TEXT NOT NULL,
                value TEXT NOT NULL,
                last_timestamp TEXT NOT NULL,
                PRIMARY KEY (source_label, source_feed)
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert the row if absent, else update `value` and `last_timestamp`.
    pub fn upsert(&self, label: &str, feed: &str, value: &str, timestamp: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO states (source_label, source_feed, value, last_timestamp)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (source_label, source_feed)
             DO UPDATE SET value = excluded.value, last_timestamp = excluded.last_timestamp",
            params![label, feed, value, timestamp],
        )?;
        Ok(())
    }

    /// Latest value for a `(label, feed)` pair.
    pub fn get(&self, label: &str, feed: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM states WHERE source_label = ?1 AND source_feed = ?2",
            params![label, feed],
            |row| row.get(0),
        )
        .optional()
    }

    /// All rows ordered by `last_timestamp`.
    pub fn dump(&self) -> Result<Vec<StateRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_label, source_feed, value, last_timestamp
             FROM states
             ORDER BY last_timestamp",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StateRow {
                    source_label: row.get(0)?,
                    source_feed: row.get(1)?,
                    value: row.get(2)?,
                    last_timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of stored rows.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM states", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
