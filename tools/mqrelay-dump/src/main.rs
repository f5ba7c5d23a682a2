// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Full dump of the mqrelay state store.
//!
//! Prints every row ordered by `last_timestamp`, tab-separated by default:
//!
//! ```text
//! home    /home/sensor/temp     21.5    2026-02-07T10:00:05+00:00
//! ```
//!
//! `--json` emits one JSON object per row instead, for piping into jq.

use anyhow::{Context, Result};
use clap::Parser;
use mqrelay::StateStore;
use std::path::PathBuf;

/// Dump all stored last values ordered by last update
#[derive(Parser, Debug)]
#[command(name = "mqrelay-dump")]
#[command(about = "Dump every row of the mqrelay state store ordered by last update")]
#[command(version)]
struct Args {
    /// State store path (SQLite file)
    #[arg(short, long, default_value = "mqrelay.db")]
    db: PathBuf,

    /// Emit one JSON object per row
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = StateStore::open(&args.db)
        .with_context(|| format!("open state store {}", args.db.display()))?;

    for row in store.dump()? {
        if args.json {
            println!("{}", serde_json::to_string(&row)?);
        } else {
            println!(
                "{}\t{}\t{}\t{}",
                row.source_label, row.source_feed, row.value, row.last_timestamp
            );
        }
    }

    Ok(())
}
