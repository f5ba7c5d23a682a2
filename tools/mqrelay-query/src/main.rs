// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only query against the mqrelay state store.
//!
//! Prints the latest stored value for a `(label, feed)` pair:
//!
//! ```bash
//! mqrelay-query --db /var/tmp/mqrelay.db home /home/sensor/temp
//! 21.5
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use mqrelay::StateStore;
use std::path::PathBuf;

/// Query the latest value for a (label, feed) pair
#[derive(Parser, Debug)]
#[command(name = "mqrelay-query")]
#[command(about = "Query the latest stored value for a (label, feed) pair")]
#[command(version)]
struct Args {
    /// State store path (SQLite file)
    #[arg(short, long, default_value = "mqrelay.db")]
    db: PathBuf,

    /// Source label, e.g. the broker instance name
    label: String,

    /// Source feed (topic)
    feed: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = StateStore::open(&args.db)
        .with_context(|| format!("open state store {}", args.db.display()))?;

    match store.get(&args.label, &args.feed)? {
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => {
            eprintln!("no entry for ({}, {})", args.label, args.feed);
            std::process::exit(1);
        }
    }
}
