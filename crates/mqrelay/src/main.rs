// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqrelay service CLI.
//!
//! # Usage
//!
//! ```bash
//! # Run the relay
//! mqrelay --config mqrelay.toml
//!
//! # Generate an example configuration
//! mqrelay gen-config --output mqrelay.toml
//!
//! # Check a configuration without starting anything
//! mqrelay validate --config mqrelay.toml
//! ```
//!
//! Fatal errors exit with distinct codes: 11 for a malformed configuration,
//! 12 for a route naming an undeclared instance, 13 for a missing or
//! unwritable sink location, and 1 when a connection exhausts its retries.

use clap::{Parser, Subcommand};
use mqrelay::{
    InstanceSettings, MqttConnector, RelayConfig, RelayService, RoutingTable,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Pub/sub message repeater
#[derive(Parser, Debug)]
#[command(name = "mqrelay")]
#[command(about = "Pub/sub message repeater - static topic routing across brokers, files, and last-value stores")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "mqrelay.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        match cmd {
            Commands::GenConfig { output } => {
                if let Err(err) = cmd_gen_config(&output) {
                    eprintln!("mqrelay: {}", err);
                    std::process::exit(1);
                }
            }
            Commands::Validate { config } => cmd_validate(&config),
        }
        return;
    }

    let Some(config_path) = args.config else {
        eprintln!("mqrelay: missing --config (or use gen-config / validate)");
        std::process::exit(mqrelay::error::EXIT_CONFIG_MALFORMED);
    };

    let config = match RelayConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mqrelay: {}", err);
            std::process::exit(err.exit_code());
        }
    };

    println!("mqrelay v{}", env!("CARGO_PKG_VERSION"));
    print_summary(&config);

    let service = match RelayService::new(config, Arc::new(MqttConnector::new())) {
        Ok(service) => service,
        Err(err) => {
            eprintln!("mqrelay: {}", err);
            std::process::exit(err.exit_code());
        }
    };
    let registry = service.registry();

    println!("Press Ctrl+C to stop...");
    tokio::select! {
        result = service.run() => {
            if let Err(err) = result {
                eprintln!("mqrelay: {}", err);
                std::process::exit(err.exit_code());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            registry.disconnect_all().await;
        }
    }
}

fn print_summary(config: &RelayConfig) {
    for (name, settings) in &config.instances {
        match settings {
            InstanceSettings::Broker(broker) => {
                let auth = if broker.username.is_empty() {
                    String::new()
                } else {
                    // Never echo credentials.
                    format!(" (user {}, password ********)", broker.username)
                };
                println!("Instance {}: broker {}:{}{}", name, broker.server, broker.port, auth);
            }
            InstanceSettings::File(sink) => {
                if let Some(path) = &sink.path {
                    println!("Instance {}: file {}", name, path.display());
                }
            }
            InstanceSettings::Sqlite(sink) => {
                if let Some(path) = &sink.path {
                    println!("Instance {}: sqlite {}", name, path.display());
                }
            }
        }
    }
    for route in &config.routes {
        match &route.publish_topic {
            Some(topic) => println!(
                "Route: {}:{} -> {}:{}",
                route.from, route.topic, route.to, topic
            ),
            None => println!("Route: {}:{} -> {}", route.from, route.topic, route.to),
        }
    }
    println!();
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let config = RelayConfig::example();
    let toml_str = toml::to_string_pretty(&config)?;
    let content = format!(
        "# mqrelay configuration\n# Generated by mqrelay gen-config\n\n{}",
        toml_str
    );
    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) {
    let checked = RelayConfig::from_file(config_path)
        .and_then(|config| RoutingTable::build(&config).map(|table| (config, table)));
    match checked {
        Ok((config, table)) => {
            println!("Configuration valid!");
            println!();
            println!("Instances: {}", config.instances.len());
            println!("Routes: {}", table.len());
            print_summary(&config);
        }
        Err(err) => {
            eprintln!("Configuration invalid: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}
