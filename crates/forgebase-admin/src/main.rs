//! ForgeBase Admin - a command-line front end for the ForgeBase admin API.
//!
//! All session handling (token storage, renewal, invalidation) lives in
//! `forgebase-session`; this binary only collects input and prints state.

mod commands;

use std::io;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use forgebase_session::{AdminClient, Config};

use commands::Command;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Some(command) => command,
        None => {
            eprintln!("{}", commands::USAGE);
            std::process::exit(2);
        }
    };

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };

    let client = AdminClient::new(&config)?;
    client.restore().await;
    info!(?command, "ForgeBase admin starting");

    let result = commands::run(command, &client, &mut config).await;
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
