use anyhow::Result;
use clap::Parser;
use mcauthproxy::{Config, IdentityRegistry, ListenerPair, config};
use parking_lot::RwLock;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A whitelisting Minecraft reverse proxy", long_about = None)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    info!("starting");

    // Load config and keep it fresh
    let loaded = Config::load(&args.config).await?;
    info!(
        "backend {}:{}, {} whitelist entries",
        loaded.backend_host,
        loaded.backend_port,
        loaded.whitelist.len()
    );
    let shared = Arc::new(RwLock::new(loaded));
    tokio::spawn(config::watch(args.config, shared.clone()));

    // Run both listeners
    ListenerPair::new(shared, IdentityRegistry::new())?.run().await
}
