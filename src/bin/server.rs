//! cachefs file server
//!
//! Hosts the canonical file store and the per-path version ledger behind a
//! TCP listener for proxies.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cachefs::server::{FileServer, ServerListener};

/// Default listen address
const DEFAULT_LISTEN: &str = "127.0.0.1:9090";

/// Default root directory for stored files
const DEFAULT_ROOT: &str = "cachefs-root";

/// Parsed command line configuration
#[derive(Debug)]
struct Config {
    listen_addr: String,
    root: PathBuf,
}

fn print_help() {
    eprintln!(
        r#"cachefs-server - canonical file store for cachefs proxies

USAGE:
    cachefs-server [listen-addr] [root-dir]
    cachefs-server help

ARGS:
    listen-addr  host:port to listen on (default: {DEFAULT_LISTEN})
    root-dir     directory holding the canonical files (default: {DEFAULT_ROOT})

ENVIRONMENT:
    CACHEFS_LISTEN  Listen address (alternative to CLI arg)
    CACHEFS_ROOT    Root directory
    RUST_LOG        Log level (trace, debug, info, warn, error)

EXAMPLES:
    cachefs-server
    cachefs-server 0.0.0.0:9090 /srv/cachefs
"#
    );
}

fn parse_args() -> Config {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_help();
        std::process::exit(0);
    }

    let listen_addr = args
        .get(1)
        .cloned()
        .or_else(|| env::var("CACHEFS_LISTEN").ok())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let root = args
        .get(2)
        .map(PathBuf::from)
        .or_else(|| env::var("CACHEFS_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));

    Config { listen_addr, root }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();

    info!(
        listen = %config.listen_addr,
        root = %config.root.display(),
        "Starting cachefs file server"
    );

    let service = Arc::new(FileServer::new(config.root)?);
    let listener = ServerListener::bind(&config.listen_addr, service).await?;

    tokio::select! {
        result = listener.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
