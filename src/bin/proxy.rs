//! cachefs proxy daemon
//!
//! Serves POSIX-like descriptor calls to local clients over a Unix socket,
//! caching file content fetched from the remote file server on local disk.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cachefs::cache::{manager::DEFAULT_CAPACITY, CacheManager};
use cachefs::ipc::{IpcServer, SOCKET_PATH};
use cachefs::rpc::RemoteClient;

/// Parsed command line configuration
#[derive(Debug)]
struct Config {
    server_addr: String,
    cache_dir: PathBuf,
    capacity: u64,
    socket_path: PathBuf,
}

fn print_help() {
    eprintln!(
        r#"cachefs-proxy - caching file proxy daemon

USAGE:
    cachefs-proxy <server-addr> [cache-dir] [capacity-bytes]
    cachefs-proxy help

ARGS:
    server-addr     host:port of the cachefs file server
    cache-dir       directory for cached copies (default: user cache dir)
    capacity-bytes  cache size bound in bytes (default: 1 GB)

ENVIRONMENT:
    CACHEFS_SERVER    File server address (alternative to CLI arg)
    CACHEFS_CACHE_DIR Cache directory
    CACHEFS_CAPACITY  Cache capacity in bytes
    CACHEFS_SOCKET    Unix socket path for client connections
    RUST_LOG          Log level (trace, debug, info, warn, error)

EXAMPLES:
    cachefs-proxy 127.0.0.1:9090
    cachefs-proxy 127.0.0.1:9090 /var/cache/cachefs 52428800
"#
    );
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cachefs")
}

fn parse_args() -> Result<Config> {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_help();
        std::process::exit(0);
    }

    let server_addr = args
        .get(1)
        .cloned()
        .or_else(|| env::var("CACHEFS_SERVER").ok())
        .ok_or_else(|| anyhow!("Missing file server address"))?;

    let cache_dir = args
        .get(2)
        .map(PathBuf::from)
        .or_else(|| env::var("CACHEFS_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_cache_dir);

    let capacity = match args
        .get(3)
        .cloned()
        .or_else(|| env::var("CACHEFS_CAPACITY").ok())
    {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("Invalid capacity: {}", raw))?,
        None => DEFAULT_CAPACITY,
    };

    let socket_path = env::var("CACHEFS_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(SOCKET_PATH));

    Ok(Config {
        server_addr,
        cache_dir,
        capacity,
        socket_path,
    })
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

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    info!(
        server = %config.server_addr,
        cache_dir = %config.cache_dir.display(),
        capacity = config.capacity,
        "Starting cachefs proxy"
    );

    // Verify the file server is reachable before accepting clients
    if let Err(e) = RemoteClient::connect(&config.server_addr).await {
        error!(error = %e, "File server is not reachable");
        return Err(e);
    }
    info!(server = %config.server_addr, "File server is reachable");

    let cache = Arc::new(CacheManager::new(config.cache_dir, config.capacity)?);

    let mut ipc_server = IpcServer::new(cache, config.server_addr, config.socket_path);
    ipc_server.start().await?;

    info!("Proxy ready, waiting for client connections");
    ipc_server.run().await?;

    info!("Shutdown complete");
    Ok(())
}
