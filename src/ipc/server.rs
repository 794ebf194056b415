//! IPC server - Unix socket front end for client sessions
//!
//! Accepts client connections and runs one session handler per connection.
//! Each session dials its own connection to the file server so a call in
//! flight blocks only the session that issued it. When a client disconnects,
//! cleanly or not, the session's descriptors are torn down so reference
//! counts are released. On shutdown the accept loop drains in-flight
//! sessions before returning.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::fs::SessionHandler;
use crate::ipc::protocol::{ClientRequest, ClientResponse};
use crate::rpc::{protocol, FileService, RemoteClient};

/// How long to wait for live sessions when shutting down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// IPC server that listens for client descriptor calls
pub struct IpcServer {
    /// Cache shared by every session
    cache: Arc<CacheManager>,
    /// Address of the remote file server
    server_addr: String,
    /// Unix socket the clients connect to
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn new(cache: Arc<CacheManager>, server_addr: String, socket_path: PathBuf) -> Self {
        Self {
            cache,
            server_addr,
            socket_path,
            listener: None,
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the accept loop until a shutdown signal arrives, then drain
    /// in-flight sessions so their reference counts are released
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let cache = Arc::clone(&self.cache);
                        let server_addr = self.server_addr.clone();
                        sessions.spawn(async move {
                            if let Err(e) = handle_session(stream, cache, server_addr).await {
                                error!(error = %e, "Session handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        if !sessions.is_empty() {
            info!(active = sessions.len(), "Draining client sessions");
            let drain = async {
                while sessions.join_next().await.is_some() {}
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                warn!("Sessions still active after drain timeout, aborting");
                sessions.abort_all();
            }
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_session(
    stream: UnixStream,
    cache: Arc<CacheManager>,
    server_addr: String,
) -> Result<()> {
    // Each session gets its own connection to the file server
    let service: Arc<dyn FileService> = Arc::new(RemoteClient::connect(&server_addr).await?);
    let mut session = SessionHandler::new(cache, service);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    debug!("Client session started");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<ClientRequest>(trimmed) {
                    Ok(request) => process_request(&mut session, request).await,
                    Err(e) => {
                        error!(error = %e, request = %trimmed, "Failed to parse client request");
                        ClientResponse::Code { code: -libc::EINVAL }
                    }
                };
                match protocol::encode_line(&response) {
                    Ok(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from client socket");
                break;
            }
        }
    }

    // Release every descriptor the client left open
    session.teardown().await;
    debug!("Client session ended");

    Ok(())
}

/// Dispatch one descriptor call, mapping errors to negative codes
async fn process_request(session: &mut SessionHandler, request: ClientRequest) -> ClientResponse {
    match request {
        ClientRequest::Open { path, mode } => match session.open(&path, mode).await {
            Ok(fd) => ClientResponse::Fd { fd: fd as i64 },
            Err(e) => ClientResponse::Fd { fd: e.code() as i64 },
        },
        ClientRequest::Read { fd, len } => match session.read(fd, len) {
            Ok(data) => ClientResponse::Data {
                count: data.len() as i64,
                data,
            },
            Err(e) => ClientResponse::Data {
                count: e.code() as i64,
                data: Vec::new(),
            },
        },
        ClientRequest::Write { fd, data } => match session.write(fd, &data) {
            Ok(count) => ClientResponse::Count {
                count: count as i64,
            },
            Err(e) => ClientResponse::Count {
                count: e.code() as i64,
            },
        },
        ClientRequest::Lseek { fd, offset, whence } => match session.lseek(fd, offset, whence) {
            Ok(position) => ClientResponse::Offset {
                offset: position as i64,
            },
            Err(e) => ClientResponse::Offset {
                offset: e.code() as i64,
            },
        },
        ClientRequest::Close { fd } => match session.close(fd).await {
            Ok(()) => ClientResponse::Code { code: 0 },
            Err(e) => ClientResponse::Code { code: e.code() },
        },
        ClientRequest::Unlink { path } => match session.unlink(&path).await {
            Ok(()) => ClientResponse::Code { code: 0 },
            Err(e) => ClientResponse::Code { code: e.code() },
        },
    }
}
