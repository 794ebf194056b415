//! TCP front end for the file server
//!
//! Accepts proxy connections and dispatches newline-delimited JSON requests
//! to the file store. One task is spawned per connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::service::FileServer;
use crate::rpc::protocol::{self, FileData, Request, Response};
use crate::rpc::FileService;

/// Accept loop serving proxy connections
pub struct ServerListener {
    service: Arc<FileServer>,
    listener: TcpListener,
}

impl ServerListener {
    /// Bind the listening socket
    pub async fn bind(addr: &str, service: Arc<FileServer>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!(addr = addr, "File server listening");
        Ok(Self { service, listener })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("No local address")
    }

    /// Run the accept loop until the process shuts down
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Proxy connected");
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Serve one proxy connection's request/response pairs
async fn handle_connection(stream: TcpStream, service: Arc<FileServer>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Proxy disconnected");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Request>(trimmed) {
                    Ok(request) => process_request(&service, request).await,
                    Err(e) => {
                        error!(error = %e, "Failed to parse request");
                        Response::Status { code: -libc::EINVAL }
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
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    Ok(())
}

/// Dispatch one request against the file store
async fn process_request(service: &FileServer, request: Request) -> Response {
    match request {
        Request::OpenFile { path, mode } => {
            let data = service
                .open_file(&path, mode)
                .await
                .unwrap_or_else(|e| FileData::failure(&path, &e));
            Response::File { data }
        }
        Request::CloseFile { data } => {
            let version = service.close_file(data).await.unwrap_or(-1);
            Response::Version { version }
        }
        Request::CheckVersion { path, version } => {
            match service.check_version(&path, version).await {
                Ok(Some(data)) => Response::File { data },
                Ok(None) => Response::Unchanged,
                Err(e) => Response::File {
                    data: FileData::failure(&path, &e),
                },
            }
        }
        Request::Read { path, offset } => {
            let data = service
                .read(&path, offset)
                .await
                .unwrap_or_else(|e| FileData::failure(&path, &e));
            Response::File { data }
        }
        Request::WriteChunk { temp, data, offset } => {
            let code = match service.write_chunk(&temp, &data, offset).await {
                Ok(()) => 0,
                Err(e) => e.code(),
            };
            Response::Status { code }
        }
        Request::CloseChunk { temp, path } => {
            let version = service.close_chunk(&temp, &path).await.unwrap_or(-1);
            Response::Version { version }
        }
        Request::Unlink { path } => {
            let code = match service.unlink(&path).await {
                Ok(()) => 0,
                Err(e) => e.code(),
            };
            Response::Status { code }
        }
    }
}
