//! Remote file service client
//!
//! Connects to the file server over TCP and exchanges newline-delimited JSON
//! request/response pairs. Each proxy session owns one client, so a call in
//! flight suspends only that session.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{self, FileData, OpenMode, Request, Response};
use super::FileService;
use crate::error::FsError;

/// Deadline applied to every remote call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP client for the remote file service
pub struct RemoteClient {
    conn: Mutex<Connection>,
}

impl RemoteClient {
    /// Connect to a file server at `host:port`
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to file server at {}", addr))?;
        let (reader, writer) = stream.into_split();
        debug!(addr = addr, "Connected to file server");
        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(reader),
                writer,
            }),
        })
    }

    /// Send one request and wait for its response under the call deadline
    async fn call(&self, request: &Request) -> Result<Response, FsError> {
        let frame = protocol::encode_line(request)
            .map_err(|e| FsError::Internal(format!("failed to encode request: {}", e)))?;

        let mut conn = self.conn.lock().await;
        let exchange = async {
            conn.writer.write_all(&frame).await?;
            let mut line = String::new();
            let n = conn.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file server closed the connection",
                ));
            }
            Ok(line)
        };

        let line = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| FsError::Internal("file server request timed out".into()))?
            .map_err(|e: std::io::Error| FsError::Internal(format!("transport failure: {}", e)))?;

        serde_json::from_str(line.trim())
            .map_err(|e| FsError::Internal(format!("malformed response: {}", e)))
    }

    fn unexpected(response: Response) -> FsError {
        FsError::Internal(format!("unexpected response: {:?}", response))
    }
}

#[async_trait]
impl FileService for RemoteClient {
    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileData, FsError> {
        let response = self
            .call(&Request::OpenFile {
                path: path.to_string(),
                mode,
            })
            .await?;
        match response {
            Response::File { data } => Ok(data),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn close_file(&self, data: FileData) -> Result<i64, FsError> {
        let response = self.call(&Request::CloseFile { data }).await?;
        match response {
            Response::Version { version } => Ok(version),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn check_version(&self, path: &str, version: i64) -> Result<Option<FileData>, FsError> {
        let response = self
            .call(&Request::CheckVersion {
                path: path.to_string(),
                version,
            })
            .await?;
        match response {
            Response::File { data } => Ok(Some(data)),
            Response::Unchanged => Ok(None),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn read(&self, path: &str, offset: u64) -> Result<FileData, FsError> {
        let response = self
            .call(&Request::Read {
                path: path.to_string(),
                offset,
            })
            .await?;
        match response {
            Response::File { data } => Ok(data),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn write_chunk(&self, temp: &str, data: &[u8], offset: u64) -> Result<(), FsError> {
        let response = self
            .call(&Request::WriteChunk {
                temp: temp.to_string(),
                data: data.to_vec(),
                offset,
            })
            .await?;
        match response {
            Response::Status { code: 0 } => Ok(()),
            Response::Status { code } => Err(FsError::from_code(code)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn close_chunk(&self, temp: &str, path: &str) -> Result<i64, FsError> {
        let response = self
            .call(&Request::CloseChunk {
                temp: temp.to_string(),
                path: path.to_string(),
            })
            .await?;
        match response {
            Response::Version { version } => Ok(version),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let response = self
            .call(&Request::Unlink {
                path: path.to_string(),
            })
            .await?;
        match response {
            Response::Status { code: 0 } => Ok(()),
            Response::Status { code } => Err(FsError::from_code(code)),
            other => Err(Self::unexpected(other)),
        }
    }
}
