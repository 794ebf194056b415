//! RPC surface between the proxy and the file server

pub mod client;
pub mod protocol;

use async_trait::async_trait;

use crate::error::FsError;
use protocol::{FileData, OpenMode};

/// Operations the file server exposes to the proxy.
///
/// Implemented by the in-process `FileServer` and by `RemoteClient` over a
/// TCP connection. `open_file`, `check_version` and `read` report per-file
/// failures in-band through `FileData::error`; `Err` values are reserved for
/// transport-level problems.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Open or create a file and return its content (first chunk for large
    /// payloads) together with the current version.
    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileData, FsError>;

    /// Commit buffered content for a path; returns the new version.
    async fn close_file(&self, data: FileData) -> Result<i64, FsError>;

    /// Returns fresh content when the path moved past `version`, `None` when
    /// the caller's copy is still current.
    async fn check_version(&self, path: &str, version: i64) -> Result<Option<FileData>, FsError>;

    /// Read the next chunk of a file starting at `offset`.
    async fn read(&self, path: &str, offset: u64) -> Result<FileData, FsError>;

    /// Append a chunk of a pending upload to a temporary path.
    async fn write_chunk(&self, temp: &str, data: &[u8], offset: u64) -> Result<(), FsError>;

    /// Finalize a chunked upload by moving the temporary file over the final
    /// path; returns the new version.
    async fn close_chunk(&self, temp: &str, path: &str) -> Result<i64, FsError>;

    /// Delete a file and bump its version.
    async fn unlink(&self, path: &str) -> Result<(), FsError>;
}

pub use client::RemoteClient;
pub use protocol::{Request, Response, CHUNK_THRESHOLD};
