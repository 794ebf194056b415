//! Canonical file store
//!
//! Owns the files under a root directory and the per-path version ledger.
//! Versions start at 0 on first reference and are bumped on every committed
//! write or unlink, never reused. Payloads above the chunk threshold are
//! served as a first chunk plus follow-up `read` calls; chunked uploads land
//! in a temporary file that is renamed over the final path on commit, so a
//! half-written file is never visible.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::FsError;
use crate::fs::paths::{ensure_parent, normalize};
use crate::rpc::protocol::{FileData, OpenMode, CHUNK_THRESHOLD};
use crate::rpc::FileService;

/// File store rooted at a directory with a version ledger
pub struct FileServer {
    root: PathBuf,
    versions: Mutex<HashMap<String, i64>>,
}

impl FileServer {
    /// Create a file server rooted at `root`, creating the directory if
    /// needed
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create server root: {:?}", root))?;
        info!(root = %root.display(), "File server initialized");
        Ok(Self {
            root,
            versions: Mutex::new(HashMap::new()),
        })
    }

    /// Normalize an incoming path and resolve it under the root
    fn resolve(&self, raw: &str) -> Result<(String, PathBuf), FsError> {
        let rel =
            normalize(raw).ok_or_else(|| FsError::PermissionDenied(raw.to_string()))?;
        let full = self.root.join(&rel);
        Ok((rel, full))
    }

    /// Current version for a path, initializing the ledger on first
    /// reference
    fn current_version(&self, rel: &str) -> i64 {
        *self
            .versions
            .lock()
            .unwrap()
            .entry(rel.to_string())
            .or_insert(0)
    }

    /// Advance a path's version after a committed mutation
    fn bump_version(&self, rel: &str) -> i64 {
        let mut versions = self.versions.lock().unwrap();
        let version = versions.entry(rel.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    /// Read a file's content into a response, switching to the chunk
    /// protocol above the threshold
    fn load(&self, rel: &str, full: &Path) -> Result<FileData, FsError> {
        let length = fs::metadata(full)?.len();
        let version = self.current_version(rel);
        if length > CHUNK_THRESHOLD {
            let mut file = fs::File::open(full)?;
            let mut first = vec![0u8; CHUNK_THRESHOLD as usize];
            file.read_exact(&mut first)?;
            debug!(path = %rel, size = length, "Serving first chunk of large file");
            Ok(FileData::chunked(rel, first, length, CHUNK_THRESHOLD, version))
        } else {
            let content = fs::read(full)?;
            Ok(FileData::complete(rel, content, version))
        }
    }

    fn open_create(&self, rel: &str, full: &Path) -> Result<FileData, FsError> {
        ensure_parent(full)?;
        match fs::metadata(full) {
            Ok(meta) => {
                if meta.is_dir() {
                    return Err(FsError::IsDirectory(rel.to_string()));
                }
                if meta.permissions().readonly() {
                    return Err(FsError::PermissionDenied(rel.to_string()));
                }
            }
            Err(_) => {
                fs::File::create(full)?;
                debug!(path = %rel, "Created file");
            }
        }
        self.load(rel, full)
    }

    fn open_create_new(&self, rel: &str, full: &Path) -> Result<FileData, FsError> {
        if full.exists() {
            return Err(FsError::AlreadyExists(rel.to_string()));
        }
        ensure_parent(full)?;
        fs::File::create(full)?;
        debug!(path = %rel, "Created new file");
        self.load(rel, full)
    }

    fn open_write(&self, rel: &str, full: &Path) -> Result<FileData, FsError> {
        let meta =
            fs::metadata(full).map_err(|_| FsError::NotFound(rel.to_string()))?;
        if meta.is_dir() {
            return Err(FsError::IsDirectory(rel.to_string()));
        }
        if meta.permissions().readonly() {
            return Err(FsError::PermissionDenied(rel.to_string()));
        }
        self.load(rel, full)
    }

    fn open_read(&self, rel: &str, full: &Path) -> Result<FileData, FsError> {
        let meta =
            fs::metadata(full).map_err(|_| FsError::NotFound(rel.to_string()))?;
        if meta.is_dir() {
            return Ok(FileData::directory(rel, self.current_version(rel)));
        }
        self.load(rel, full)
    }

    fn read_chunk(&self, rel: &str, full: &Path, offset: u64) -> Result<FileData, FsError> {
        let mut file = fs::File::open(full)?;
        let length = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; CHUNK_THRESHOLD as usize];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        let version = self.current_version(rel);
        Ok(FileData::chunked(rel, buf, length, offset + n as u64, version))
    }
}

#[async_trait]
impl FileService for FileServer {
    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileData, FsError> {
        let (rel, full) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(path = %path, error = %e, "Rejected open");
                return Ok(FileData::failure(path, &e));
            }
        };
        let result = match mode {
            OpenMode::Create => self.open_create(&rel, &full),
            OpenMode::CreateNew => self.open_create_new(&rel, &full),
            OpenMode::Write => self.open_write(&rel, &full),
            OpenMode::Read => self.open_read(&rel, &full),
        };
        Ok(match result {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %rel, mode = ?mode, error = %e, "Open failed");
                FileData::failure(&rel, &e)
            }
        })
    }

    async fn close_file(&self, data: FileData) -> Result<i64, FsError> {
        let (rel, full) = self.resolve(&data.path)?;
        let content = data.content.unwrap_or_default();
        ensure_parent(&full)?;
        fs::write(&full, &content)?;
        let version = self.bump_version(&rel);
        info!(path = %rel, version = version, size = content.len(), "Committed file");
        Ok(version)
    }

    async fn check_version(&self, path: &str, version: i64) -> Result<Option<FileData>, FsError> {
        let (rel, full) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(Some(FileData::failure(path, &e))),
        };
        if !full.exists() {
            return Ok(Some(FileData::failure(
                &rel,
                &FsError::NotFound(rel.clone()),
            )));
        }
        let current = self.current_version(&rel);
        if current == version {
            return Ok(None);
        }
        debug!(path = %rel, cached = version, current = current, "Version check found stale copy");
        Ok(Some(match self.load(&rel, &full) {
            Ok(data) => data,
            Err(e) => FileData::failure(&rel, &e),
        }))
    }

    async fn read(&self, path: &str, offset: u64) -> Result<FileData, FsError> {
        let (rel, full) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(FileData::failure(path, &e)),
        };
        Ok(match self.read_chunk(&rel, &full, offset) {
            Ok(data) => data,
            Err(e) => FileData::failure(&rel, &e),
        })
    }

    async fn write_chunk(&self, temp: &str, data: &[u8], offset: u64) -> Result<(), FsError> {
        let (_, full) = self.resolve(temp)?;
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    async fn close_chunk(&self, temp: &str, path: &str) -> Result<i64, FsError> {
        let (_, temp_full) = self.resolve(temp)?;
        let (rel, full) = self.resolve(path)?;
        ensure_parent(&full)?;
        fs::rename(&temp_full, &full)?;
        let version = self.bump_version(&rel);
        info!(path = %rel, version = version, "Committed chunked upload");
        Ok(version)
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let (rel, full) = self.resolve(path)?;
        let meta =
            fs::symlink_metadata(&full).map_err(|_| FsError::NotFound(rel.clone()))?;
        if meta.is_dir() {
            return Err(FsError::IsDirectory(rel));
        }
        fs::remove_file(&full)?;
        let version = self.bump_version(&rel);
        info!(path = %rel, version = version, "Unlinked file");
        Ok(())
    }
}
