//! Per-connection session handler
//!
//! Implements the descriptor call surface (open/read/write/lseek/close/
//! unlink) against locally cached copies, fetching from the file service on a
//! miss or when the cached version is stale, and writing modified files back
//! at close time. Each session owns its descriptor table; everything shared
//! across sessions goes through the `CacheManager`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, EntryInfo};
use crate::error::FsError;
use crate::fs::handles::{FileHandle, HandleMode, HandleTable};
use crate::fs::paths;
use crate::rpc::protocol::{FileData, OpenMode, CHUNK_THRESHOLD};
use crate::rpc::FileService;

/// Seek origin for lseek
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Handles one client connection's descriptor calls
pub struct SessionHandler {
    cache: Arc<CacheManager>,
    service: Arc<dyn FileService>,
    handles: HandleTable,
}

impl SessionHandler {
    pub fn new(cache: Arc<CacheManager>, service: Arc<dyn FileService>) -> Self {
        Self {
            cache,
            service,
            handles: HandleTable::new(),
        }
    }

    /// Open a path in the given mode and return a descriptor
    pub async fn open(&mut self, raw_path: &str, mode: OpenMode) -> Result<u64, FsError> {
        let path = paths::normalize(raw_path)
            .ok_or_else(|| FsError::PermissionDenied(raw_path.to_string()))?;
        match mode {
            OpenMode::Read => self.open_read(&path).await,
            OpenMode::CreateNew => self.open_create_new(&path).await,
            OpenMode::Create | OpenMode::Write => self.open_write(&path, mode).await,
        }
    }

    /// Read up to `len` bytes from the descriptor's current position
    pub fn read(&mut self, fd: u64, len: u64) -> Result<Vec<u8>, FsError> {
        let handle = self.handles.get_mut(fd).ok_or(FsError::BadDescriptor(fd))?;
        if handle.is_directory {
            return Err(FsError::IsDirectory(handle.path.clone()));
        }
        let file = handle.file.as_mut().ok_or(FsError::BadDescriptor(fd))?;
        let mut buf = vec![0u8; len as usize];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write bytes at the descriptor's current position, marking it dirty
    pub fn write(&mut self, fd: u64, data: &[u8]) -> Result<u64, FsError> {
        let handle = self.handles.get_mut(fd).ok_or(FsError::BadDescriptor(fd))?;
        if handle.is_directory {
            return Err(FsError::IsDirectory(handle.path.clone()));
        }
        if handle.mode != HandleMode::Write {
            return Err(FsError::BadDescriptor(fd));
        }
        let file = handle.file.as_mut().ok_or(FsError::BadDescriptor(fd))?;
        file.write_all(data)?;
        handle.dirty = true;

        let new_len = file.metadata()?.len();
        let old_len = handle.length;
        if new_len > old_len {
            self.cache.update_usage(old_len, new_len)?;
            handle.length = new_len;
        }
        Ok(data.len() as u64)
    }

    /// Reposition the descriptor and return the new offset
    pub fn lseek(&mut self, fd: u64, offset: i64, whence: Whence) -> Result<u64, FsError> {
        let handle = self.handles.get_mut(fd).ok_or(FsError::BadDescriptor(fd))?;
        if handle.is_directory {
            return Err(FsError::IsDirectory(handle.path.clone()));
        }
        let file = handle.file.as_mut().ok_or(FsError::BadDescriptor(fd))?;
        let target = match whence {
            Whence::Start => {
                if offset < 0 {
                    return Err(FsError::Internal("seek before start of file".into()));
                }
                SeekFrom::Start(offset as u64)
            }
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        Ok(file.seek(target)?)
    }

    /// Close a descriptor, writing modified content back to the server
    pub async fn close(&mut self, fd: u64) -> Result<(), FsError> {
        let mut handle = self.handles.remove(fd).ok_or(FsError::BadDescriptor(fd))?;
        if handle.is_directory {
            self.cache.unref_entry(&handle.path);
            return Ok(());
        }
        // Release the open file before the backing copy is renamed or deleted
        handle.file = None;

        let result = if handle.dirty {
            self.write_back(&handle).await
        } else if handle.mode == HandleMode::Write {
            self.discard_write_copy(&handle)
        } else {
            self.cache.drop_read_copy(&handle.path, handle.version);
            Ok(())
        };
        self.cache.unref_entry(&handle.path);
        result
    }

    /// Delete a file on the server; its version is bumped so cached copies
    /// are detected as stale on the next open
    pub async fn unlink(&mut self, raw_path: &str) -> Result<(), FsError> {
        let path = paths::normalize(raw_path)
            .ok_or_else(|| FsError::PermissionDenied(raw_path.to_string()))?;
        self.service.unlink(&path).await
    }

    /// Close every descriptor the session still holds.
    ///
    /// Invoked when the client connection ends so reference counts are
    /// released even after an abrupt disconnect.
    pub async fn teardown(&mut self) {
        let fds = self.handles.open_fds();
        if !fds.is_empty() {
            debug!(open = fds.len(), "Tearing down session descriptors");
        }
        for fd in fds {
            if let Err(e) = self.close(fd).await {
                warn!(fd = fd, error = %e, "Failed to close descriptor at teardown");
            }
        }
    }

    /// Number of descriptors currently open
    pub fn open_descriptors(&self) -> usize {
        self.handles.len()
    }

    async fn open_read(&mut self, path: &str) -> Result<u64, FsError> {
        if let Some(entry) = self.cache.obtain(path) {
            if entry.is_directory {
                return Ok(self.open_directory(path, entry.version));
            }
            let entry = self.revalidate(path, entry).await?;
            self.finish_open_read(path, entry.version)
        } else {
            let data = self.service.open_file(path, OpenMode::Read).await?;
            data.check_error()?;
            if data.is_directory {
                self.cache.insert(path, true, data.version, 0)?;
                return Ok(self.open_directory(path, data.version));
            }
            let entry = self.admit(path, &data).await?;
            self.finish_open_read(path, entry.version)
        }
    }

    async fn open_write(&mut self, path: &str, mode: OpenMode) -> Result<u64, FsError> {
        let entry = if let Some(entry) = self.cache.obtain(path) {
            if entry.is_directory {
                return Err(FsError::IsDirectory(path.to_string()));
            }
            self.revalidate(path, entry).await?
        } else {
            let data = self.service.open_file(path, mode).await?;
            data.check_error()?;
            if data.is_directory {
                return Err(FsError::IsDirectory(path.to_string()));
            }
            self.admit(path, &data).await?
        };

        let fd = self.handles.next_fd();
        self.make_write_copy(path, entry.version, fd)?;
        self.cache.ref_entry(path);
        Ok(fd)
    }

    async fn open_create_new(&mut self, path: &str) -> Result<u64, FsError> {
        let data = self.service.open_file(path, OpenMode::CreateNew).await?;
        data.check_error()?;
        let entry = if self.cache.obtain(path).is_some() {
            self.refresh(path, &data).await?
        } else {
            self.admit(path, &data).await?
        };

        let fd = self.handles.next_fd();
        self.make_write_copy(path, entry.version, fd)?;
        self.cache.ref_entry(path);
        Ok(fd)
    }

    fn open_directory(&mut self, path: &str, version: i64) -> u64 {
        let fd = self.handles.next_fd();
        self.handles.insert(fd, FileHandle::directory(path, version));
        self.cache.ref_entry(path);
        fd
    }

    fn finish_open_read(&mut self, path: &str, version: i64) -> Result<u64, FsError> {
        let copy_path = self.cache.cache_dir().join(paths::copy_name(path, version));
        let file = File::open(&copy_path)?;
        let length = file.metadata()?.len();

        let fd = self.handles.next_fd();
        self.cache.read_ref(path, version);
        self.cache.ref_entry(path);
        self.handles.insert(
            fd,
            FileHandle {
                path: path.to_string(),
                copy_path,
                file: Some(file),
                version,
                mode: HandleMode::Read,
                dirty: false,
                is_directory: false,
                length,
            },
        );
        Ok(fd)
    }

    /// Ask the server whether the cached version is current, refreshing the
    /// local copy when it is not
    async fn revalidate(&mut self, path: &str, entry: EntryInfo) -> Result<EntryInfo, FsError> {
        match self.service.check_version(path, entry.version).await? {
            None => Ok(entry),
            Some(update) => {
                update.check_error()?;
                debug!(
                    path = %path,
                    cached = entry.version,
                    current = update.version,
                    "Cached copy is stale, refreshing"
                );
                self.refresh(path, &update).await
            }
        }
    }

    /// Track and materialize a path seen for the first time
    async fn admit(&mut self, path: &str, data: &FileData) -> Result<EntryInfo, FsError> {
        self.cache.remove_obsolete(path, data.version);
        self.cache.insert(path, false, data.version, data.size)?;
        if let Err(e) = self.materialize(path, data).await {
            self.cache.discard(path);
            return Err(e);
        }
        debug!(path = %path, version = data.version, size = data.size, "Cache MISS, fetched from server");
        Ok(EntryInfo {
            version: data.version,
            size: data.size,
            is_directory: false,
        })
    }

    /// Materialize a newer version next to the tracked entry's current copy
    async fn refresh(&mut self, path: &str, update: &FileData) -> Result<EntryInfo, FsError> {
        self.cache.remove_obsolete(path, update.version);
        self.cache.update_usage(0, update.size)?;
        if let Err(e) = self.materialize(path, update).await {
            let _ = self.cache.update_usage(update.size, 0);
            return Err(e);
        }
        self.cache.promote(path, update.version, update.size);
        Ok(EntryInfo {
            version: update.version,
            size: update.size,
            is_directory: false,
        })
    }

    /// Write fetched content to the versioned local copy, following the
    /// chunk protocol for large payloads
    async fn materialize(&mut self, path: &str, data: &FileData) -> Result<(), FsError> {
        let dest = self
            .cache
            .cache_dir()
            .join(paths::copy_name(path, data.version));
        paths::ensure_parent(&dest)?;
        let dir = dest
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.cache.cache_dir().to_path_buf());

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| FsError::Internal(format!("failed to create temp file: {}", e)))?;

        let mut have: u64 = 0;
        if let Some(bytes) = &data.content {
            tmp.write_all(bytes)?;
            have = bytes.len() as u64;
        }
        while have < data.size {
            let chunk = self.service.read(path, have).await?;
            chunk.check_error()?;
            let bytes = chunk.content.as_deref().unwrap_or(&[]);
            if bytes.is_empty() {
                return Err(FsError::Internal(format!(
                    "short read from file server at offset {}",
                    have
                )));
            }
            let take = (bytes.len() as u64).min(data.size - have) as usize;
            tmp.write_all(&bytes[..take])?;
            have += take as u64;
        }

        tmp.persist(&dest)
            .map_err(|e| FsError::Internal(format!("failed to persist cached copy: {}", e)))?;
        debug!(path = %path, version = data.version, size = data.size, "Materialized cached copy");
        Ok(())
    }

    /// Duplicate the shared read copy into a descriptor-private write copy
    fn make_write_copy(&mut self, path: &str, version: i64, fd: u64) -> Result<(), FsError> {
        let read_copy = self.cache.cache_dir().join(paths::copy_name(path, version));
        let copy_path = self
            .cache
            .cache_dir()
            .join(paths::write_copy_name(path, fd, version));

        let length = std::fs::metadata(&read_copy).map(|m| m.len()).unwrap_or(0);
        self.cache.update_usage(0, length)?;
        if let Err(e) = std::fs::copy(&read_copy, &copy_path) {
            let _ = self.cache.update_usage(length, 0);
            return Err(e.into());
        }
        let file = match File::options().read(true).write(true).open(&copy_path) {
            Ok(file) => file,
            Err(e) => {
                let _ = self.cache.update_usage(length, 0);
                let _ = std::fs::remove_file(&copy_path);
                return Err(e.into());
            }
        };

        self.handles.insert(
            fd,
            FileHandle {
                path: path.to_string(),
                copy_path,
                file: Some(file),
                version,
                mode: HandleMode::Write,
                dirty: false,
                is_directory: false,
                length,
            },
        );
        Ok(())
    }

    /// Propagate a modified write copy to the server and promote it to the
    /// path's canonical read copy
    async fn write_back(&self, handle: &FileHandle) -> Result<(), FsError> {
        let length = std::fs::metadata(&handle.copy_path)?.len();
        let new_version = if length > CHUNK_THRESHOLD {
            self.write_back_chunked(handle, length).await?
        } else {
            let content = std::fs::read(&handle.copy_path)?;
            self.service
                .close_file(FileData::commit(&handle.path, content))
                .await?
        };
        if new_version < 0 {
            return Err(FsError::Internal(format!(
                "server rejected commit for {}",
                handle.path
            )));
        }

        let dest = self
            .cache
            .cache_dir()
            .join(paths::copy_name(&handle.path, new_version));
        std::fs::rename(&handle.copy_path, &dest)?;
        self.cache.promote(&handle.path, new_version, length);
        self.cache.remove_obsolete(&handle.path, new_version);
        info!(path = %handle.path, version = new_version, size = length, "Wrote back modified file");
        Ok(())
    }

    /// Stream a large write copy to the server through the chunk protocol
    async fn write_back_chunked(&self, handle: &FileHandle, length: u64) -> Result<i64, FsError> {
        let temp = paths::upload_name();
        let mut file = File::open(&handle.copy_path)?;
        let mut buf = vec![0u8; CHUNK_THRESHOLD as usize];
        let mut sent: u64 = 0;
        while sent < length {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.service.write_chunk(&temp, &buf[..n], sent).await?;
            sent += n as u64;
        }
        debug!(path = %handle.path, bytes = sent, "Chunked upload complete");
        self.service.close_chunk(&temp, &handle.path).await
    }

    /// Drop an unmodified write copy and release its bytes
    fn discard_write_copy(&self, handle: &FileHandle) -> Result<(), FsError> {
        let length = std::fs::metadata(&handle.copy_path)
            .map(|m| m.len())
            .unwrap_or(handle.length);
        let _ = self.cache.update_usage(length, 0);
        let _ = std::fs::remove_file(&handle.copy_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::FileServer;
    use tempfile::TempDir;

    const CAPACITY: u64 = 10 * 1024 * 1024;

    struct Fixture {
        server_root: TempDir,
        _cache_root: TempDir,
        cache: Arc<CacheManager>,
        service: Arc<FileServer>,
    }

    fn fixture() -> Fixture {
        fixture_with_capacity(CAPACITY)
    }

    fn fixture_with_capacity(capacity: u64) -> Fixture {
        let server_root = TempDir::new().unwrap();
        let cache_root = TempDir::new().unwrap();
        let service = Arc::new(FileServer::new(server_root.path().to_path_buf()).unwrap());
        let cache =
            Arc::new(CacheManager::new(cache_root.path().to_path_buf(), capacity).unwrap());
        Fixture {
            server_root,
            _cache_root: cache_root,
            cache,
            service,
        }
    }

    fn session(fx: &Fixture) -> SessionHandler {
        let service: Arc<dyn FileService> = fx.service.clone();
        SessionHandler::new(Arc::clone(&fx.cache), service)
    }

    fn read_all(session: &mut SessionHandler, fd: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = session.read(fd, 65536).unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_write_close_read_round_trip() {
        let fx = fixture();
        let mut writer = session(&fx);

        let fd = writer.open("notes.txt", OpenMode::Create).await.unwrap();
        writer.write(fd, b"hello").unwrap();
        writer.close(fd).await.unwrap();

        let mut reader = session(&fx);
        let fd = reader.open("notes.txt", OpenMode::Read).await.unwrap();
        assert_eq!(read_all(&mut reader, fd), b"hello");
        reader.close(fd).await.unwrap();

        // The server holds the committed bytes
        let stored = std::fs::read(fx.server_root.path().join("notes.txt")).unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let fx = fixture();
        let mut s = session(&fx);

        let mut last = 0;
        for round in 0..3 {
            let fd = s.open("v.txt", OpenMode::Create).await.unwrap();
            s.write(fd, format!("round {}", round).as_bytes()).unwrap();
            s.close(fd).await.unwrap();
            let version = fx.cache.obtain("v.txt").unwrap().version;
            assert!(version > last, "version {} did not advance past {}", version, last);
            last = version;
        }
    }

    #[tokio::test]
    async fn test_stale_copy_refreshed_on_open() {
        let fx = fixture();
        let mut s = session(&fx);

        std::fs::write(fx.server_root.path().join("shared.txt"), b"old").unwrap();
        let fd = s.open("shared.txt", OpenMode::Read).await.unwrap();
        assert_eq!(read_all(&mut s, fd), b"old");
        s.close(fd).await.unwrap();

        // Another proxy commits a newer version directly to the server
        let new_version = fx
            .service
            .close_file(FileData::commit("shared.txt", b"new contents".to_vec()))
            .await
            .unwrap();
        assert!(new_version > 0);

        let fd = s.open("shared.txt", OpenMode::Read).await.unwrap();
        assert_eq!(read_all(&mut s, fd), b"new contents");
        s.close(fd).await.unwrap();
        assert_eq!(fx.cache.obtain("shared.txt").unwrap().version, new_version);
    }

    #[tokio::test]
    async fn test_chunked_write_back_matches_single_message() {
        let fx = fixture();
        let mut s = session(&fx);

        let large: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
        let fd = s.open("big.bin", OpenMode::Create).await.unwrap();
        s.write(fd, &large).unwrap();
        s.close(fd).await.unwrap();

        let stored = std::fs::read(fx.server_root.path().join("big.bin")).unwrap();
        assert_eq!(stored, large);

        let small = b"tiny".to_vec();
        let fd = s.open("small.bin", OpenMode::Create).await.unwrap();
        s.write(fd, &small).unwrap();
        s.close(fd).await.unwrap();
        let stored = std::fs::read(fx.server_root.path().join("small.bin")).unwrap();
        assert_eq!(stored, small);
    }

    #[tokio::test]
    async fn test_chunked_fetch_of_large_file() {
        let fx = fixture();
        let large: Vec<u8> = (0..350_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(fx.server_root.path().join("seeded.bin"), &large).unwrap();

        let mut s = session(&fx);
        let fd = s.open("seeded.bin", OpenMode::Read).await.unwrap();
        assert_eq!(read_all(&mut s, fd), large);
        s.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_copy() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("doc.txt"), b"v0").unwrap();

        let mut a = session(&fx);
        let mut b = session(&fx);
        let fd_a = a.open("doc.txt", OpenMode::Read).await.unwrap();
        let fd_b = b.open("doc.txt", OpenMode::Read).await.unwrap();
        assert_eq!(fx.cache.read_refs("doc.txt", 0), 2);
        assert_eq!(fx.cache.entry_references("doc.txt"), 2);

        // A writer supersedes version 0 while both readers stay open
        let mut w = session(&fx);
        let fd_w = w.open("doc.txt", OpenMode::Write).await.unwrap();
        w.write(fd_w, b"v1 contents").unwrap();
        w.close(fd_w).await.unwrap();

        let old_copy = fx.cache.cache_dir().join(paths::copy_name("doc.txt", 0));
        assert!(old_copy.exists(), "copy with live readers must survive");

        a.close(fd_a).await.unwrap();
        assert!(old_copy.exists(), "first close leaves one reader");
        b.close(fd_b).await.unwrap();
        assert!(!old_copy.exists(), "last close deletes the superseded copy");
        assert_eq!(fx.cache.read_refs("doc.txt", 0), 0);
        assert_eq!(fx.cache.entry_references("doc.txt"), 0);
    }

    #[tokio::test]
    async fn test_capacity_error_when_everything_pinned() {
        let fx = fixture_with_capacity(100);
        std::fs::write(fx.server_root.path().join("a.bin"), vec![1u8; 60]).unwrap();
        std::fs::write(fx.server_root.path().join("b.bin"), vec![2u8; 60]).unwrap();

        let mut s = session(&fx);
        let fd_a = s.open("a.bin", OpenMode::Read).await.unwrap();
        let err = s.open("b.bin", OpenMode::Read).await.unwrap_err();
        assert_eq!(err, FsError::CapacityExceeded);
        assert!(fx.cache.contains("a.bin"));
        assert!(fx.cache.total() <= 100);

        // Once the pin is released the second open succeeds
        s.close(fd_a).await.unwrap();
        let fd_b = s.open("b.bin", OpenMode::Read).await.unwrap();
        s.close(fd_b).await.unwrap();
        assert!(!fx.cache.contains("a.bin"));
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let fx = fixture();
        let mut s = session(&fx);
        let err = s.open("../escape.txt", OpenMode::Read).await.unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied(_)));
        let err = s.open("a/../../b", OpenMode::Create).await.unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied(_)));
        let err = s.unlink("../victim").await.unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_unknown_descriptor_is_rejected() {
        let fx = fixture();
        let mut s = session(&fx);
        assert!(matches!(s.read(99, 10), Err(FsError::BadDescriptor(99))));
        assert!(matches!(s.write(99, b"x"), Err(FsError::BadDescriptor(99))));
        assert!(matches!(
            s.lseek(99, 0, Whence::Start),
            Err(FsError::BadDescriptor(99))
        ));
        assert!(matches!(s.close(99).await, Err(FsError::BadDescriptor(99))));

        // A closed descriptor stays closed
        let fd = s.open("x.txt", OpenMode::Create).await.unwrap();
        s.close(fd).await.unwrap();
        assert!(matches!(s.close(fd).await, Err(FsError::BadDescriptor(_))));
    }

    #[tokio::test]
    async fn test_create_new_fails_on_existing() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("taken.txt"), b"here").unwrap();

        let mut s = session(&fx);
        let err = s.open("taken.txt", OpenMode::CreateNew).await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unlink_then_open_reports_not_found() {
        let fx = fixture();
        let mut s = session(&fx);

        let fd = s.open("doomed.txt", OpenMode::Create).await.unwrap();
        s.write(fd, b"bye").unwrap();
        s.close(fd).await.unwrap();

        s.unlink("doomed.txt").await.unwrap();
        let err = s.open("doomed.txt", OpenMode::Read).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_mode_cannot_write() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("ro.txt"), b"data").unwrap();

        let mut s = session(&fx);
        let fd = s.open("ro.txt", OpenMode::Read).await.unwrap();
        assert!(matches!(s.write(fd, b"nope"), Err(FsError::BadDescriptor(_))));
        s.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn test_lseek_repositions() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("seek.txt"), b"0123456789").unwrap();

        let mut s = session(&fx);
        let fd = s.open("seek.txt", OpenMode::Read).await.unwrap();
        assert_eq!(s.lseek(fd, 4, Whence::Start).unwrap(), 4);
        assert_eq!(s.read(fd, 2).unwrap(), b"45");
        assert_eq!(s.lseek(fd, -3, Whence::End).unwrap(), 7);
        assert_eq!(s.read(fd, 10).unwrap(), b"789");
        assert_eq!(s.lseek(fd, -1, Whence::Current).unwrap(), 9);
        s.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_descriptor() {
        let fx = fixture();
        let mut s = session(&fx);

        let fd = s.open("sub/inner.txt", OpenMode::Create).await.unwrap();
        s.write(fd, b"x").unwrap();
        s.close(fd).await.unwrap();

        let fd = s.open("sub", OpenMode::Read).await.unwrap();
        assert!(matches!(s.read(fd, 10), Err(FsError::IsDirectory(_))));
        assert!(matches!(
            s.lseek(fd, 0, Whence::Start),
            Err(FsError::IsDirectory(_))
        ));
        s.close(fd).await.unwrap();
        assert_eq!(fx.cache.entry_references("sub"), 0);

        // Write-mode opens of directories are rejected
        let err = s.open("sub", OpenMode::Write).await.unwrap_err();
        assert!(matches!(err, FsError::IsDirectory(_)));
    }

    #[tokio::test]
    async fn test_clean_write_close_discards_private_copy() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("kept.txt"), b"original").unwrap();

        let mut s = session(&fx);
        let fd = s.open("kept.txt", OpenMode::Write).await.unwrap();
        let write_copy = fx
            .cache
            .cache_dir()
            .join(paths::write_copy_name("kept.txt", fd, 0));
        assert!(write_copy.exists());
        s.close(fd).await.unwrap();

        assert!(!write_copy.exists());
        let stored = std::fs::read(fx.server_root.path().join("kept.txt")).unwrap();
        assert_eq!(stored, b"original");
        assert_eq!(fx.cache.obtain("kept.txt").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_teardown_closes_and_commits() {
        let fx = fixture();
        std::fs::write(fx.server_root.path().join("r.txt"), b"r").unwrap();

        let mut s = session(&fx);
        let _fd_r = s.open("r.txt", OpenMode::Read).await.unwrap();
        let fd_w = s.open("w.txt", OpenMode::Create).await.unwrap();
        s.write(fd_w, b"teardown flush").unwrap();
        assert_eq!(s.open_descriptors(), 2);

        s.teardown().await;
        assert_eq!(s.open_descriptors(), 0);
        assert_eq!(fx.cache.entry_references("r.txt"), 0);
        assert_eq!(fx.cache.entry_references("w.txt"), 0);

        // The dirty handle was written back on teardown
        let stored = std::fs::read(fx.server_root.path().join("w.txt")).unwrap();
        assert_eq!(stored, b"teardown flush");
    }

    #[tokio::test]
    async fn test_cache_bound_holds_at_quiescence() {
        let fx = fixture_with_capacity(150);
        for name in ["a", "b", "c", "d"] {
            std::fs::write(fx.server_root.path().join(name), vec![b'z'; 50]).unwrap();
        }

        let mut s = session(&fx);
        for name in ["a", "b", "c", "d"] {
            let fd = s.open(name, OpenMode::Read).await.unwrap();
            s.close(fd).await.unwrap();
        }
        assert!(fx.cache.total() <= 150);
    }
}
