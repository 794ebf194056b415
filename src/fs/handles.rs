//! File descriptor tracking
//!
//! Each session owns one handle table. open() assigns a descriptor,
//! read()/write()/lseek() use it, close() removes it. Descriptor ids are
//! never reused within a session.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use tracing::debug;

/// First descriptor handed out (0-2 are conventionally taken)
const FIRST_FD: u64 = 3;

/// Access mode a descriptor was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    Read,
    Write,
}

/// Represents an open descriptor backed by a local copy
pub struct FileHandle {
    /// Normalized path the descriptor was opened for
    pub path: String,
    /// Local backing copy (shared read copy or private write copy)
    pub copy_path: PathBuf,
    /// Open local file, absent for directory descriptors
    pub file: Option<File>,
    /// Version of the content at open time
    pub version: i64,
    /// Access mode
    pub mode: HandleMode,
    /// Whether the handle has been written to
    pub dirty: bool,
    /// Whether the descriptor names a directory
    pub is_directory: bool,
    /// Tracked length of the backing copy in bytes
    pub length: u64,
}

impl FileHandle {
    /// Handle for a directory; no local copy is materialized
    pub fn directory(path: &str, version: i64) -> Self {
        Self {
            path: path.to_string(),
            copy_path: PathBuf::new(),
            file: None,
            version,
            mode: HandleMode::Read,
            dirty: false,
            is_directory: true,
            length: 0,
        }
    }
}

/// Per-session table of open descriptors
pub struct HandleTable {
    handles: HashMap<u64, FileHandle>,
    next_fd: u64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_fd: FIRST_FD,
        }
    }

    /// Reserve the next descriptor id; ids are never handed out twice
    pub fn next_fd(&mut self) -> u64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    /// Register an open handle under a previously reserved descriptor
    pub fn insert(&mut self, fd: u64, handle: FileHandle) {
        debug!(fd = fd, path = %handle.path, "Opened file handle");
        self.handles.insert(fd, handle);
    }

    pub fn get(&self, fd: u64) -> Option<&FileHandle> {
        self.handles.get(&fd)
    }

    pub fn get_mut(&mut self, fd: u64) -> Option<&mut FileHandle> {
        self.handles.get_mut(&fd)
    }

    /// Remove a handle; the caller performs any write-back or cleanup
    pub fn remove(&mut self, fd: u64) -> Option<FileHandle> {
        let handle = self.handles.remove(&fd);
        if let Some(ref h) = handle {
            debug!(fd = fd, path = %h.path, dirty = h.dirty, "Closed file handle");
        }
        handle
    }

    /// Descriptors currently open, for session teardown
    pub fn open_fds(&self) -> Vec<u64> {
        self.handles.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_ids_never_reused() {
        let mut table = HandleTable::new();
        let a = table.next_fd();
        table.insert(a, FileHandle::directory("a", 0));
        let b = table.next_fd();
        assert_ne!(a, b);

        table.remove(a).unwrap();
        let c = table.next_fd();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let mut table = HandleTable::new();
        assert!(table.remove(42).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_open_fds_lists_open_handles() {
        let mut table = HandleTable::new();
        let a = table.next_fd();
        table.insert(a, FileHandle::directory("a", 0));
        let b = table.next_fd();
        table.insert(b, FileHandle::directory("b", 0));

        let mut fds = table.open_fds();
        fds.sort_unstable();
        assert_eq!(fds, vec![a, b]);
        assert_eq!(table.len(), 2);
    }
}
