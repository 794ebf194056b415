//! Path normalization and local copy naming
//!
//! Client-supplied paths are resolved lexically against the cache root; any
//! path that would escape it is rejected. Local copies are named by version
//! so several versions of one file can coexist while readers drain.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Normalize a client path to a relative path inside the root.
///
/// Leading slashes are treated as relative to the root; `.` components are
/// dropped and `..` components resolved lexically. Returns `None` when the
/// path climbs above the root or resolves to the root itself.
pub fn normalize(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Name of the shared read copy for one version of a path
pub fn copy_name(path: &str, version: i64) -> String {
    format!("{}_{}", path, version)
}

/// Name of a descriptor-private write copy pending commit
pub fn write_copy_name(path: &str, fd: u64, version: i64) -> String {
    format!("{}_{}_{}", path, fd, version)
}

/// Create the parent directories of a local copy as needed
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique temporary name for a chunked upload
pub fn upload_name() -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(".upload-{}-{}", std::process::id(), seq)
}
