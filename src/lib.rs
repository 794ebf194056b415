//! cachefs - caching file proxy and file server
//!
//! A proxy daemon gives local clients POSIX-like descriptor semantics
//! (open/read/write/lseek/close/unlink) against files that live on a remote
//! file server. File content is cached on the proxy's local disk, staleness
//! is detected with per-path version numbers at open time, and modifications
//! are written back to the server when the writer closes. Local disk usage is
//! bounded by an LRU eviction policy that never removes entries pinned by
//! open descriptors.

pub mod cache;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod rpc;
pub mod server;
