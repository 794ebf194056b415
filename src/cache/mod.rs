//! Proxy-local cache shared across all client sessions

pub mod manager;

pub use manager::{CacheManager, EntryInfo};
