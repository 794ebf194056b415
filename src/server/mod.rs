//! Canonical file store and its TCP front end

pub mod listener;
pub mod service;

pub use listener::ServerListener;
pub use service::FileServer;
