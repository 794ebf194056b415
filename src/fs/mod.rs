//! Client session handling against the local cache

pub mod handles;
pub mod paths;
pub mod session;

pub use handles::{FileHandle, HandleTable};
pub use session::SessionHandler;
