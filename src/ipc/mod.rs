//! Client-facing descriptor surface over a Unix domain socket

pub mod protocol;
pub mod server;

pub use protocol::{ClientRequest, ClientResponse, SOCKET_PATH};
pub use server::IpcServer;
