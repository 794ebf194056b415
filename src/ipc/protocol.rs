//! Client protocol definitions
//!
//! Newline-delimited JSON exchanged between local clients and the proxy over
//! a Unix domain socket. Failures are reported as small negative integers
//! mirroring POSIX errno conventions.

use serde::{Deserialize, Serialize};

use crate::fs::session::Whence;
use crate::rpc::protocol::OpenMode;

/// Default socket path for client connections
pub const SOCKET_PATH: &str = "/tmp/cachefs.sock";

/// Descriptor calls sent from clients to the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Open { path: String, mode: OpenMode },
    #[serde(rename_all = "camelCase")]
    Read { fd: u64, len: u64 },
    #[serde(rename_all = "camelCase")]
    Write {
        fd: u64,
        #[serde(with = "base64_vec")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Lseek { fd: u64, offset: i64, whence: Whence },
    #[serde(rename_all = "camelCase")]
    Close { fd: u64 },
    #[serde(rename_all = "camelCase")]
    Unlink { path: String },
}

/// Responses sent from the proxy back to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientResponse {
    /// Descriptor on success, negative error code otherwise
    #[serde(rename_all = "camelCase")]
    Fd { fd: i64 },
    /// Bytes read; count is negative on failure
    #[serde(rename_all = "camelCase")]
    Data {
        count: i64,
        #[serde(with = "base64_vec")]
        data: Vec<u8>,
    },
    /// Bytes written, negative on failure
    #[serde(rename_all = "camelCase")]
    Count { count: i64 },
    /// New file offset, negative on failure
    #[serde(rename_all = "camelCase")]
    Offset { offset: i64 },
    /// 0 on success, negative error code otherwise
    #[serde(rename_all = "camelCase")]
    Code { code: i32 },
}

/// Base64 codec for byte payloads
mod base64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_request() {
        let json = r#"{"type":"open","path":"notes.txt","mode":"create"}"#;
        let request: ClientRequest = serde_json::from_str(json).unwrap();
        match request {
            ClientRequest::Open { path, mode } => {
                assert_eq!(path, "notes.txt");
                assert_eq!(mode, OpenMode::Create);
            }
            _ => panic!("Expected Open request"),
        }
    }

    #[test]
    fn test_parse_lseek_request() {
        let json = r#"{"type":"lseek","fd":4,"offset":-2,"whence":"end"}"#;
        let request: ClientRequest = serde_json::from_str(json).unwrap();
        match request {
            ClientRequest::Lseek { fd, offset, whence } => {
                assert_eq!(fd, 4);
                assert_eq!(offset, -2);
                assert_eq!(whence, Whence::End);
            }
            _ => panic!("Expected Lseek request"),
        }
    }

    #[test]
    fn test_write_payload_round_trips() {
        let request = ClientRequest::Write {
            fd: 3,
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("aGVsbG8="));
        let parsed: ClientRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientRequest::Write { fd, data } => {
                assert_eq!(fd, 3);
                assert_eq!(data, b"hello");
            }
            _ => panic!("Expected Write request"),
        }
    }

    #[test]
    fn test_serialize_error_fd_response() {
        let response = ClientResponse::Fd { fd: -2 };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"fd\":-2"));
    }
}
