//! Wire protocol between the proxy and the file server
//!
//! Newline-delimited JSON request/response pairs over a single TCP
//! connection. File content travels base64-encoded inside the JSON frames.

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Payloads above this size are transferred through the chunk protocol
/// instead of a single message.
pub const CHUNK_THRESHOLD: u64 = 300_000;

/// Open modes understood by the file server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenMode {
    /// Create the file if it does not exist, then open it for writing
    Create,
    /// Create the file, failing if it already exists
    CreateNew,
    /// Open an existing file for writing
    Write,
    /// Open an existing file (or directory) for reading
    Read,
}

/// File content and metadata exchanged with the file server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    /// Path relative to the server root
    pub path: String,
    /// File content, absent for directories and error responses
    #[serde(with = "base64_opt", default)]
    pub content: Option<Vec<u8>>,
    /// Total file size in bytes (may exceed the content length for chunked
    /// responses)
    pub size: u64,
    /// Continuation cursor for chunked transfers
    pub offset: u64,
    /// 0 on success, negative taxonomy code on failure
    pub error: i32,
    /// Whether the path names a directory
    pub is_directory: bool,
    /// Server-assigned version of the content
    pub version: i64,
}

impl FileData {
    /// Complete single-message content
    pub fn complete(path: &str, content: Vec<u8>, version: i64) -> Self {
        let size = content.len() as u64;
        Self {
            path: path.to_string(),
            content: Some(content),
            size,
            offset: 0,
            error: 0,
            is_directory: false,
            version,
        }
    }

    /// First chunk of a large payload; the caller continues with `read` calls
    pub fn chunked(path: &str, first: Vec<u8>, size: u64, offset: u64, version: i64) -> Self {
        Self {
            path: path.to_string(),
            content: Some(first),
            size,
            offset,
            error: 0,
            is_directory: false,
            version,
        }
    }

    /// Directory marker (no content is transferred for directories)
    pub fn directory(path: &str, version: i64) -> Self {
        Self {
            path: path.to_string(),
            content: None,
            size: 0,
            offset: 0,
            error: 0,
            is_directory: true,
            version,
        }
    }

    /// In-band failure response
    pub fn failure(path: &str, err: &FsError) -> Self {
        Self {
            path: path.to_string(),
            content: None,
            size: 0,
            offset: 0,
            error: err.code(),
            is_directory: false,
            version: -1,
        }
    }

    /// Content buffered by the proxy for a commit
    pub fn commit(path: &str, content: Vec<u8>) -> Self {
        let size = content.len() as u64;
        Self {
            path: path.to_string(),
            content: Some(content),
            size,
            offset: 0,
            error: 0,
            is_directory: false,
            version: 0,
        }
    }

    /// Convert an in-band error code into an `Err` value
    pub fn check_error(&self) -> Result<(), FsError> {
        if self.error < 0 {
            Err(FsError::from_code(self.error))
        } else {
            Ok(())
        }
    }
}

/// Requests sent from the proxy to the file server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    OpenFile { path: String, mode: OpenMode },
    #[serde(rename_all = "camelCase")]
    CloseFile { data: FileData },
    #[serde(rename_all = "camelCase")]
    CheckVersion { path: String, version: i64 },
    #[serde(rename_all = "camelCase")]
    Read { path: String, offset: u64 },
    #[serde(rename_all = "camelCase")]
    WriteChunk {
        temp: String,
        #[serde(with = "base64_vec")]
        data: Vec<u8>,
        offset: u64,
    },
    #[serde(rename_all = "camelCase")]
    CloseChunk { temp: String, path: String },
    #[serde(rename_all = "camelCase")]
    Unlink { path: String },
}

/// Responses sent from the file server to the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// File content or an in-band failure
    #[serde(rename_all = "camelCase")]
    File { data: FileData },
    /// The caller's version is still current
    Unchanged,
    /// New version after a commit, or -1 on failure
    #[serde(rename_all = "camelCase")]
    Version { version: i64 },
    /// Status code: 0 on success, negative taxonomy code on failure
    #[serde(rename_all = "camelCase")]
    Status { code: i32 },
}

/// Serialize a protocol value to a newline-delimited JSON frame
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(value)?;
    json.push(b'\n');
    Ok(json)
}

/// Base64 codec for optional content bytes
mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Base64 codec for mandatory byte fields
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
    fn test_parse_open_file_request() {
        let json = r#"{"type":"openFile","path":"docs/notes.txt","mode":"createNew"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::OpenFile { path, mode } => {
                assert_eq!(path, "docs/notes.txt");
                assert_eq!(mode, OpenMode::CreateNew);
            }
            _ => panic!("Expected OpenFile request"),
        }
    }

    #[test]
    fn test_parse_check_version_request() {
        let json = r#"{"type":"checkVersion","path":"a.txt","version":3}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::CheckVersion { path, version } => {
                assert_eq!(path, "a.txt");
                assert_eq!(version, 3);
            }
            _ => panic!("Expected CheckVersion request"),
        }
    }

    #[test]
    fn test_content_round_trips_as_base64() {
        let data = FileData::complete("bin/blob", vec![0u8, 159, 146, 150], 2);
        let json = serde_json::to_string(&Response::File { data }).unwrap();
        assert!(json.contains("AJ+Slg=="));

        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::File { data } => {
                assert_eq!(data.content.as_deref(), Some(&[0u8, 159, 146, 150][..]));
                assert_eq!(data.size, 4);
                assert_eq!(data.version, 2);
            }
            _ => panic!("Expected File response"),
        }
    }

    #[test]
    fn test_failure_carries_wire_code() {
        let data = FileData::failure("gone.txt", &FsError::NotFound("gone.txt".into()));
        assert_eq!(data.error, -2);
        assert!(data.check_error().is_err());
        assert!(data.content.is_none());
    }

    #[test]
    fn test_encode_line_is_newline_delimited() {
        let line = encode_line(&Response::Unchanged).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains("unchanged"));
    }

    #[test]
    fn test_write_chunk_round_trip() {
        let request = Request::WriteChunk {
            temp: ".upload-1".into(),
            data: b"abc".to_vec(),
            offset: 600_000,
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        match parsed {
            Request::WriteChunk { temp, data, offset } => {
                assert_eq!(temp, ".upload-1");
                assert_eq!(data, b"abc");
                assert_eq!(offset, 600_000);
            }
            _ => panic!("Expected WriteChunk request"),
        }
    }
}
