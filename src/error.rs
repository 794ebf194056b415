//! Error taxonomy shared by the proxy and the file server.
//!
//! The file server reports failures in-band as a code inside its response
//! values; the proxy maps everything onto small negative integers mirroring
//! POSIX errno conventions for its own clients.

/// Errors surfaced by cache and file operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bad descriptor: {0}")]
    BadDescriptor(u64),

    #[error("cache capacity exceeded")]
    CapacityExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Map the error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::BadDescriptor(_) => libc::EBADF,
            FsError::CapacityExceeded => libc::ENOMEM,
            FsError::Internal(_) => libc::EIO,
        }
    }

    /// Negative wire code carried in responses (`-errno`)
    pub fn code(&self) -> i32 {
        -self.to_errno()
    }

    /// Decode an in-band wire code back into an error
    pub fn from_code(code: i32) -> Self {
        match -code {
            c if c == libc::ENOENT => FsError::NotFound(String::from("remote")),
            c if c == libc::EISDIR => FsError::IsDirectory(String::from("remote")),
            c if c == libc::EACCES => FsError::PermissionDenied(String::from("remote")),
            c if c == libc::EEXIST => FsError::AlreadyExists(String::from("remote")),
            c if c == libc::EBADF => FsError::BadDescriptor(0),
            c if c == libc::ENOMEM => FsError::CapacityExceeded,
            _ => FsError::Internal(format!("remote error code {}", code)),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(err.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            _ => FsError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let errors = [
            FsError::NotFound("x".into()),
            FsError::IsDirectory("x".into()),
            FsError::PermissionDenied("x".into()),
            FsError::AlreadyExists("x".into()),
            FsError::BadDescriptor(7),
            FsError::CapacityExceeded,
        ];
        for err in errors {
            let decoded = FsError::from_code(err.code());
            assert_eq!(decoded.code(), err.code());
        }
    }

    #[test]
    fn test_codes_are_negative() {
        assert_eq!(FsError::NotFound("x".into()).code(), -2);
        assert_eq!(FsError::CapacityExceeded.code(), -12);
        assert_eq!(FsError::IsDirectory("x".into()).code(), -21);
    }

    #[test]
    fn test_unknown_code_is_internal() {
        assert!(matches!(FsError::from_code(-99), FsError::Internal(_)));
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(FsError::from(err), FsError::NotFound(_)));
    }
}
