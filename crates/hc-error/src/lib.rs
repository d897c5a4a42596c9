#![forbid(unsafe_code)]
//! Error types for hcache.
//!
//! Defines `HcError` and a `Result<T>` alias used throughout the workspace.
//! Only `WouldBlock` and `NoDataSpace` are retryable; everything else is
//! fatal to the operation that raised it.

use thiserror::Error;

/// Unified error type for all hcache operations.
#[derive(Debug, Error)]
pub enum HcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation would block")]
    WouldBlock,

    #[error("no space left in the data pool")]
    NoDataSpace,

    #[error("no space left on the metadata device")]
    NoMetadataSpace,

    #[error("checksum mismatch at block {block}: {detail}")]
    ChecksumFail { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("metadata commit failed; device needs reopening")]
    ConsistencyFailed,

    #[error("arena exhausted: {0}")]
    OutOfMemory(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl HcError {
    /// Convert this error into the POSIX errno the block layer reports.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::NoDataSpace | Self::NoMetadataSpace => libc::ENOSPC,
            Self::ChecksumFail { .. } | Self::ConsistencyFailed => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::NotFound(_) => libc::ENODATA,
        }
    }

    /// True for errors a caller may retry after making progress elsewhere.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::NoDataSpace)
    }
}

/// Result alias using `HcError`.
pub type Result<T> = std::result::Result<T, HcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(HcError::WouldBlock.to_errno(), libc::EWOULDBLOCK);
        assert_eq!(HcError::NoDataSpace.to_errno(), libc::ENOSPC);
        assert_eq!(HcError::NoMetadataSpace.to_errno(), libc::ENOSPC);
        assert_eq!(HcError::ConsistencyFailed.to_errno(), libc::EIO);
        assert_eq!(
            HcError::ChecksumFail {
                block: 4,
                detail: "crc".to_owned()
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(
            HcError::InvalidArgument("bad block size".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(HcError::NotFound("mapping".to_owned()).to_errno(), libc::ENODATA);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(HcError::WouldBlock.is_retryable());
        assert!(HcError::NoDataSpace.is_retryable());
        assert!(!HcError::NoMetadataSpace.is_retryable());
        assert!(!HcError::ConsistencyFailed.is_retryable());
        assert!(!HcError::OutOfMemory("entry arena").is_retryable());
    }
}
