//! Synchronous, byte-capacity-limited key/value persistence.
//!
//! Every backend reports failures as [`BackendError`] and classifies its own
//! "out of space" signal through [`StorageBackend::is_capacity_exceeded`].
//! Nothing above this layer inspects vendor error codes.

use thiserror::Error;

use crate::ErrorKind;

mod file;
mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::file::FileBackend;
pub use self::memory::MemoryBackend;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteBackend;

pub const MAX_KEY_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    Unknown,
    Unavailable,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Io,
    /// Raw code from the underlying engine, interpreted only by its backend.
    Vendor(i32),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("quota exceeded: {needed}/{limit} bytes")]
    QuotaExceeded { needed: u64, limit: u64 },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },
}

impl BackendError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::InvalidKey { .. } => ErrorKind::Validation,
            BackendError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            BackendError::Storage {
                code: StorageErrorCode::DiskFull,
                ..
            } => ErrorKind::QuotaExceeded,
            BackendError::Storage { .. } => ErrorKind::StorageUnavailable,
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        // ENOSPC
        let code = if e.raw_os_error() == Some(28) {
            StorageErrorCode::DiskFull
        } else {
            match e.kind() {
                std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
                std::io::ErrorKind::InvalidData => StorageErrorCode::Corrupted,
                _ => StorageErrorCode::Io,
            }
        };
        Self::storage(code, e.to_string())
    }
}

pub trait StorageBackend: Send + Sync {
    /// `Ok(None)` when the key has never been written.
    fn read(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Replace the value stored under `key`. Implementations must not leave a
    /// partially written value behind on error.
    fn write(&self, key: &str, value: &str) -> Result<(), BackendError>;

    fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Whether `error` means the backend ran out of space.
    fn is_capacity_exceeded(&self, error: &BackendError) -> bool {
        matches!(
            error,
            BackendError::QuotaExceeded { .. }
                | BackendError::Storage {
                    code: StorageErrorCode::DiskFull,
                    ..
                }
        )
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        (**self).write(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        (**self).delete(key)
    }

    fn is_capacity_exceeded(&self, error: &BackendError) -> bool {
        (**self).is_capacity_exceeded(error)
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), BackendError> {
    let invalid = |reason: &str| BackendError::InvalidKey {
        key: key.chars().take(50).collect(),
        reason: reason.to_string(),
    };

    if key.trim().is_empty() {
        return Err(invalid("key cannot be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(invalid("key too long"));
    }
    if key.contains("..") {
        return Err(invalid("key cannot contain path traversal sequences"));
    }
    if key
        .chars()
        .any(|c| c.is_control() || c == '/' || c == '\\')
    {
        return Err(invalid("key contains separators or control characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("plant_system_state_v1_abcd").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("   ").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("key\0value").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn default_capacity_classification() {
        let backend = MemoryBackend::new(16);
        assert!(backend.is_capacity_exceeded(&BackendError::QuotaExceeded {
            needed: 20,
            limit: 16
        }));
        assert!(backend.is_capacity_exceeded(&BackendError::storage(
            StorageErrorCode::DiskFull,
            "full"
        )));
        assert!(!backend.is_capacity_exceeded(&BackendError::storage(
            StorageErrorCode::Unavailable,
            "gone"
        )));
    }

    #[test]
    fn enospc_maps_to_disk_full() {
        let err: BackendError = std::io::Error::from_raw_os_error(28).into();
        assert!(matches!(
            err,
            BackendError::Storage {
                code: StorageErrorCode::DiskFull,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }
}
