use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{validate_key, BackendError, StorageBackend, StorageErrorCode};

/// Browser-style local storage: a flat map whose total size (keys plus
/// values, in bytes) may not exceed `capacity`.
///
/// Carries fault injection used by the persistence tests.
pub struct MemoryBackend {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, String>,
    forced_quota_failures: usize,
    truncate_writes_to: Option<usize>,
    unavailable: bool,
    write_attempts: usize,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Roughly what a browser grants a single origin.
    pub fn with_default_capacity() -> Self {
        Self::new(5 * 1024 * 1024)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        Self::used(&self.lock().entries, None)
    }

    /// Make the next `n` writes fail with a quota error regardless of size.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().forced_quota_failures = n;
    }

    /// Silently keep only the first `len` bytes of every write and report
    /// success, like a backend that truncates instead of raising.
    pub fn set_truncate_writes(&self, len: Option<usize>) {
        self.lock().truncate_writes_to = len;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Store `value` bypassing capacity checks and fault injection.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().entries.insert(key.into(), value.into());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).cloned()
    }

    pub fn write_attempts(&self) -> usize {
        self.lock().write_attempts
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn used(entries: &HashMap<String, String>, excluding: Option<&str>) -> usize {
        entries
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != excluding)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    fn unavailable() -> BackendError {
        BackendError::storage(StorageErrorCode::Unavailable, "storage is unavailable")
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        validate_key(key)?;
        let inner = self.lock();
        if inner.unavailable {
            return Err(Self::unavailable());
        }
        Ok(inner.entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        let mut inner = self.lock();
        inner.write_attempts += 1;

        if inner.unavailable {
            return Err(Self::unavailable());
        }

        let needed = Self::used(&inner.entries, Some(key)) + key.len() + value.len();

        if inner.forced_quota_failures > 0 {
            inner.forced_quota_failures -= 1;
            return Err(BackendError::QuotaExceeded {
                needed: needed as u64,
                limit: self.capacity as u64,
            });
        }

        if needed > self.capacity {
            return Err(BackendError::QuotaExceeded {
                needed: needed as u64,
                limit: self.capacity as u64,
            });
        }

        let stored = match inner.truncate_writes_to {
            Some(len) if len < value.len() => {
                let mut cut = len;
                while cut > 0 && !value.is_char_boundary(cut) {
                    cut -= 1;
                }
                value[..cut].to_string()
            }
            _ => value.to_string(),
        };
        inner.entries.insert(key.to_string(), stored);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(Self::unavailable());
        }
        inner.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_key_is_none() {
        let backend = MemoryBackend::new(1024);
        assert_eq!(backend.read("state").unwrap(), None);
    }

    #[test]
    fn write_read_delete() {
        let backend = MemoryBackend::new(1024);
        backend.write("state", "{}").unwrap();
        assert_eq!(backend.read("state").unwrap().as_deref(), Some("{}"));

        backend.delete("state").unwrap();
        assert_eq!(backend.read("state").unwrap(), None);
    }

    #[test]
    fn capacity_counts_keys_and_values() {
        let backend = MemoryBackend::new(10);
        // 5 + 5 fits exactly
        backend.write("state", "12345").unwrap();
        let err = backend.write("state", "123456").unwrap_err();

        assert!(matches!(
            err,
            BackendError::QuotaExceeded {
                needed: 11,
                limit: 10
            }
        ));
        assert!(backend.is_capacity_exceeded(&err));
        // failed write leaves the previous value intact
        assert_eq!(backend.read("state").unwrap().as_deref(), Some("12345"));
    }

    #[test]
    fn replacing_a_key_does_not_double_count() {
        let backend = MemoryBackend::new(12);
        backend.write("k", "0123456789").unwrap();
        backend.write("k", "9876543210").unwrap();
        assert_eq!(backend.used_bytes(), 11);
    }

    #[test]
    fn forced_failures_are_consumed() {
        let backend = MemoryBackend::new(1024);
        backend.fail_next_writes(2);

        assert!(backend.write("k", "v").is_err());
        assert!(backend.write("k", "v").is_err());
        assert!(backend.write("k", "v").is_ok());
        assert_eq!(backend.write_attempts(), 3);
    }

    #[test]
    fn truncation_is_silent() {
        let backend = MemoryBackend::new(1024);
        backend.set_truncate_writes(Some(3));

        backend.write("k", "abcdef").unwrap();
        assert_eq!(backend.raw("k").as_deref(), Some("abc"));
    }

    #[test]
    fn unavailable_backend_is_not_a_capacity_error() {
        let backend = MemoryBackend::new(1024);
        backend.set_unavailable(true);

        let err = backend.write("k", "v").unwrap_err();
        assert!(!backend.is_capacity_exceeded(&err));
        assert!(backend.read("k").is_err());
    }
}
