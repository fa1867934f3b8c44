use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use super::{validate_key, BackendError, StorageBackend, StorageErrorCode};

/// Key/value table in SQLite. Capacity is enforced by SQLite itself through
/// `max_page_count`, so a full database surfaces as `SQLITE_FULL`.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path, capacity_bytes: u64) -> Result<Self, BackendError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Self::init(conn, capacity_bytes)
    }

    pub fn open_in_memory(capacity_bytes: u64) -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn, capacity_bytes)
    }

    fn init(conn: Connection, capacity_bytes: u64) -> Result<Self, BackendError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(map_sqlite_error)?;

        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(map_sqlite_error)?;
        let page_size = u64::try_from(page_size.max(1)).unwrap_or(4096);
        let max_pages = capacity_bytes.div_ceil(page_size).max(1);

        // SQLite clamps this to the current page count if it is lower.
        let _: i64 = conn
            .query_row(&format!("PRAGMA max_page_count = {max_pages}"), [], |row| {
                row.get(0)
            })
            .map_err(map_sqlite_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> BackendError {
    match e {
        rusqlite::Error::SqliteFailure(err, message) => BackendError::storage(
            StorageErrorCode::Vendor(err.extended_code),
            message.unwrap_or_else(|| err.to_string()),
        ),
        other => BackendError::storage(StorageErrorCode::Unknown, other.to_string()),
    }
}

impl StorageBackend for SqliteBackend {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        validate_key(key)?;
        self.lock()
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_error)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
            .map_err(map_sqlite_error)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        self.lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map(|_| ())
            .map_err(map_sqlite_error)
    }

    fn is_capacity_exceeded(&self, error: &BackendError) -> bool {
        match error {
            BackendError::QuotaExceeded { .. } => true,
            BackendError::Storage {
                code: StorageErrorCode::Vendor(code),
                ..
            } => code & 0xff == rusqlite::ffi::SQLITE_FULL,
            BackendError::Storage {
                code: StorageErrorCode::DiskFull,
                ..
            } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_in_memory() {
        let backend = SqliteBackend::open_in_memory(1024 * 1024).unwrap();

        assert_eq!(backend.read("state").unwrap(), None);
        backend.write("state", "{}").unwrap();
        backend.write("state", r#"{"v":2}"#).unwrap();
        assert_eq!(backend.read("state").unwrap().as_deref(), Some(r#"{"v":2}"#));

        backend.delete("state").unwrap();
        assert_eq!(backend.read("state").unwrap(), None);
    }

    #[test]
    fn full_database_is_classified_as_capacity() {
        let backend = SqliteBackend::open_in_memory(16 * 1024).unwrap();
        let big = "x".repeat(256 * 1024);

        let err = backend.write("state", &big).unwrap_err();

        assert!(backend.is_capacity_exceeded(&err), "got {err:?}");
        // small writes still fit
        backend.write("state", "{}").unwrap();
    }

    #[test]
    fn unrelated_vendor_errors_are_not_capacity() {
        let backend = SqliteBackend::open_in_memory(1024 * 1024).unwrap();
        // SQLITE_BUSY
        let err = BackendError::storage(StorageErrorCode::Vendor(5), "database is locked");
        assert!(!backend.is_capacity_exceeded(&err));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let backend = SqliteBackend::open(&path, 1024 * 1024).unwrap();
            backend.write("state", "persisted").unwrap();
        }

        let backend = SqliteBackend::open(&path, 1024 * 1024).unwrap();
        assert_eq!(backend.read("state").unwrap().as_deref(), Some("persisted"));
    }
}
