use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{validate_key, BackendError, StorageBackend, StorageErrorCode};

const VALUE_EXTENSION: &str = "json";

/// One file per key inside `root`. The directory as a whole may hold at most
/// `capacity` bytes of values.
pub struct FileBackend {
    root: PathBuf,
    capacity: u64,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, capacity })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{VALUE_EXTENSION}"))
    }

    fn used_excluding(&self, excluded: &Path) -> Result<u64, BackendError> {
        let mut used = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path == excluded
                || path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION)
            {
                continue;
            }
            used = used.saturating_add(fs::metadata(&path)?.len());
        }
        Ok(used)
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        validate_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                BackendError::storage(StorageErrorCode::Corrupted, e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        let path = self.path_for(key);

        let needed = self
            .used_excluding(&path)?
            .saturating_add(value.len() as u64);
        if needed > self.capacity {
            return Err(BackendError::QuotaExceeded {
                needed,
                limit: self.capacity,
            });
        }

        let tmp_path = path.with_extension("tmp");

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
