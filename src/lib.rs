// lib.rs - Local-first plant health state store

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod eviction;
pub mod migration;
pub mod model;
pub mod persistence;
pub mod pubsub;
pub mod remote;
pub mod storage;
pub mod store;

use serde::{Deserialize, Serialize};

pub use config::{ConfigError, StoreConfig};
pub use eviction::{EvictionPolicy, EvictionStage};
pub use migration::{MigrationEngine, MigrationError, MigrationReport};
pub use model::{
    CropGrading, Diagnosis, GrowthEntry, HistoryRecord, Horizons, LeafDiagnosis, Location,
    LogEntry, LogLevel, PlantId, Preferences, Profile, ProfileId, RecordId, ScanType,
    SystemState, UnixTimeMs, UserId, ValidationError,
};
pub use persistence::{PersistError, PersistenceAdapter, WriteReport};
pub use pubsub::{keys, HistoryUpdated, PubSub, Subscription};
pub use remote::{RemoteDatabase, RemoteError, RemoteSync, SyncStatus};
pub use storage::{BackendError, MemoryBackend, StorageBackend, StorageErrorCode};
pub use store::{Commit, Durability, StateStore, StoreError};

/// Bumped when the persisted key layout changes; old keys are then ignored.
pub const CURRENT_KEY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

/// Coarse classification shared by every error type in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Serialization,
    QuotaExceeded,
    StorageUnavailable,
    RemoteSync,
    Validation,
    InvalidState,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::QuotaExceeded => "STORAGE_QUOTA_EXCEEDED",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::RemoteSync => "REMOTE_SYNC_FAILURE",
            Self::Validation => "VALIDATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::QuotaExceeded | Self::StorageUnavailable | Self::RemoteSync => {
                ErrorSeverity::Transient
            }
            Self::Validation => ErrorSeverity::Permanent,
            Self::Serialization | Self::InvalidState => ErrorSeverity::Fatal,
        }
    }

    /// Whether the store keeps working after an error of this kind: quota is
    /// handled by eviction, unreadable storage reads as empty and remote
    /// failures never touch the local copy.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self.default_severity(), ErrorSeverity::Transient)
    }
}
