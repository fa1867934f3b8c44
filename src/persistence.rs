use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::eviction::{EvictionPolicy, EvictionStage};
use crate::model::{SystemState, UserId};
use crate::storage::{BackendError, StorageBackend};
use crate::{ErrorKind, CURRENT_KEY_VERSION};

/// Storage key for a user's document: one fixed key per user.
pub fn store_key_for(prefix: &str, user_id: &UserId) -> String {
    let hash = blake3::hash(user_id.as_str().as_bytes());
    format!("{prefix}_v{CURRENT_KEY_VERSION}_{}", &hash.to_hex()[..16])
}

/// Cheap structural fingerprint compared after every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSignature {
    pub history: usize,
    pub profiles: usize,
    pub visuals: usize,
    pub bytes: usize,
    pub digest: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Shape {
    #[serde(default)]
    history: Vec<IgnoredAny>,
    #[serde(default)]
    profiles: Vec<IgnoredAny>,
    #[serde(default)]
    visual_cache: HashMap<String, IgnoredAny>,
}

impl StateSignature {
    fn digest(json: &str) -> String {
        hex::encode(blake3::hash(json.as_bytes()).as_bytes())
    }

    pub fn of_state(state: &SystemState, json: &str) -> Self {
        Self {
            history: state.history.len(),
            profiles: state.profiles.len(),
            visuals: state.visual_cache.len(),
            bytes: json.len(),
            digest: Self::digest(json),
        }
    }

    /// `None` when `json` is not a well-formed state document.
    pub fn parse(json: &str) -> Option<Self> {
        let shape: Shape = serde_json::from_str(json).ok()?;
        Some(Self {
            history: shape.history.len(),
            profiles: shape.profiles.len(),
            visuals: shape.visual_cache.len(),
            bytes: json.len(),
            digest: Self::digest(json),
        })
    }
}

/// Why a single write attempt did not stick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("read-back mismatch: wrote {expected:?}, found {found:?}")]
    Verification {
        expected: StateSignature,
        found: Option<StateSignature>,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage rejected write: {0}")]
    Backend(BackendError),

    #[error("storage exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: WriteFailure },
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistError::Serialization(_) => ErrorKind::Serialization,
            PersistError::Backend(e) => e.kind(),
            PersistError::Exhausted { .. } => ErrorKind::QuotaExceeded,
        }
    }

    pub fn stage(&self) -> EvictionStage {
        EvictionStage::Failed
    }
}

/// What actually became durable. `state` differs from the input when the
/// eviction cascade had to shed data.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub state: SystemState,
    pub stage: EvictionStage,
    pub bytes: usize,
    pub attempts: usize,
}

impl WriteReport {
    pub fn evicted(&self) -> bool {
        self.stage != EvictionStage::Normal
    }
}

pub struct PersistenceAdapter {
    backend: Arc<dyn StorageBackend>,
    key: String,
    policy: EvictionPolicy,
    verify_writes: bool,
    /// Last document known to be intact under `key`.
    durable: Option<String>,
    /// `key` holds a write that failed read-back instead of `durable`.
    damaged: bool,
}

impl PersistenceAdapter {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        policy: EvictionPolicy,
        verify_writes: bool,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            policy,
            verify_writes,
            durable: None,
            damaged: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `true` while storage holds a rejected write that could not yet be
    /// replaced by the last durable document.
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    /// Write `state`, shedding data through the eviction cascade until it
    /// fits. When nothing fits and a rejected write was left behind, the last
    /// durable document is put back.
    #[instrument(skip(self, state), fields(key = %self.key))]
    pub fn write(&mut self, state: &SystemState) -> Result<WriteReport, PersistError> {
        let mut cascade = self.policy.cascade();
        let mut candidate: Cow<'_, SystemState> = Cow::Borrowed(state);
        let mut attempts = 0usize;
        let mut left_garbage = false;

        loop {
            let json = serde_json::to_string(candidate.as_ref()).map_err(|e| {
                error!(error = %e, "failed to serialize state; write aborted");
                PersistError::Serialization(e.to_string())
            })?;
            attempts += 1;

            let failure = match self.attempt(candidate.as_ref(), &json) {
                Ok(()) => {
                    let stage = cascade.stage();
                    if stage == EvictionStage::Normal {
                        debug!(bytes = json.len(), "state persisted");
                    } else {
                        info!(bytes = json.len(), %stage, attempts, "state persisted after eviction");
                    }
                    let bytes = json.len();
                    self.durable = Some(json);
                    self.damaged = false;
                    return Ok(WriteReport {
                        state: candidate.into_owned(),
                        stage,
                        bytes,
                        attempts,
                    });
                }
                Err(failure) => failure,
            };
            left_garbage |= matches!(failure, WriteFailure::Verification { .. });

            if !self.is_capacity_failure(&failure) {
                error!(error = %failure, "storage write failed");
                self.after_failed_write(left_garbage);
                return Err(match failure {
                    WriteFailure::Backend(e) => PersistError::Backend(e),
                    verification => PersistError::Exhausted {
                        attempts,
                        last: verification,
                    },
                });
            }

            warn!(
                stage = %cascade.stage(),
                bytes = json.len(),
                error = %failure,
                "write exceeded storage capacity; evicting"
            );

            match cascade.advance(candidate.as_ref()) {
                Some(next) => candidate = Cow::Owned(next),
                None => {
                    error!(attempts, "eviction exhausted; state is not durable");
                    self.after_failed_write(left_garbage);
                    return Err(PersistError::Exhausted {
                        attempts,
                        last: failure,
                    });
                }
            }
        }
    }

    fn after_failed_write(&mut self, left_garbage: bool) {
        if left_garbage {
            self.damaged = true;
            self.repair();
        }
    }

    /// Put the last durable document back over a rejected write, or remove
    /// the rejected write when nothing was durable before. Returns whether
    /// storage is intact afterwards; a damaged slot is retried on the next
    /// call.
    pub fn repair(&mut self) -> bool {
        if !self.damaged {
            return true;
        }
        match self.restore() {
            Ok(true) => {
                info!(key = %self.key, "restored last durable state over a rejected write");
                self.damaged = false;
                true
            }
            Ok(false) => {
                error!(key = %self.key, "restored state failed read-back; storage left damaged");
                false
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "could not restore last durable state");
                false
            }
        }
    }

    fn restore(&self) -> Result<bool, BackendError> {
        match self.durable.as_deref() {
            Some(json) => {
                self.backend.write(&self.key, json)?;
                Ok(self.backend.read(&self.key)?.as_deref() == Some(json))
            }
            None => {
                self.backend.delete(&self.key)?;
                Ok(true)
            }
        }
    }

    fn attempt(&self, state: &SystemState, json: &str) -> Result<(), WriteFailure> {
        self.backend.write(&self.key, json)?;
        if !self.verify_writes {
            return Ok(());
        }

        let expected = StateSignature::of_state(state, json);
        let found = self
            .backend
            .read(&self.key)?
            .as_deref()
            .and_then(StateSignature::parse);

        if found.as_ref() != Some(&expected) {
            return Err(WriteFailure::Verification { expected, found });
        }
        Ok(())
    }

    /// Silent truncation is how some backends report running out of space,
    /// so a failed read-back counts as capacity pressure.
    fn is_capacity_failure(&self, failure: &WriteFailure) -> bool {
        match failure {
            WriteFailure::Backend(e) => self.backend.is_capacity_exceeded(e),
            WriteFailure::Verification { .. } => true,
        }
    }

    /// Raw stored document. Missing, unreadable and malformed all read as
    /// `None`.
    pub fn read_document(&mut self) -> Option<Value> {
        let raw = match self.backend.read(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.key, error = %e, "storage unavailable; treating as empty");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(doc) => {
                self.durable = Some(raw);
                Some(doc)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "stored state is corrupt; treating as empty");
                None
            }
        }
    }

    pub fn read(&mut self) -> Option<SystemState> {
        let doc = self.read_document()?;
        match serde_json::from_value(doc) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key = %self.key, error = %e, "stored state has an unexpected shape; treating as empty");
                None
            }
        }
    }

    pub fn clear(&mut self) -> Result<(), PersistError> {
        self.backend.delete(&self.key).map_err(PersistError::Backend)?;
        self.durable = None;
        self.damaged = false;
        Ok(())
    }
}
