//! The public mutation surface.
//!
//! Every mutation runs read-transform-write under the session lock: it
//! computes a fresh `SystemState` from the current one (never editing the
//! current value in place), persists it through the eviction cascade and
//! queues the remote mirror. Projections are published after the lock is
//! released, so subscribers may call straight back into the store. Each
//! commit carries a version; publishing only ever moves forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, StoreConfig};
use crate::eviction::{EvictionPolicy, EvictionStage};
use crate::migration::MigrationEngine;
use crate::model::{
    GrowthEntry, HistoryRecord, Horizons, LogEntry, MonitoringSession, PlantId, Preferences,
    Profile, ProfileId, RecordId, SystemState, UserId, ValidationError,
};
use crate::persistence::{store_key_for, PersistenceAdapter};
use crate::pubsub::{keys, HistoryUpdated, PubSub};
use crate::remote::{RemoteError, RemoteSync};
use crate::storage::StorageBackend;
use crate::ErrorKind;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store is not initialized; call initialize(user_id) first")]
    NotInitialized,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("history record {0} already exists")]
    DuplicateRecord(RecordId),

    #[error("profile {0} already exists")]
    DuplicateProfile(ProfileId),

    #[error("the last remaining profile cannot be removed")]
    LastProfile,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotInitialized | StoreError::LastProfile => ErrorKind::InvalidState,
            StoreError::Validation(_)
            | StoreError::DuplicateRecord(_)
            | StoreError::DuplicateProfile(_) => ErrorKind::Validation,
        }
    }
}

/// How far a mutation got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Written to storage, possibly after shedding data at the given stage.
    Durable(EvictionStage),
    /// Storage rejected every candidate. The state is the in-memory working
    /// copy until a later write succeeds.
    MemoryOnly,
    /// The mutation was a no-op; nothing was written or published.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub state: SystemState,
    pub durability: Durability,
}

impl Commit {
    pub fn is_durable(&self) -> bool {
        matches!(self.durability, Durability::Durable(_))
    }

    pub fn is_changed(&self) -> bool {
        self.durability != Durability::Unchanged
    }
}

struct Session {
    adapter: PersistenceAdapter,
    state: SystemState,
    unsaved: bool,
    version: u64,
}

enum Outcome {
    Unchanged(SystemState),
    Changed { commit: Commit, version: u64 },
}

/// Hand-off point between committing threads and subscribers.
#[derive(Default)]
struct Publication {
    /// Newest commit not yet handed to subscribers.
    pending: Option<(u64, SystemState)>,
    published: u64,
    draining: bool,
}

/// Releases the drain if a subscriber panics mid-publish.
struct DrainGuard<'a>(&'a Mutex<Publication>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}

pub struct StateStore {
    config: StoreConfig,
    backend: Arc<dyn StorageBackend>,
    policy: EvictionPolicy,
    migrations: MigrationEngine,
    pubsub: PubSub,
    remote: RemoteSync,
    session: Mutex<Option<Session>>,
    versions: AtomicU64,
    publication: Mutex<Publication>,
}

impl StateStore {
    pub fn new(config: StoreConfig, backend: Arc<dyn StorageBackend>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            policy: EvictionPolicy::new(&config.history_prune_steps),
            migrations: MigrationEngine::new(&config),
            config,
            backend,
            pubsub: PubSub::new(),
            remote: RemoteSync::disabled(),
            session: Mutex::new(None),
            versions: AtomicU64::new(0),
            publication: Mutex::new(Publication::default()),
        })
    }

    /// Mirror durable writes through `remote`. Spawn it on this store's
    /// [`pubsub`](Self::pubsub) so sync status lands next to the state.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteSync) -> Self {
        self.remote = remote;
        self
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the user's state, migrating it if needed, or create a fresh one.
    /// Replaces any previously initialized session.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn initialize(&self, user_id: UserId) -> SystemState {
        let key = store_key_for(&self.config.storage_key_prefix, &user_id);
        if let Some(session) = self.lock().as_mut().filter(|s| s.adapter.key() == key) {
            // a rejected write may still sit where the document should be
            session.adapter.repair();
        }
        let mut adapter = PersistenceAdapter::new(
            Arc::clone(&self.backend),
            key,
            self.policy.clone(),
            self.config.verify_writes,
        );

        let (state, needs_write) = match self.load(&mut adapter, &user_id) {
            Some(loaded) => loaded,
            None => {
                info!("no usable stored state; creating a fresh one");
                (
                    SystemState::new(user_id.clone(), &self.config.default_profile_name),
                    true,
                )
            }
        };

        let (state, version) = {
            let mut guard = self.lock();
            let mut session = Session {
                adapter,
                state: state.clone(),
                unsaved: false,
                version: 0,
            };
            let (commit, version) = if needs_write {
                self.commit(&mut session, state)
            } else {
                session.version = self.next_version();
                (Self::unchanged(state), session.version)
            };
            *guard = Some(session);
            (commit.state, version)
        };

        self.publish_in_order(version, state.clone());
        state
    }

    /// `Some((state, needs_write))` when a stored document could be used.
    fn load(
        &self,
        adapter: &mut PersistenceAdapter,
        user_id: &UserId,
    ) -> Option<(SystemState, bool)> {
        let mut doc = adapter.read_document()?;
        let report = match self.migrations.migrate(&mut doc, user_id) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "stored state cannot be migrated; treating as empty");
                return None;
            }
        };
        match serde_json::from_value::<SystemState>(doc) {
            Ok(state) => {
                debug!(
                    history = state.history.len(),
                    profiles = state.profiles.len(),
                    "loaded stored state"
                );
                Some((state, !report.is_noop()))
            }
            Err(e) => {
                warn!(error = %e, "migrated state has an unexpected shape; treating as empty");
                None
            }
        }
    }

    pub fn current(&self) -> Option<SystemState> {
        self.lock().as_ref().map(|s| s.state.clone())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.lock().as_ref().map(|s| s.state.user_id.clone())
    }

    /// `true` while the working copy holds changes storage refused.
    pub fn has_unsaved_changes(&self) -> bool {
        self.lock().as_ref().is_some_and(|s| s.unsaved)
    }

    /// Wait until every remote upsert queued so far has been attempted.
    pub async fn flush_remote(&self) -> Result<(), RemoteError> {
        self.remote.flush().await
    }

    /// Replace the user's state with a fresh one.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<Commit, StoreError> {
        let outcome = {
            let mut guard = self.lock();
            let session = guard.as_mut().ok_or(StoreError::NotInitialized)?;
            if let Err(e) = session.adapter.clear() {
                warn!(error = %e, "failed to clear stored state before reset");
            }
            let fresh = SystemState::new(
                session.state.user_id.clone(),
                &self.config.default_profile_name,
            );
            self.changed(session, fresh)
        };
        info!("state reset");
        Ok(self.finish(outcome))
    }

    fn persist(session: &mut Session, next: SystemState) -> Commit {
        match session.adapter.write(&next) {
            Ok(report) => {
                if report.evicted() {
                    warn!(stage = %report.stage, "state persisted with data shed");
                }
                session.state = report.state;
                session.unsaved = false;
                Commit {
                    state: session.state.clone(),
                    durability: Durability::Durable(report.stage),
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    kind = e.kind().code(),
                    "state could not be persisted; keeping it in memory only"
                );
                session.state = next;
                session.unsaved = true;
                Commit {
                    state: session.state.clone(),
                    durability: Durability::MemoryOnly,
                }
            }
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn unchanged(state: SystemState) -> Commit {
        Commit {
            state,
            durability: Durability::Unchanged,
        }
    }

    /// Persist `next` and queue its mirror. Runs under the session lock, so
    /// versions and the remote queue follow commit order.
    fn commit(&self, session: &mut Session, next: SystemState) -> (Commit, u64) {
        let commit = Self::persist(session, next);
        session.version = self.next_version();
        if commit.is_durable() {
            self.remote
                .enqueue(commit.state.user_id.clone(), commit.state.clone());
        }
        (commit, session.version)
    }

    fn changed(&self, session: &mut Session, next: SystemState) -> Outcome {
        let (commit, version) = self.commit(session, next);
        Outcome::Changed { commit, version }
    }

    /// Read-transform-write. `transform` returns `None` for a no-op.
    fn mutate<F>(&self, transform: F) -> Result<Commit, StoreError>
    where
        F: FnOnce(&SystemState) -> Result<Option<SystemState>, StoreError>,
    {
        let outcome = {
            let mut guard = self.lock();
            let session = guard.as_mut().ok_or(StoreError::NotInitialized)?;
            match transform(&session.state)? {
                Some(next) => self.changed(session, next),
                None => Outcome::Unchanged(session.state.clone()),
            }
        };
        Ok(self.finish(outcome))
    }

    /// Like [`mutate`](Self::mutate), but `compute` runs on a snapshot
    /// without the session lock held, so caller-supplied code may call back
    /// into the store. If another commit lands meanwhile, `compute` runs
    /// again on the newer state.
    fn mutate_unlocked<F>(&self, mut compute: F) -> Result<Commit, StoreError>
    where
        F: FnMut(&SystemState) -> Result<Option<SystemState>, StoreError>,
    {
        loop {
            let (version, snapshot) = {
                let guard = self.lock();
                let session = guard.as_ref().ok_or(StoreError::NotInitialized)?;
                (session.version, session.state.clone())
            };
            let next = compute(&snapshot)?;

            let mut guard = self.lock();
            let session = guard.as_mut().ok_or(StoreError::NotInitialized)?;
            if session.version != version {
                debug!("state changed while an updater ran; retrying");
                continue;
            }
            let outcome = match next {
                Some(next) => self.changed(session, next),
                None => Outcome::Unchanged(session.state.clone()),
            };
            drop(guard);
            return Ok(self.finish(outcome));
        }
    }

    fn finish(&self, outcome: Outcome) -> Commit {
        match outcome {
            Outcome::Unchanged(state) => Self::unchanged(state),
            Outcome::Changed { commit, version } => {
                self.publish_in_order(version, commit.state.clone());
                commit
            }
        }
    }

    fn publication(&self) -> MutexGuard<'_, Publication> {
        self.publication
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `state` to subscribers unless a newer commit got there first.
    /// One thread drains at a time; a commit made while another thread is
    /// notifying is delivered by that thread once it is done.
    fn publish_in_order(&self, version: u64, state: SystemState) {
        {
            let mut publication = self.publication();
            let newer_pending = publication
                .pending
                .as_ref()
                .is_some_and(|(pending, _)| *pending > version);
            if version <= publication.published || newer_pending {
                debug!(version, "skipping publish of a superseded commit");
                return;
            }
            publication.pending = Some((version, state));
            if publication.draining {
                return;
            }
            publication.draining = true;
        }

        let _guard = DrainGuard(&self.publication);
        loop {
            let state = {
                let mut publication = self.publication();
                let Some((version, state)) = publication.pending.take() else {
                    publication.draining = false;
                    return;
                };
                publication.published = version;
                state
            };
            self.publish(&state);
        }
    }

    fn publish(&self, state: &SystemState) {
        self.pubsub.set(keys::SYSTEM_STATE, state.clone());
        self.pubsub.set(keys::HISTORY, state.history.clone());
        self.pubsub.set(keys::PROFILES, state.profiles.clone());
        self.pubsub
            .set(keys::ACTIVE_PROFILE, state.active_profile().cloned());
        self.pubsub.set(
            keys::HISTORY_UPDATED,
            HistoryUpdated {
                count: state.history.len(),
            },
        );
    }

    // --- History ---

    /// Prepend a scan. History beyond the configured cap is dropped from the
    /// old end.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub fn append_history(&self, record: HistoryRecord) -> Result<Commit, StoreError> {
        record.validate()?;
        let cap = self.config.history_cap;
        self.mutate(|state| {
            if state.history_record(&record.id).is_some() {
                return Err(StoreError::DuplicateRecord(record.id));
            }
            let mut history = Vec::with_capacity((state.history.len() + 1).min(cap));
            history.push(record);
            history.extend(state.history.iter().take(cap - 1).cloned());

            let mut next = state.clone();
            next.history = history;
            Ok(Some(next))
        })
    }

    /// Replace the record with `updater(old)`. The id is kept even if the
    /// updater changes it. Unknown ids are a no-op.
    ///
    /// `updater` runs without the store locked and may be called again if
    /// another write lands while it runs.
    pub fn update_history_entry<F>(
        &self,
        id: &RecordId,
        mut updater: F,
    ) -> Result<Commit, StoreError>
    where
        F: FnMut(HistoryRecord) -> HistoryRecord,
    {
        self.mutate_unlocked(|state| {
            let Some(pos) = state.history.iter().position(|r| &r.id == id) else {
                debug!(record_id = %id, "update for unknown history record ignored");
                return Ok(None);
            };
            let old = &state.history[pos];
            let mut updated = updater(old.clone());
            updated.id = id.clone();
            updated.validate()?;
            if &updated == old {
                return Ok(None);
            }

            let mut next = state.clone();
            next.history[pos] = updated;
            Ok(Some(next))
        })
    }

    pub fn update_history_notes(
        &self,
        id: &RecordId,
        notes: impl Into<String>,
    ) -> Result<Commit, StoreError> {
        let notes = notes.into();
        self.update_history_entry(id, move |mut record| {
            record.notes.clone_from(&notes);
            record
        })
    }

    pub fn delete_history_entry(&self, id: &RecordId) -> Result<Commit, StoreError> {
        self.mutate(|state| {
            if state.history_record(id).is_none() {
                return Ok(None);
            }
            let mut next = state.clone();
            next.history.retain(|r| &r.id != id);
            Ok(Some(next))
        })
    }

    /// Newest first.
    pub fn history_for_plant(&self, plant_id: &PlantId) -> Vec<HistoryRecord> {
        self.lock()
            .as_ref()
            .map(|s| {
                s.state
                    .history
                    .iter()
                    .filter(|r| &r.plant_id == plant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // --- Visual cache ---

    /// Remember a generated illustration. A prompt that is already cached is
    /// left alone.
    pub fn cache_visual(
        &self,
        prompt: impl Into<String>,
        image: impl Into<String>,
    ) -> Result<Commit, StoreError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(ValidationError::Empty("visual prompt").into());
        }
        let image = image.into();
        self.mutate(|state| {
            if state.visual_cache.contains_key(&prompt) {
                debug!("visual already cached");
                return Ok(None);
            }
            let mut next = state.clone();
            next.visual_cache.insert(prompt, image);
            Ok(Some(next))
        })
    }

    pub fn lookup_visual(&self, prompt: &str) -> Option<String> {
        self.lock()
            .as_ref()
            .and_then(|s| s.state.visual_cache.get(prompt).cloned())
    }

    // --- Profiles ---

    pub fn active_profile(&self) -> Option<Profile> {
        self.lock()
            .as_ref()
            .and_then(|s| s.state.active_profile().cloned())
    }

    /// Append to a profile's growth timeline, dropping the oldest entries
    /// beyond the cap. Also moves the profile to the entry's stage. Unknown
    /// profiles are a no-op.
    #[instrument(skip(self, entry), fields(profile_id = %profile_id))]
    pub fn append_growth_entry(
        &self,
        profile_id: &ProfileId,
        entry: GrowthEntry,
    ) -> Result<Commit, StoreError> {
        entry.validate()?;
        let cap = self.config.growth_history_cap;
        self.mutate(|state| {
            let Some(pos) = state.profiles.iter().position(|p| &p.id == profile_id) else {
                debug!("growth entry for unknown profile ignored");
                return Ok(None);
            };
            let mut next = state.clone();
            let profile = &mut next.profiles[pos];
            if !entry.stage.is_empty() {
                profile.current_stage.clone_from(&entry.stage);
            }
            profile.growth_history.push(entry);
            cap_front(&mut profile.growth_history, cap);
            Ok(Some(next))
        })
    }

    /// Non-members and the already active profile are a no-op.
    pub fn switch_active_profile(&self, id: &ProfileId) -> Result<Commit, StoreError> {
        self.mutate(|state| {
            if state.profile(id).is_none() {
                warn!(profile_id = %id, "refusing to activate unknown profile");
                return Ok(None);
            }
            if state.active_profile_id.as_ref() == Some(id) {
                return Ok(None);
            }
            let mut next = state.clone();
            next.active_profile_id = Some(id.clone());
            Ok(Some(next))
        })
    }

    pub fn add_profile(&self, profile: Profile) -> Result<Commit, StoreError> {
        profile.validate()?;
        let cap = self.config.growth_history_cap;
        self.mutate(|state| {
            if state.profile(&profile.id).is_some() {
                return Err(StoreError::DuplicateProfile(profile.id));
            }
            let mut profile = profile;
            cap_front(&mut profile.growth_history, cap);
            let mut next = state.clone();
            next.profiles.push(profile);
            Ok(Some(next))
        })
    }

    /// Replace the profile with `updater(old)`, keeping its id.
    ///
    /// `updater` runs without the store locked and may be called again if
    /// another write lands while it runs.
    pub fn update_profile<F>(&self, id: &ProfileId, mut updater: F) -> Result<Commit, StoreError>
    where
        F: FnMut(Profile) -> Profile,
    {
        let cap = self.config.growth_history_cap;
        self.mutate_unlocked(|state| {
            let Some(pos) = state.profiles.iter().position(|p| &p.id == id) else {
                return Ok(None);
            };
            let old = &state.profiles[pos];
            let mut updated = updater(old.clone());
            updated.id = id.clone();
            updated.validate()?;
            cap_front(&mut updated.growth_history, cap);
            if &updated == old {
                return Ok(None);
            }
            let mut next = state.clone();
            next.profiles[pos] = updated;
            Ok(Some(next))
        })
    }

    /// Removing the active profile activates the first remaining one.
    pub fn remove_profile(&self, id: &ProfileId) -> Result<Commit, StoreError> {
        self.mutate(|state| {
            if state.profile(id).is_none() {
                return Ok(None);
            }
            if state.profiles.len() == 1 {
                return Err(StoreError::LastProfile);
            }
            let mut next = state.clone();
            next.profiles.retain(|p| &p.id != id);
            if next.active_profile_id.as_ref() == Some(id) {
                next.active_profile_id = next.profiles.first().map(|p| p.id.clone());
            }
            Ok(Some(next))
        })
    }

    // --- Planning, preferences, logs, sessions ---

    /// `updater` runs without the store locked and may be called again if
    /// another write lands while it runs.
    pub fn update_horizons<F>(&self, mut updater: F) -> Result<Commit, StoreError>
    where
        F: FnMut(Horizons) -> Horizons,
    {
        self.mutate_unlocked(|state| {
            let horizons = updater(state.horizons.clone());
            horizons.validate()?;
            if horizons == state.horizons {
                return Ok(None);
            }
            let mut next = state.clone();
            next.horizons = horizons;
            Ok(Some(next))
        })
    }

    /// `updater` runs without the store locked and may be called again if
    /// another write lands while it runs.
    pub fn update_preferences<F>(&self, mut updater: F) -> Result<Commit, StoreError>
    where
        F: FnMut(Preferences) -> Preferences,
    {
        self.mutate_unlocked(|state| {
            let preferences = updater(state.preferences.clone());
            if preferences == state.preferences {
                return Ok(None);
            }
            let mut next = state.clone();
            next.preferences = preferences;
            Ok(Some(next))
        })
    }

    /// Append to the log, dropping the oldest entries beyond the cap.
    pub fn append_log(&self, entry: LogEntry) -> Result<Commit, StoreError> {
        if entry.message.trim().is_empty() {
            return Err(ValidationError::Empty("log message").into());
        }
        let cap = self.config.log_cap;
        self.mutate(|state| {
            let mut next = state.clone();
            next.logs.push(entry);
            cap_front(&mut next.logs, cap);
            Ok(Some(next))
        })
    }

    pub fn put_session(
        &self,
        session_id: impl Into<String>,
        session: MonitoringSession,
    ) -> Result<Commit, StoreError> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(ValidationError::Empty("session id").into());
        }
        self.mutate(|state| {
            if state.sessions.get(&session_id) == Some(&session) {
                return Ok(None);
            }
            let mut next = state.clone();
            next.sessions.insert(session_id, session);
            Ok(Some(next))
        })
    }

    pub fn remove_session(&self, session_id: &str) -> Result<Commit, StoreError> {
        self.mutate(|state| {
            if !state.sessions.contains_key(session_id) {
                return Ok(None);
            }
            let mut next = state.clone();
            next.sessions.remove(session_id);
            Ok(Some(next))
        })
    }

    pub fn session(&self, session_id: &str) -> Option<Value> {
        self.lock()
            .as_ref()
            .and_then(|s| s.state.sessions.get(session_id).cloned())
    }
}

/// Drop from the front until at most `cap` remain.
fn cap_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}
