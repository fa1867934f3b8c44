//! In-memory keyed publish/subscribe.
//!
//! Values are typed per key at runtime. `set` delivers synchronously to every
//! subscriber registered when it was called, in subscription order, and does
//! so without holding the registry lock so callbacks may freely call back into
//! the broker (including unsubscribing themselves).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

/// Keys the state store publishes under.
pub mod keys {
    /// Whole `SystemState`.
    pub const SYSTEM_STATE: &str = "system-state";
    /// `Vec<HistoryRecord>`, newest first.
    pub const HISTORY: &str = "history";
    /// `Vec<Profile>`.
    pub const PROFILES: &str = "profiles";
    /// `Option<Profile>`.
    pub const ACTIVE_PROFILE: &str = "active-profile";
    /// `HistoryUpdated`, for listeners that only need the count.
    pub const HISTORY_UPDATED: &str = "history-updated";
    /// `SyncStatus` after each remote mirror attempt.
    pub const SYNC_STATUS: &str = "sync-status";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryUpdated {
    pub count: usize,
}

type Stored = Arc<dyn Any + Send + Sync>;
type Callback = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

#[derive(Default)]
struct Slot {
    value: Option<Stored>,
    subscribers: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Slot>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct PubSub {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("PubSub")
            .field("keys", &registry.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key` and notify. Returns the number of
    /// subscribers that received it; subscribers registered for another type
    /// are skipped.
    pub fn set<T>(&self, key: &str, value: T) -> usize
    where
        T: Any + Send + Sync,
    {
        let value: Stored = Arc::new(value);
        let snapshot: Vec<Callback> = {
            let mut registry = self.lock();
            let slot = registry.slots.entry(key.to_string()).or_default();
            slot.value = Some(Arc::clone(&value));
            slot.subscribers
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };

        let delivered = snapshot
            .iter()
            .filter(|callback| callback(value.as_ref()))
            .count();
        if delivered < snapshot.len() {
            debug!(
                key,
                skipped = snapshot.len() - delivered,
                "subscribers skipped on type mismatch"
            );
        }
        trace!(key, delivered, "published");
        delivered
    }

    /// `None` when nothing was set or the stored value is not a `T`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        let value = self.lock().slots.get(key)?.value.clone()?;
        value.downcast_ref::<T>().cloned()
    }

    /// `set(key, f(get(key)))`. Not atomic with respect to concurrent
    /// callers.
    pub fn update<T, F>(&self, key: &str, f: F) -> usize
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce(Option<T>) -> T,
    {
        let next = f(self.get::<T>(key));
        self.set(key, next)
    }

    pub fn subscribe<T, F>(&self, key: &str, callback: F) -> Subscription
    where
        T: Any,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |value: &(dyn Any + Send + Sync)| {
            match value.downcast_ref::<T>() {
                Some(value) => {
                    callback(value);
                    true
                }
                None => false,
            }
        });

        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .slots
            .entry(key.to_string())
            .or_default()
            .subscribers
            .push((id, callback));

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.lock()
            .slots
            .get(key)
            .map_or(0, |slot| slot.subscribers.len())
    }
}

/// Detach handle returned by [`PubSub::subscribe`]. Dropping it does not
/// unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Safe to call more than once and from inside a notification.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = registry.slots.get_mut(&self.key) {
            slot.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
