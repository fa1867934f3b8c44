//! Best-effort mirror of durable local writes to a remote database.
//!
//! One worker task per store drains a queue strictly in issue order with a
//! single upsert in flight. Upserts for the same user that pile up behind a
//! slow request collapse to the newest state. Nothing is retried: the local
//! copy stays authoritative and failures are only logged and published.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::model::{SystemState, UnixTimeMs, UserId};
use crate::pubsub::{keys, PubSub};
use crate::ErrorKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote rejected upsert ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("no async runtime available to run the sync worker")]
    NoRuntime,

    #[error("sync worker has stopped")]
    WorkerStopped,
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::RemoteSync
    }
}

/// Remote store accepting full-state upserts keyed by user.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    async fn upsert(&self, user_id: &UserId, state: &SystemState) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Synced { user_id: UserId, at: UnixTimeMs },
    Failed { user_id: UserId, error: RemoteError },
}

enum Job {
    Upsert {
        user_id: UserId,
        state: Box<SystemState>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the sync worker. Cheap to clone; the worker exits once every
/// handle is dropped and the queue is drained.
#[derive(Debug, Clone, Default)]
pub struct RemoteSync {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl RemoteSync {
    /// For hosts without a remote. `enqueue` and `flush` do nothing.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(remote: Arc<dyn RemoteDatabase>, pubsub: PubSub) -> Result<Self, RemoteError> {
        let handle = Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_worker(remote, pubsub, rx));
        info!("remote sync worker started");
        Ok(Self { tx: Some(tx) })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an upsert. Never blocks.
    pub fn enqueue(&self, user_id: UserId, state: SystemState) {
        let Some(tx) = &self.tx else {
            return;
        };
        let job = Job::Upsert {
            user_id,
            state: Box::new(state),
        };
        if tx.send(job).is_err() {
            warn!("remote sync worker has stopped; dropping upsert");
        }
    }

    /// Resolves once every upsert queued before this call has been attempted.
    pub async fn flush(&self) -> Result<(), RemoteError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Job::Flush(done_tx))
            .map_err(|_| RemoteError::WorkerStopped)?;
        done_rx.await.map_err(|_| RemoteError::WorkerStopped)
    }
}

async fn run_worker(
    remote: Arc<dyn RemoteDatabase>,
    pubsub: PubSub,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        // Take whatever is already waiting, up to and including a flush.
        while !matches!(batch.last(), Some(Job::Flush(_))) {
            match rx.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }

        let (upserts, flushes) = coalesce(batch);
        for (user_id, state) in upserts {
            sync_one(remote.as_ref(), &pubsub, &user_id, &state).await;
        }
        for done in flushes {
            let _ = done.send(());
        }
    }
    debug!("remote sync worker stopped");
}

/// Keep only the newest upsert per user, at the position it was issued.
fn coalesce(batch: Vec<Job>) -> (Vec<(UserId, Box<SystemState>)>, Vec<oneshot::Sender<()>>) {
    let mut upserts: Vec<(UserId, Box<SystemState>)> = Vec::new();
    let mut flushes = Vec::new();
    for job in batch {
        match job {
            Job::Upsert { user_id, state } => {
                if let Some(pos) = upserts.iter().position(|(u, _)| *u == user_id) {
                    upserts.remove(pos);
                    debug!(user_id = %user_id, "coalesced queued upsert");
                }
                upserts.push((user_id, state));
            }
            Job::Flush(done) => flushes.push(done),
        }
    }
    (upserts, flushes)
}

#[instrument(skip(remote, pubsub, state), fields(user_id = %user_id))]
async fn sync_one(
    remote: &dyn RemoteDatabase,
    pubsub: &PubSub,
    user_id: &UserId,
    state: &SystemState,
) {
    let status = match remote.upsert(user_id, state).await {
        Ok(()) => {
            debug!("remote upsert succeeded");
            SyncStatus::Synced {
                user_id: user_id.clone(),
                at: UnixTimeMs::now(),
            }
        }
        Err(error) => {
            warn!(error = %error, "remote upsert failed; local copy stays authoritative");
            SyncStatus::Failed {
                user_id: user_id.clone(),
                error,
            }
        }
    };
    pubsub.set(keys::SYNC_STATUS, status);
}
