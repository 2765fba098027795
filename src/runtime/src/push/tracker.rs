//! Per-destination upload bookkeeping.
//!
//! Each `(registry, repository, digest)` key is absent, in flight or
//! completed. Completed is permanent for the tracker's lifetime. An in-flight
//! entry is only ever removed under the `in_flight` lock, and when it turns
//! into completed both maps change inside one critical section.
//!
//! Lock order: `in_flight`, then `completed`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use imgsync_core::digest::Digest;
use imgsync_core::error::SyncError;
use imgsync_core::request::Repository;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

/// Dedup key: destination plus content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    pub registry: String,
    pub repository: String,
    pub digest: Digest,
}

impl UploadKey {
    pub fn new(destination: &Repository, digest: Digest) -> Self {
        Self {
            registry: destination.registry.clone(),
            repository: destination.repository.clone(),
            digest,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl std::fmt::Display for UploadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.registry, self.repository, self.digest)
    }
}

/// State published to everyone waiting on an in-flight upload.
#[derive(Debug, Clone)]
pub enum UploadStatus {
    Pending,
    Done,
    Failed { cancelled: bool, message: String },
}

impl UploadStatus {
    fn from_error(err: &SyncError) -> Self {
        match err {
            SyncError::Cancelled(message) => Self::Failed {
                cancelled: true,
                message: message.clone(),
            },
            other => Self::Failed {
                cancelled: false,
                message: other.to_string(),
            },
        }
    }
}

struct InFlight {
    id: u64,
    status: watch::Receiver<UploadStatus>,
}

/// What a caller must do for a key.
pub enum Claim {
    /// Already uploaded by this engine instance.
    Completed,
    /// Someone else is uploading; wait for their result.
    Wait(watch::Receiver<UploadStatus>),
    /// The caller owns the upload.
    Owner(InFlightGuard),
}

/// `completed` set and `in_flight` map for one engine instance.
#[derive(Default)]
pub struct UploadTracker {
    completed: RwLock<HashSet<UploadKey>>,
    in_flight: Mutex<HashMap<UploadKey, InFlight>>,
    next_id: AtomicU64,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self, key: &UploadKey) -> bool {
        self.completed.read().contains(key)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.read().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &UploadKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Decide who uploads `key`.
    pub fn claim(self: &Arc<Self>, key: &UploadKey) -> Claim {
        let mut in_flight = self.in_flight.lock();
        // Checked under the in_flight lock so a finishing upload cannot slip between.
        if self.completed.read().contains(key) {
            return Claim::Completed;
        }
        if let Some(entry) = in_flight.get(key) {
            return Claim::Wait(entry.status.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(UploadStatus::Pending);
        in_flight.insert(key.clone(), InFlight { id, status: rx });
        Claim::Owner(InFlightGuard {
            tracker: Arc::clone(self),
            key: key.clone(),
            id,
            status: Some(tx),
        })
    }

    /// Drop the in-flight entry `id` for `key` if it is still the current one.
    ///
    /// Only for an owner giving up on a job no worker has started. A started
    /// upload keeps its entry until its guard resolves. Waiters are told once
    /// the abandoned job is discarded.
    pub fn release(&self, key: &UploadKey, id: u64) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(key) {
            Some(entry) if entry.id == id => {
                in_flight.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Ownership of one in-flight upload.
///
/// Resolving it (or dropping it unresolved) clears the in-flight entry and
/// wakes every waiter.
pub struct InFlightGuard {
    tracker: Arc<UploadTracker>,
    key: UploadKey,
    id: u64,
    status: Option<watch::Sender<UploadStatus>>,
}

impl InFlightGuard {
    pub fn key(&self) -> &UploadKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the key completed and clear the in-flight entry atomically.
    pub fn complete(mut self) {
        {
            let mut in_flight = self.tracker.in_flight.lock();
            self.tracker.completed.write().insert(self.key.clone());
            remove_if_current(&mut in_flight, &self.key, self.id);
        }
        self.publish(UploadStatus::Done);
    }

    /// Clear the in-flight entry and pass `err` to waiters.
    pub fn fail(mut self, err: &SyncError) {
        self.clear();
        self.publish(UploadStatus::from_error(err));
    }

    fn clear(&self) {
        let mut in_flight = self.tracker.in_flight.lock();
        remove_if_current(&mut in_flight, &self.key, self.id);
    }

    fn publish(&mut self, status: UploadStatus) {
        if let Some(tx) = self.status.take() {
            tx.send_replace(status);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.status.is_some() {
            self.clear();
            self.publish(UploadStatus::Failed {
                cancelled: true,
                message: format!("upload of {} was abandoned", self.key),
            });
        }
    }
}

fn remove_if_current(in_flight: &mut HashMap<UploadKey, InFlight>, key: &UploadKey, id: u64) {
    if in_flight.get(key).map(|e| e.id) == Some(id) {
        in_flight.remove(key);
    }
}

/// Wait for another caller's upload of `key` to resolve.
pub async fn wait_for(
    key: &UploadKey,
    mut status: watch::Receiver<UploadStatus>,
) -> Result<(), SyncError> {
    let resolved = status
        .wait_for(|s| !matches!(s, UploadStatus::Pending))
        .await
        .map(|s| (*s).clone());

    match resolved {
        Ok(UploadStatus::Done) => Ok(()),
        Ok(UploadStatus::Failed {
            cancelled: true,
            message,
        }) => Err(SyncError::Cancelled(message)),
        Ok(UploadStatus::Failed { message, .. }) => Err(SyncError::UploadFailure {
            digest: key.digest.to_string(),
            destination: key.destination(),
            message,
        }),
        // Sender gone without a verdict
        Ok(UploadStatus::Pending) | Err(_) => Err(SyncError::Cancelled(format!(
            "upload of {} was abandoned",
            key
        ))),
    }
}
