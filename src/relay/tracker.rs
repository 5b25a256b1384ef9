//! Session admission and bookkeeping
//!
//! Sessions never share state with each other; the tracker only bounds how
//! many may exist at once and records what is running for logs and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Errors that can occur when admitting a session
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Session limit of {0} reached")]
    AtCapacity(usize),
}

/// What is known about a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub shell: String,
    pub pid: Option<u32>,
    pub started_at: SystemTime,
}

impl SessionInfo {
    /// Time since the session started; zero if the clock went backwards
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }
}

type Registry = Arc<Mutex<HashMap<Uuid, SessionInfo>>>;

/// Bounds and records concurrent sessions
pub struct SessionTracker {
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    registry: Registry,
}

impl SessionTracker {
    /// Create a tracker; `None` means no cap
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            permits: limit.map(|n| Arc::new(Semaphore::new(n))),
            active: Arc::new(AtomicUsize::new(0)),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserve room for one session
    ///
    /// The reservation lasts until the returned slot is dropped.
    pub fn admit(&self) -> Result<SessionSlot, AdmissionError> {
        let permit = match (&self.permits, self.limit) {
            (Some(permits), Some(limit)) => Some(
                Arc::clone(permits)
                    .try_acquire_owned()
                    .map_err(|_| AdmissionError::AtCapacity(limit))?,
            ),
            _ => None,
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(SessionSlot {
            _permit: permit,
            id: None,
            active: Arc::clone(&self.active),
            registry: Arc::clone(&self.registry),
        })
    }

    /// Number of admitted sessions, registered or not
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of registered sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        lock(&self.registry).values().cloned().collect()
    }

    /// Wait until no session is admitted, or `limit` passes
    ///
    /// Returns whether the tracker drained.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

/// A reserved place for one session, released on drop
pub struct SessionSlot {
    _permit: Option<OwnedSemaphorePermit>,
    id: Option<Uuid>,
    active: Arc<AtomicUsize>,
    registry: Registry,
}

impl SessionSlot {
    /// Record the session occupying this slot
    pub fn register(&mut self, info: SessionInfo) {
        let mut registry = lock(&self.registry);
        if let Some(previous) = self.id.replace(info.id) {
            registry.remove(&previous);
        }
        registry.insert(info.id, info);
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            lock(&self.registry).remove(&id);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionInfo>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
