// Concurrency limits for tool calls: one global pool plus one pool per
// session, so a single busy client cannot starve the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Held for the lifetime of one executing call. Dropping it frees both slots.
#[derive(Debug)]
pub struct CallPermit {
    _session: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

pub struct CallLimiter {
    global: Arc<Semaphore>,
    per_session_limit: usize,
    sessions: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl CallLimiter {
    pub fn new(global_limit: usize, per_session_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit)),
            per_session_limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a slot. The session slot is taken first so a session at its
    /// own limit never holds a global slot while it waits.
    pub async fn acquire(&self, session_id: &str) -> Result<CallPermit, AcquireError> {
        let session = self.session_semaphore(session_id);
        let session_permit = session.acquire_owned().await?;
        let global_permit = Arc::clone(&self.global).acquire_owned().await?;
        Ok(CallPermit { _session: session_permit, _global: global_permit })
    }

    /// Drop the per-session pool once the session is gone. Permits still held
    /// keep their semaphore alive until released.
    pub fn forget_session(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }

    pub fn available_for(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map_or(self.per_session_limit, |semaphore| semaphore.available_permits())
    }

    fn session_semaphore(&self, session_id: &str) -> Arc<Semaphore> {
        Arc::clone(
            self.lock()
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_session_limit))),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
