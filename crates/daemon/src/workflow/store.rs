// Conversation persistence: where workflow state lives between steps.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use super::state::WorkflowState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conversation store backend failed: {0}")]
    Backend(String),

    #[error("stored workflow state is unreadable: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<WorkflowState>, StoreError>;

    async fn put(&self, key: &str, state: WorkflowState, ttl: Duration) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

struct Entry {
    state: WorkflowState,
    expires_at: Instant,
}

/// In-process store. Expired entries are invisible to `get` and reclaimed by
/// `purge_expired`.
#[derive(Default)]
pub struct MemoryConversationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, key: &str) -> Result<Option<WorkflowState>, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.state.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, state: WorkflowState, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.lock().insert(key.to_string(), Entry { state, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}
