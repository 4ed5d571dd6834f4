// SessionRegistry: live connections and their in-flight calls.
//
// One std mutex guards the whole map and is held for exactly one map
// operation; nothing here awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::call::{CallHandle, CallStatus};

/// Identifies one connection's claim on a session id. A reconnect under the
/// same session id gets a new `connection_id`, so stale cleanup from the old
/// socket never touches the new session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub connection_id: u64,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub key: SessionKey,
    /// Cancelled when the session is superseded, removed or the server stops.
    pub shutdown: CancellationToken,
    /// True if an older connection with the same session id was displaced.
    pub superseded: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BeginCallError {
    #[error("session `{0}` is not registered")]
    UnknownSession(String),

    #[error("request_id `{0}` is already in flight on this session")]
    DuplicateRequest(String),
}

#[derive(Debug)]
struct Session {
    connection_id: u64,
    auth_token: String,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    in_flight: HashMap<String, CallHandle>,
    shutdown: CancellationToken,
}

impl Session {
    fn cancel_all(&mut self) -> usize {
        let count = self.in_flight.len();
        for call in self.in_flight.values_mut() {
            call.cancel();
        }
        self.shutdown.cancel();
        count
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub request_id: String,
    pub tool_name: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub connection_id: u64,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: f64,
    pub in_flight: Vec<CallSnapshot>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    next_connection_id: AtomicU64,
    server_shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl SessionRegistry {
    /// Session shutdown tokens are children of `server_shutdown`.
    pub fn new(server_shutdown: CancellationToken) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            server_shutdown,
        }
    }

    /// Register a session after a successful hello. A live session with the
    /// same id is superseded: its calls are cancelled and its socket told to
    /// close.
    pub fn register(&self, session_id: &str, auth_token: &str) -> Registration {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = self.server_shutdown.child_token();
        let session = Session {
            connection_id,
            auth_token: auth_token.to_string(),
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            in_flight: HashMap::new(),
            shutdown: shutdown.clone(),
        };

        let previous = self.lock().insert(session_id.to_string(), session);
        let superseded = match previous {
            Some(mut old) => {
                let cancelled = old.cancel_all();
                info!(
                    session_id,
                    old_connection_id = old.connection_id,
                    cancelled,
                    "session superseded by a new connection"
                );
                true
            }
            None => false,
        };

        Registration {
            key: SessionKey { session_id: session_id.to_string(), connection_id },
            shutdown,
            superseded,
        }
    }

    /// Record inbound activity. Returns false if the session is gone.
    pub fn touch(&self, key: &SessionKey) -> bool {
        self.with_session(key, |session| session.last_activity = Instant::now()).is_some()
    }

    /// Create a pending CallHandle; the returned token fires on cancellation.
    pub fn begin_call(
        &self,
        key: &SessionKey,
        request_id: &str,
        tool_name: &str,
    ) -> Result<CancellationToken, BeginCallError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(&key.session_id)
            .filter(|session| session.connection_id == key.connection_id)
            .ok_or_else(|| BeginCallError::UnknownSession(key.session_id.clone()))?;

        if session.in_flight.contains_key(request_id) {
            return Err(BeginCallError::DuplicateRequest(request_id.to_string()));
        }

        let call = CallHandle::new(request_id, tool_name);
        let token = call.cancel_token();
        session.in_flight.insert(request_id.to_string(), call);
        session.last_activity = Instant::now();
        Ok(token)
    }

    /// Pending -> running, once a concurrency slot is held.
    pub fn mark_running(&self, key: &SessionKey, request_id: &str) -> bool {
        self.with_session(key, |session| match session.in_flight.get_mut(request_id) {
            Some(call) if call.status == CallStatus::Pending => {
                call.status = CallStatus::Running;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Remove the call with its terminal `status`.
    pub fn finish_call(
        &self,
        key: &SessionKey,
        request_id: &str,
        status: CallStatus,
    ) -> Option<CallHandle> {
        self.with_session(key, |session| {
            session.last_activity = Instant::now();
            session.in_flight.remove(request_id).map(|mut call| {
                if !call.status.is_terminal() {
                    call.status = status;
                }
                call
            })
        })
        .flatten()
    }

    /// Cancel one call. The executing task observes the token and reports.
    pub fn cancel_call(&self, key: &SessionKey, request_id: &str) -> bool {
        self.with_session(key, |session| match session.in_flight.get_mut(request_id) {
            Some(call) => {
                call.cancel();
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Drop the session, cancelling everything in flight. Returns the number
    /// of calls cancelled, or `None` if `key` no longer owns the session.
    pub fn remove(&self, key: &SessionKey) -> Option<usize> {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(&key.session_id) {
                Some(session) if session.connection_id == key.connection_id => {
                    sessions.remove(&key.session_id)
                }
                _ => None,
            }
        };
        removed.map(|mut session| {
            let cancelled = session.cancel_all();
            debug!(session_id = %key.session_id, cancelled, "session removed");
            cancelled
        })
    }

    /// True when the session has nothing in flight and has seen no activity
    /// for at least `idle_timeout`.
    pub fn is_idle(&self, key: &SessionKey, idle_timeout: Duration) -> bool {
        self.with_session(key, |session| {
            session.in_flight.is_empty() && session.last_activity.elapsed() >= idle_timeout
        })
        .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.lock();
        let mut snapshot: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(session_id, session)| {
                let mut in_flight: Vec<CallSnapshot> = session
                    .in_flight
                    .values()
                    .map(|call| CallSnapshot {
                        request_id: call.request_id.clone(),
                        tool_name: call.tool_name.clone(),
                        status: call.status,
                        started_at: call.started_at,
                    })
                    .collect();
                in_flight.sort_by(|a, b| a.request_id.cmp(&b.request_id));
                SessionSnapshot {
                    session_id: session_id.clone(),
                    connection_id: session.connection_id,
                    authenticated: !session.auth_token.is_empty(),
                    connected_at: session.connected_at,
                    idle_secs: session.last_activity.elapsed().as_secs_f64(),
                    in_flight,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn in_flight_count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, |session| session.in_flight.len())
    }

    pub fn total_in_flight(&self) -> usize {
        self.lock().values().map(|session| session.in_flight.len()).sum()
    }

    fn with_session<T>(&self, key: &SessionKey, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let mut sessions = self.lock();
        sessions
            .get_mut(&key.session_id)
            .filter(|session| session.connection_id == key.connection_id)
            .map(f)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
