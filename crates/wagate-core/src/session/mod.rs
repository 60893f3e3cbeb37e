//! In-memory session registry and per-session counters.
//!
//! Pure process state, no persistence. The registry owns exactly one
//! entry per session id; re-registering an id is a replacement and the
//! superseded entry's event loop is aborted so stale handlers cannot act
//! on the new connection's state.

pub mod lifecycle;

pub use lifecycle::SessionManager;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;

use crate::socket::{MessagingSocket, TransportState};

/// Derived status of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Post-handshake identity is known; overrides transport readiness
    Authenticated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Authenticated => "AUTHENTICATED",
        }
    }
}

/// A live connection handle plus the bookkeeping the registry needs to
/// replace it safely.
pub struct RegisteredSession {
    pub socket: Arc<dyn MessagingSocket>,
    /// Which connection attempt this handle belongs to
    pub epoch: u64,
    /// The handle's event-loop task, aborted on replacement or removal
    pub(crate) event_task: AbortHandle,
}

/// Process-wide session registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, RegisteredSession>>,
    retries: Mutex<HashMap<String, u32>>,
    qr_generations: Mutex<HashMap<String, u32>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handle, replacing and silencing any prior entry for
    /// the same id.
    pub async fn register(&self, session_id: &str, session: RegisteredSession) {
        let mut sessions = self.sessions.write().await;
        if let Some(replaced) = sessions.insert(session_id.to_string(), session) {
            replaced.event_task.abort();
        }
    }

    /// Look up the live socket for a session
    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn MessagingSocket>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| Arc::clone(&s.socket))
    }

    /// Epoch of the currently registered handle, if any
    pub async fn epoch_of(&self, session_id: &str) -> Option<u64> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.epoch)
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Remove a session and clear its counters. Aborting the event task
    /// comes last so a handler running this removal finishes its cleanup.
    pub async fn remove(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        self.clear_counters(session_id).await;
        if let Some(removed) = removed {
            removed.event_task.abort();
        }
    }

    /// List `(id, status)` for every registered session
    pub async fn list(&self) -> Vec<(String, SessionStatus)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, session)| (id.clone(), Self::status_of(session)))
            .collect()
    }

    fn status_of(session: &RegisteredSession) -> SessionStatus {
        if session.socket.user().is_some() {
            return SessionStatus::Authenticated;
        }
        match session.socket.transport_state() {
            TransportState::Connecting => SessionStatus::Connecting,
            TransportState::Connected => SessionStatus::Connected,
            TransportState::Disconnecting => SessionStatus::Disconnecting,
            TransportState::Disconnected => SessionStatus::Disconnected,
        }
    }

    /// Current reconnect attempt count, zero if none recorded
    pub async fn retry_attempts(&self, session_id: &str) -> u32 {
        *self.retries.lock().await.get(session_id).unwrap_or(&0)
    }

    /// Record one more reconnect decision, returning the new count.
    /// Created lazily on the first disconnect.
    pub async fn bump_retry(&self, session_id: &str) -> u32 {
        let mut retries = self.retries.lock().await;
        let attempts = retries.entry(session_id.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Record a QR/pairing regeneration. Reserved for pairing throttling;
    /// the send path never consults it.
    pub async fn bump_qr_generation(&self, session_id: &str) -> u32 {
        let mut generations = self.qr_generations.lock().await;
        let count = generations.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop both counters, on successful open and on destroy
    pub async fn clear_counters(&self, session_id: &str) {
        self.retries.lock().await.remove(session_id);
        self.qr_generations.lock().await.remove(session_id);
    }

    #[cfg(test)]
    pub(crate) async fn has_counters(&self, session_id: &str) -> bool {
        self.retries.lock().await.contains_key(session_id)
            || self.qr_generations.lock().await.contains_key(session_id)
    }
}
