//! Connection lifecycle controller.
//!
//! Owns the per-session state machine: a session is created (or restored
//! from its persisted config at startup), its socket's event stream is
//! consumed until the connection closes, and the close is classified into
//! reconnect or teardown:
//!
//! - logged out → terminal, protocol logout attempted, rows deleted
//! - retry budget exhausted → terminal, logout skipped (link presumed dead)
//! - restart required → immediate reconnect, outside the budget
//! - anything else → one shared budget, delayed reconnect
//!
//! Every connection attempt carries an epoch; handlers verify they still
//! own the current epoch before acting, so a superseded socket cannot
//! touch the replacement's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{self, CredStore, CREDS_ID};
use crate::config::Config;
use crate::error::Result;
use crate::session::{RegisteredSession, SessionRegistry, SessionStatus};
use crate::socket::{
    AuthState, CachingSignalKeyStore, ConnectionPhase, ConnectionUpdate, DisconnectReason,
    SocketConfig, SocketEvent, SocketFactory,
};
use crate::store::SessionStore;

/// Reserved item-id prefix for persisted per-session socket configuration.
pub const SESSION_CONFIG_ID: &str = "session-config";

/// Drives session creation, reconnection and teardown.
pub struct SessionManager {
    store: Arc<SessionStore>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn SocketFactory>,
    config: Config,
    /// Monotonic connection-attempt token per session id
    epochs: Mutex<HashMap<String, u64>>,
    /// Pending reconnect timers; a newer attempt cancels the prior one
    reconnect_tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        factory: Arc<dyn SocketFactory>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry: SessionRegistry::new(),
            factory,
            config,
            epochs: Mutex::new(HashMap::new()),
            reconnect_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Recreate every persisted session, or create the default one on a
    /// fresh store.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let rows = self.store.list_by_id_prefix(SESSION_CONFIG_ID)?;

        if rows.is_empty() {
            let session_id = self.config.default_session_id.clone();
            info!(session_id, "No persisted sessions, creating the default one");
            return self.create_session(&session_id, None).await;
        }

        for row in rows {
            let socket_config = match serde_json::from_str::<SocketConfig>(&row.data) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(session_id = %row.session_id, error = %e,
                          "Persisted socket config is unreadable, using defaults");
                    None
                }
            };
            if let Err(e) = self.create_session(&row.session_id, socket_config).await {
                error!(session_id = %row.session_id, error = %e, "Failed to restore session");
            }
        }
        Ok(())
    }

    /// Open a connection for a session and register its handle, replacing
    /// and silencing any prior handle for the same id.
    ///
    /// Boxed: the reconnect task re-enters this future, so the recursion
    /// has to go through an erased type.
    pub fn create_session<'a>(
        self: &'a Arc<Self>,
        session_id: &'a str,
        socket_config: Option<SocketConfig>,
    ) -> BoxFuture<'a, Result<()>> {
        self.create_session_inner(session_id, socket_config).boxed()
    }

    async fn create_session_inner(
        self: &Arc<Self>,
        session_id: &str,
        socket_config: Option<SocketConfig>,
    ) -> Result<()> {
        let epoch = self.next_epoch(session_id).await;
        let effective = socket_config.unwrap_or_default();

        // Auth state is rebuilt from the store on every attempt; the store
        // is the single source of truth across reconnects.
        let (state, cred_store) =
            auth::use_store_auth_state(Arc::clone(&self.store), session_id).await;
        let auth = AuthState {
            creds: state.creds,
            keys: CachingSignalKeyStore::wrap(state.keys),
        };

        let (socket, events) = self.factory.connect(auth, effective.clone()).await?;

        // The event loop must not observe a close before the handle is
        // registered, so it waits for the gate below.
        let (ready_tx, ready_rx) = oneshot::channel();
        let event_task = tokio::spawn(Self::run_event_loop(
            Arc::clone(self),
            session_id.to_string(),
            epoch,
            effective.clone(),
            cred_store,
            events,
            ready_rx,
        ));

        self.registry
            .register(
                session_id,
                RegisteredSession {
                    socket,
                    epoch,
                    event_task: event_task.abort_handle(),
                },
            )
            .await;
        let _ = ready_tx.send(());

        // Idempotent upsert of the effective config so a restart recreates
        // this session identically.
        let config_id = format!("{SESSION_CONFIG_ID}-{session_id}");
        let data = serde_json::to_string(&effective)?;
        if let Err(e) = self.store.upsert(session_id, &config_id, &data) {
            error!(session_id, error = %e, "Failed to persist session config");
        }

        debug!(session_id, epoch, "Session created");
        Ok(())
    }

    /// Tear a session down: optional protocol logout, deletion of all
    /// persisted rows, then removal from the registry. Individual failures
    /// are logged without stopping the rest; removal always happens.
    pub async fn destroy(self: &Arc<Self>, session_id: &str, should_logout: bool) {
        if let Some(pending) = self.reconnect_tasks.lock().await.remove(session_id) {
            pending.abort();
        }

        if should_logout {
            if let Some(socket) = self.registry.get(session_id).await {
                if let Err(e) = socket.logout().await {
                    warn!(session_id, error = %e, "Logout failed during session destroy");
                }
            }
        }

        match self.store.delete_session(session_id) {
            Ok(rows) => debug!(session_id, rows, "Deleted persisted session rows"),
            Err(e) => {
                error!(session_id, error = %e, "An error occurred during session destroy")
            }
        }

        self.registry.remove(session_id).await;
        info!(session_id, "Session destroyed");
    }

    /// User-initiated teardown; always attempts the protocol logout.
    pub async fn delete_session(self: &Arc<Self>, session_id: &str) {
        self.destroy(session_id, true).await;
    }

    pub async fn session_exists(&self, session_id: &str) -> bool {
        self.registry.exists(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<(String, SessionStatus)> {
        self.registry.list().await
    }

    async fn next_epoch(&self, session_id: &str) -> u64 {
        let mut epochs = self.epochs.lock().await;
        let epoch = epochs.entry(session_id.to_string()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    async fn is_current_epoch(&self, session_id: &str, epoch: u64) -> bool {
        self.epochs.lock().await.get(session_id) == Some(&epoch)
    }

    async fn run_event_loop(
        manager: Arc<Self>,
        session_id: String,
        epoch: u64,
        socket_config: SocketConfig,
        cred_store: Arc<CredStore>,
        mut events: mpsc::Receiver<SocketEvent>,
        ready: oneshot::Receiver<()>,
    ) {
        let _ = ready.await;
        let mut connection_state = ConnectionUpdate::default();

        while let Some(event) = events.recv().await {
            if !manager.is_current_epoch(&session_id, epoch).await {
                debug!(session_id, epoch, "Dropping event from superseded connection");
                return;
            }
            match event {
                SocketEvent::CredsUpdate(creds) => {
                    cred_store.write(&creds, CREDS_ID).await;
                }
                SocketEvent::ConnectionUpdate(update) => {
                    connection_state.merge(&update);

                    if let Some(qr) = &update.qr {
                        let generation = manager.registry.bump_qr_generation(&session_id).await;
                        info!(session_id, generation, qr, "Pairing challenge received");
                    }

                    match update.connection {
                        Some(ConnectionPhase::Open) => {
                            // Successful handshake resets the backoff state
                            manager.registry.clear_counters(&session_id).await;
                            info!(session_id, "Connection open");
                        }
                        Some(ConnectionPhase::Close) => {
                            manager
                                .handle_connection_close(
                                    &session_id,
                                    &connection_state,
                                    socket_config,
                                )
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Classify a close and decide reconnect vs. terminate. All
    /// non-terminal codes share one retry budget against a fixed ceiling.
    ///
    /// Boxed for the same reason as `create_session`: failed reconnect
    /// attempts feed back into this future from the reconnect task.
    fn handle_connection_close<'a>(
        self: &'a Arc<Self>,
        session_id: &'a str,
        state: &'a ConnectionUpdate,
        socket_config: SocketConfig,
    ) -> BoxFuture<'a, ()> {
        self.handle_connection_close_inner(session_id, state, socket_config)
            .boxed()
    }

    async fn handle_connection_close_inner(
        self: &Arc<Self>,
        session_id: &str,
        state: &ConnectionUpdate,
        socket_config: SocketConfig,
    ) {
        let code = state.last_disconnect.as_ref().and_then(|e| e.status_code);
        let reason = DisconnectReason::from_code(code);

        if reason == DisconnectReason::LoggedOut {
            info!(session_id, "Logged out, tearing session down");
            self.destroy(session_id, true).await;
            return;
        }

        // Expected protocol-driven restart: outside the budget, no delay,
        // and not worth a reconnect log line.
        if reason == DisconnectReason::RestartRequired {
            self.schedule_reconnect(session_id, socket_config, Duration::ZERO)
                .await;
            return;
        }

        if self.registry.retry_attempts(session_id).await >= self.config.max_reconnect_retries {
            warn!(session_id, ?reason, "Reconnect budget exhausted, tearing session down");
            self.destroy(session_id, false).await;
            return;
        }

        let attempts = self.registry.bump_retry(session_id).await;
        info!(session_id, attempts, ?reason, "Reconnecting...");
        self.schedule_reconnect(session_id, socket_config, self.config.reconnect_interval)
            .await;
    }

    async fn schedule_reconnect(
        self: &Arc<Self>,
        session_id: &str,
        socket_config: SocketConfig,
        delay: Duration,
    ) {
        let manager = Arc::clone(self);
        let sid = session_id.to_string();

        let mut tasks = self.reconnect_tasks.lock().await;
        if let Some(pending) = tasks.remove(&sid) {
            pending.abort();
        }

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            manager.reconnect_tasks.lock().await.remove(&sid);
            if let Err(e) = manager
                .create_session(&sid, Some(socket_config.clone()))
                .await
            {
                error!(session_id = %sid, error = %e, "Reconnect attempt failed");
                // A failed attempt counts like any other transient close:
                // it consumes budget and either retries or tears down.
                let state = ConnectionUpdate {
                    connection: Some(ConnectionPhase::Close),
                    ..Default::default()
                };
                manager
                    .handle_connection_close(&sid, &state, socket_config)
                    .await;
            }
        });
        tasks.insert(session_id.to_string(), handle.abort_handle());
    }
}
