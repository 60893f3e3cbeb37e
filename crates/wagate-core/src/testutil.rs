//! Test doubles for the messaging-backend boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::socket::{
    AuthCreds, AuthState, Contact, ConnectionPhase, ConnectionUpdate, DeliveryReceipt,
    DisconnectError, GroupMetadata, MessageContent, MessagingSocket, SocketConfig, SocketEvent,
    SocketFactory, TransportState,
};

/// Scriptable socket: records sends and logouts, serves configurable
/// existence responses.
pub(crate) struct MockSocket {
    transport: Mutex<TransportState>,
    user: Mutex<Option<Contact>>,
    sent: Mutex<Vec<(String, MessageContent)>>,
    logout_calls: AtomicUsize,
    exists: AtomicBool,
    fail_existence: AtomicBool,
}

impl MockSocket {
    pub fn connected() -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(TransportState::Connected),
            user: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            logout_calls: AtomicUsize::new(0),
            exists: AtomicBool::new(true),
            fail_existence: AtomicBool::new(false),
        })
    }

    pub fn set_transport_state(&self, state: TransportState) {
        *self.transport.lock().unwrap() = state;
    }

    pub fn set_user(&self, user: Option<Contact>) {
        *self.user.lock().unwrap() = user;
    }

    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::SeqCst);
    }

    pub fn fail_existence_checks(&self) {
        self.fail_existence.store(true, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<(String, MessageContent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn logout_count(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingSocket for MockSocket {
    async fn send_message(&self, jid: &str, content: MessageContent) -> Result<DeliveryReceipt> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((jid.to_string(), content));
        Ok(DeliveryReceipt {
            message_id: format!("MOCK-{}", sent.len()),
            remote_jid: jid.to_string(),
            timestamp: 0,
        })
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists_on_backend(&self, _jid: &str) -> Result<bool> {
        if self.fail_existence.load(Ordering::SeqCst) {
            return Err(Error::Transport("existence check failed".into()));
        }
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata> {
        if self.fail_existence.load(Ordering::SeqCst) {
            return Err(Error::Transport("metadata fetch failed".into()));
        }
        Ok(GroupMetadata {
            id: jid.to_string(),
            subject: None,
        })
    }

    fn transport_state(&self) -> TransportState {
        *self.transport.lock().unwrap()
    }

    fn user(&self) -> Option<Contact> {
        self.user.lock().unwrap().clone()
    }
}

/// One connection opened through a [`MockFactory`]: the socket handed to
/// the registry plus the sender side of its event stream.
#[derive(Clone)]
pub(crate) struct MockConnection {
    pub socket: Arc<MockSocket>,
    events: mpsc::Sender<SocketEvent>,
}

impl MockConnection {
    pub async fn emit(&self, event: SocketEvent) {
        // The receiver is gone once the connection is superseded; events
        // for it are simply dropped, like the real socket's would be.
        let _ = self.events.send(event).await;
    }

    pub async fn emit_open(&self) {
        self.emit(SocketEvent::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionPhase::Open),
            ..Default::default()
        }))
        .await;
    }

    pub async fn emit_close(&self, status_code: Option<u16>) {
        self.emit(SocketEvent::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionPhase::Close),
            last_disconnect: Some(DisconnectError {
                status_code,
                message: "closed by test".into(),
            }),
            qr: None,
        }))
        .await;
    }

    pub async fn emit_qr(&self, qr: &str) {
        self.emit(SocketEvent::ConnectionUpdate(ConnectionUpdate {
            qr: Some(qr.to_string()),
            ..Default::default()
        }))
        .await;
    }

    pub async fn emit_creds_update(&self, creds: AuthCreds) {
        self.emit(SocketEvent::CredsUpdate(creds)).await;
    }
}

/// Factory that records every opened connection so tests can drive their
/// event streams. Connect attempts can be scripted to fail.
#[derive(Default)]
pub(crate) struct MockFactory {
    connections: Mutex<Vec<MockConnection>>,
    failing_connects: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful connections only; failed attempts are not recorded
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn latest(&self) -> MockConnection {
        self.connections
            .lock()
            .unwrap()
            .last()
            .expect("no connection opened yet")
            .clone()
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketFactory for MockFactory {
    async fn connect(
        &self,
        _auth: AuthState,
        _config: SocketConfig,
    ) -> Result<(Arc<dyn MessagingSocket>, mpsc::Receiver<SocketEvent>)> {
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("backend unreachable".into()));
        }

        let (events, rx) = mpsc::channel(16);
        let socket = MockSocket::connected();
        self.connections.lock().unwrap().push(MockConnection {
            socket: Arc::clone(&socket),
            events,
        });
        Ok((socket, rx))
    }
}
