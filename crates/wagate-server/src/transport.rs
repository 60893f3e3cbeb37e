//! Loopback development transport.
//!
//! Stands in for the wire protocol while the production socket lives out
//! of tree: it reports the handshake as complete immediately, confirms
//! every recipient, and acknowledges sends locally. Useful for running
//! the gateway end to end without backend connectivity.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use wagate_core::messaging::{is_broadcast_jid, USER_SUFFIX};
use wagate_core::socket::{
    AuthCreds, AuthState, ConnectionPhase, ConnectionUpdate, Contact, DeliveryReceipt,
    GroupMetadata, MessageContent, MessagingSocket, SocketConfig, SocketEvent, SocketFactory,
    TransportState,
};
use wagate_core::{Error, Result};

pub struct LoopbackSocket {
    user: Contact,
    /// Encoded [`TransportState`]; the trait surface is sync, so plain
    /// atomics beat a lock here
    transport: AtomicU8,
    ignore_broadcast_jids: bool,
    sequence: AtomicU64,
}

const CONNECTED: u8 = 0;
const DISCONNECTED: u8 = 1;

impl LoopbackSocket {
    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessagingSocket for LoopbackSocket {
    async fn send_message(&self, jid: &str, content: MessageContent) -> Result<DeliveryReceipt> {
        if self.ignore_broadcast_jids && is_broadcast_jid(jid) {
            return Err(Error::Transport(format!(
                "broadcast recipient rejected: {jid}"
            )));
        }
        if self.transport.load(Ordering::SeqCst) != CONNECTED {
            return Err(Error::Transport("link is not connected".into()));
        }

        let MessageContent::Text(text) = content;
        info!(jid, text, "Loopback delivery");
        Ok(DeliveryReceipt {
            message_id: format!("LB{:012X}", self.sequence.fetch_add(1, Ordering::SeqCst)),
            remote_jid: jid.to_string(),
            timestamp: Self::now_millis(),
        })
    }

    async fn logout(&self) -> Result<()> {
        self.transport.store(DISCONNECTED, Ordering::SeqCst);
        Ok(())
    }

    async fn exists_on_backend(&self, _jid: &str) -> Result<bool> {
        Ok(true)
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata> {
        Ok(GroupMetadata {
            id: jid.to_string(),
            subject: None,
        })
    }

    fn transport_state(&self) -> TransportState {
        match self.transport.load(Ordering::SeqCst) {
            CONNECTED => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }

    fn user(&self) -> Option<Contact> {
        Some(self.user.clone())
    }
}

#[derive(Default)]
pub struct LoopbackFactory;

impl LoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl SocketFactory for LoopbackFactory {
    async fn connect(
        &self,
        auth: AuthState,
        config: SocketConfig,
    ) -> Result<(Arc<dyn MessagingSocket>, mpsc::Receiver<SocketEvent>)> {
        let user = auth.creds.me.clone().unwrap_or_else(|| Contact {
            id: format!("{}{USER_SUFFIX}", auth.creds.registration_id),
            name: None,
        });

        let socket = Arc::new(LoopbackSocket {
            user: user.clone(),
            transport: AtomicU8::new(CONNECTED),
            ignore_broadcast_jids: config.ignore_broadcast_jids,
            sequence: AtomicU64::new(1),
        });

        let (events, rx) = mpsc::channel(64);
        let creds = AuthCreds {
            me: Some(user),
            ..auth.creds
        };
        tokio::spawn(async move {
            // Emitted in handshake order: identity confirmation, then open
            let _ = events.send(SocketEvent::CredsUpdate(creds)).await;
            let _ = events
                .send(SocketEvent::ConnectionUpdate(ConnectionUpdate {
                    connection: Some(ConnectionPhase::Open),
                    ..Default::default()
                }))
                .await;
        });

        Ok((socket, rx))
    }
}
