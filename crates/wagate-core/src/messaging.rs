//! Messaging facade: recipient normalization, existence checks, sends.
//!
//! Everything here rides on the registry; no session means no send. A
//! send that fails verification comes back as `Ok(None)` rather than an
//! error: the reason has already been logged or verified, and callers
//! only need "was it sent". Backend existence lookups are the one path
//! that propagates failures, because "doesn't exist" and "check failed"
//! must stay distinguishable.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::session::SessionRegistry;
use crate::socket::{DeliveryReceipt, MessageContent, MessagingSocket};

/// Domain suffix of group chats.
pub const GROUP_SUFFIX: &str = "@g.us";
/// Domain suffix of direct-message recipients.
pub const USER_SUFFIX: &str = "@s.whatsapp.net";
/// Domain suffix of broadcast recipients, filtered before the session.
pub const BROADCAST_SUFFIX: &str = "@broadcast";

/// Normalize a raw recipient into a chat jid.
///
/// Ids already carrying a domain pass through; a `-` marks a group id,
/// anything else is a direct-message number.
pub fn to_chat_jid(id: &str) -> String {
    if id.contains(GROUP_SUFFIX) || id.contains(USER_SUFFIX) {
        return id.to_string();
    }
    if id.contains('-') {
        format!("{id}{GROUP_SUFFIX}")
    } else {
        format!("{id}{USER_SUFFIX}")
    }
}

/// Recipient-filtering predicate handed to the socket.
pub fn is_broadcast_jid(jid: &str) -> bool {
    jid.ends_with(BROADCAST_SUFFIX)
}

/// What kind of jid an existence check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    Number,
    Group,
}

/// Backend existence lookup. Propagates backend errors unchanged.
pub async fn jid_exists(socket: &dyn MessagingSocket, jid: &str, kind: JidKind) -> Result<bool> {
    match kind {
        JidKind::Number => socket.exists_on_backend(jid).await,
        // Existence equals the presence of a returned group identifier
        JidKind::Group => Ok(!socket.group_metadata(jid).await?.id.is_empty()),
    }
}

/// Outbound dispatch over registered sessions.
pub struct Messenger {
    registry: Arc<SessionRegistry>,
}

impl Messenger {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Check a normalized recipient against a session.
    ///
    /// Group jids are trusted unconditionally: group existence is not
    /// cheaply verifiable up front. Direct jids are checked against the
    /// live session; no registered session means `false`.
    pub async fn verify_recipient(&self, jid: &str, session_id: &str) -> Result<bool> {
        if jid.contains(GROUP_SUFFIX) {
            return Ok(true);
        }
        match self.registry.get(session_id).await {
            Some(socket) => jid_exists(socket.as_ref(), jid, JidKind::Number).await,
            None => Ok(false),
        }
    }

    /// Send a text message.
    ///
    /// `Ok(None)` means not sent: the recipient failed verification or no
    /// session is registered under this id. `Ok(Some(_))` carries the
    /// backend's delivery receipt.
    pub async fn send_text(
        &self,
        session_id: &str,
        text: &str,
        to: &str,
    ) -> Result<Option<DeliveryReceipt>> {
        let jid = to_chat_jid(to);
        if !self.verify_recipient(&jid, session_id).await? {
            debug!(session_id, jid, "Recipient failed verification, not sending");
            return Ok(None);
        }

        let Some(socket) = self.registry.get(session_id).await else {
            debug!(session_id, "No registered session, not sending");
            return Ok(None);
        };

        let receipt = socket
            .send_message(&jid, MessageContent::Text(text.to_string()))
            .await?;
        Ok(Some(receipt))
    }
}
