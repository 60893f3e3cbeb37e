//! Messaging-backend collaborator boundary.
//!
//! The wire protocol and cryptographic handshake live behind the
//! [`MessagingSocket`] and [`SocketFactory`] traits; this module only
//! defines their store-facing surface: credential material, the socket
//! event stream, and disconnect classification. The gateway never looks
//! inside the payloads it persists for the socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

/// Why the backend closed a connection, taken from the status code carried
/// by the last disconnect error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 401 - the account was logged out; the session cannot be resumed
    LoggedOut,
    /// 408 - link lost or timed out
    ConnectionLost,
    /// 428 - backend closed the connection
    ConnectionClosed,
    /// 440 - another client took over this session
    ConnectionReplaced,
    /// 500 - credential state rejected by the backend
    BadSession,
    /// 515 - protocol-driven restart; expected after pairing
    RestartRequired,
    /// Anything else, including a missing code
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(408) => Self::ConnectionLost,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(515) => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }
}

/// Readiness of the underlying transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Post-handshake account identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A public/private key pair, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: String,
    pub private: String,
}

impl KeyPair {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut public = [0u8; 32];
        let mut private = [0u8; 32];
        rng.fill_bytes(&mut public);
        rng.fill_bytes(&mut private);
        Self {
            public: BASE64.encode(public),
            private: BASE64.encode(private),
        }
    }
}

/// Core identity credentials.
///
/// Persisted as an opaque blob under the `creds` item id; the gateway only
/// ever round-trips it through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCreds {
    pub noise_key: KeyPair,
    pub signed_identity_key: KeyPair,
    pub registration_id: u32,
    pub next_pre_key_id: u32,
    #[serde(default)]
    pub me: Option<Contact>,
}

impl AuthCreds {
    /// Synthesize a fresh default identity for a session that has never
    /// paired. Not persisted until the first credential update is saved.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            noise_key: KeyPair::generate(),
            signed_identity_key: KeyPair::generate(),
            // 14-bit registration id, per the protocol's registration space
            registration_id: (rng.next_u32() & 0x3fff).max(1),
            next_pre_key_id: 1,
            me: None,
        }
    }
}

/// Kinds of cryptographic key material the socket stores per session.
///
/// `as_str` values double as the `{type}` half of the persisted
/// `{type}-{id}` item ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKeyKind {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl SignalKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreKey => "pre-key",
            Self::Session => "session",
            Self::SenderKey => "sender-key",
            Self::SenderKeyMemory => "sender-key-memory",
            Self::AppStateSyncKey => "app-state-sync-key",
            Self::AppStateSyncVersion => "app-state-sync-version",
        }
    }
}

/// App-state sync key material, the one key kind whose persisted form is
/// re-decoded into a typed structure on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSyncKeyData {
    #[serde(default)]
    pub key_data: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Batched key mutation: `Some` upserts, `None` deletes.
pub type SignalDataSet = HashMap<SignalKeyKind, HashMap<String, Option<Value>>>;

/// Get/set accessor over per-session key material.
///
/// Batched operations fan out per id with no ordering guarantee among
/// items; callers rely only on the aggregate result.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    /// Resolve each requested id independently; the returned map carries
    /// exactly the requested ids, `None` where the lookup came up empty.
    async fn get(&self, kind: SignalKeyKind, ids: &[String]) -> HashMap<String, Option<Value>>;

    /// Apply a batched mutation set.
    async fn set(&self, data: SignalDataSet);
}

/// Read-through cache over a [`SignalKeyStore`].
///
/// Supplied to the socket at construction so hot Signal lookups skip the
/// database. Writes go through to the inner store and refresh the cache.
pub struct CachingSignalKeyStore {
    inner: Arc<dyn SignalKeyStore>,
    cache: Mutex<HashMap<(SignalKeyKind, String), Option<Value>>>,
}

impl CachingSignalKeyStore {
    pub fn wrap(inner: Arc<dyn SignalKeyStore>) -> Arc<dyn SignalKeyStore> {
        Arc::new(Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SignalKeyStore for CachingSignalKeyStore {
    async fn get(&self, kind: SignalKeyKind, ids: &[String]) -> HashMap<String, Option<Value>> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        {
            let cache = self.cache.lock().await;
            for id in ids {
                match cache.get(&(kind, id.clone())) {
                    Some(value) => {
                        out.insert(id.clone(), value.clone());
                    }
                    None => misses.push(id.clone()),
                }
            }
        }

        if !misses.is_empty() {
            let fetched = self.inner.get(kind, &misses).await;
            let mut cache = self.cache.lock().await;
            for (id, value) in fetched {
                cache.insert((kind, id.clone()), value.clone());
                out.insert(id, value);
            }
        }

        out
    }

    async fn set(&self, data: SignalDataSet) {
        {
            let mut cache = self.cache.lock().await;
            for (kind, items) in &data {
                for (id, value) in items {
                    cache.insert((*kind, id.clone()), value.clone());
                }
            }
        }
        self.inner.set(data).await;
    }
}

/// Authentication aggregate handed to the socket at construction.
///
/// Rebuilt from the store on every connect attempt; never carried across
/// attempts in memory.
pub struct AuthState {
    pub creds: AuthCreds,
    pub keys: Arc<dyn SignalKeyStore>,
}

/// Serializable socket configuration, persisted once per session so a
/// process restart can recreate the connection identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketConfig {
    /// Browser identity string advertised during the handshake
    #[serde(default = "default_browser")]
    pub browser: String,
    /// Whether the socket should render pairing QR payloads itself
    #[serde(default)]
    pub print_qr_in_terminal: bool,
    /// Drop broadcast-type recipients before they reach the session
    #[serde(default = "default_true")]
    pub ignore_broadcast_jids: bool,
    /// Arbitrary additional protocol options, passed through untouched
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

fn default_browser() -> String {
    "Ubuntu (Chrome)".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            browser: default_browser(),
            print_qr_in_terminal: false,
            ignore_broadcast_jids: true,
            extra: serde_json::Map::new(),
        }
    }
}

/// A disconnect error as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectError {
    pub status_code: Option<u16>,
    pub message: String,
}

/// Connection phase reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

/// Partial connection-state update.
///
/// Each update carries only the fields that changed; the lifecycle
/// controller merges them into its locally held state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionPhase>,
    pub last_disconnect: Option<DisconnectError>,
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    /// Merge a partial update into this state, keeping fields the update
    /// does not mention.
    pub fn merge(&mut self, update: &ConnectionUpdate) {
        if let Some(connection) = update.connection {
            self.connection = Some(connection);
        }
        if let Some(last_disconnect) = &update.last_disconnect {
            self.last_disconnect = Some(last_disconnect.clone());
        }
        if let Some(qr) = &update.qr {
            self.qr = Some(qr.clone());
        }
    }
}

/// Events emitted by a live socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Credential material changed and must be persisted
    CredsUpdate(AuthCreds),
    /// Connection state changed
    ConnectionUpdate(ConnectionUpdate),
}

/// Outbound message content.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
}

/// Delivery receipt returned by the backend for an accepted send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub remote_jid: String,
    pub timestamp: i64,
}

/// Group metadata as returned by the backend. Only existence matters to
/// the gateway; everything else stays opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
}

/// A live connection to the messaging backend.
#[async_trait]
pub trait MessagingSocket: Send + Sync {
    async fn send_message(&self, jid: &str, content: MessageContent) -> Result<DeliveryReceipt>;

    /// Invalidate the session on the backend side.
    async fn logout(&self) -> Result<()>;

    /// Existence lookup for a direct-message recipient.
    async fn exists_on_backend(&self, jid: &str) -> Result<bool>;

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata>;

    /// Readiness of the underlying link.
    fn transport_state(&self) -> TransportState;

    /// Post-handshake identity, `None` until the handshake confirms it.
    fn user(&self) -> Option<Contact>;
}

/// Opens sockets. The production implementation owns the wire protocol;
/// the gateway only consumes the handle and its event stream.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(
        &self,
        auth: AuthState,
        config: SocketConfig,
    ) -> Result<(Arc<dyn MessagingSocket>, mpsc::Receiver<SocketEvent>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_from_code() {
        assert_eq!(
            DisconnectReason::from_code(Some(401)),
            DisconnectReason::LoggedOut
        );
        assert_eq!(
            DisconnectReason::from_code(Some(515)),
            DisconnectReason::RestartRequired
        );
        assert_eq!(
            DisconnectReason::from_code(Some(428)),
            DisconnectReason::ConnectionClosed
        );
        assert_eq!(
            DisconnectReason::from_code(Some(999)),
            DisconnectReason::Unknown(Some(999))
        );
        assert_eq!(
            DisconnectReason::from_code(None),
            DisconnectReason::Unknown(None)
        );
    }

    #[test]
    fn test_connection_update_merge_keeps_unmentioned_fields() {
        let mut state = ConnectionUpdate::default();
        state.merge(&ConnectionUpdate {
            connection: Some(ConnectionPhase::Connecting),
            last_disconnect: None,
            qr: Some("pairing-payload".into()),
        });
        state.merge(&ConnectionUpdate {
            connection: Some(ConnectionPhase::Close),
            last_disconnect: Some(DisconnectError {
                status_code: Some(428),
                message: "closed".into(),
            }),
            qr: None,
        });

        assert_eq!(state.connection, Some(ConnectionPhase::Close));
        assert_eq!(state.qr.as_deref(), Some("pairing-payload"));
        assert_eq!(
            state.last_disconnect.as_ref().and_then(|e| e.status_code),
            Some(428)
        );
    }

    #[test]
    fn test_auth_creds_roundtrip() {
        let creds = AuthCreds::generate();
        assert!(creds.registration_id >= 1 && creds.registration_id <= 0x3fff);

        let json = serde_json::to_string(&creds).unwrap();
        let back: AuthCreds = serde_json::from_str(&json).unwrap();
        assert_eq!(creds, back);
    }

    #[test]
    fn test_socket_config_defaults_survive_partial_json() {
        let config: SocketConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SocketConfig::default());
        assert!(config.ignore_broadcast_jids);
        assert!(!config.print_qr_in_terminal);
    }

    struct CountingStore {
        hits: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SignalKeyStore for CountingStore {
        async fn get(
            &self,
            _kind: SignalKeyKind,
            ids: &[String],
        ) -> HashMap<String, Option<Value>> {
            self.hits
                .fetch_add(ids.len(), std::sync::atomic::Ordering::SeqCst);
            ids.iter()
                .map(|id| (id.clone(), Some(Value::String(format!("v-{id}")))))
                .collect()
        }

        async fn set(&self, _data: SignalDataSet) {}
    }

    #[tokio::test]
    async fn test_caching_key_store_reads_through_once() {
        let inner = Arc::new(CountingStore {
            hits: std::sync::atomic::AtomicUsize::new(0),
        });
        let cached = CachingSignalKeyStore::wrap(inner.clone());

        let ids = vec!["a".to_string(), "b".to_string()];
        let first = cached.get(SignalKeyKind::Session, &ids).await;
        let second = cached.get(SignalKeyKind::Session, &ids).await;

        assert_eq!(first, second);
        assert_eq!(inner.hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
