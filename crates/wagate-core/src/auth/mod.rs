//! Credential store adapter.
//!
//! Bridges the opaque credential material the socket produces and the
//! sqlite session store. Store failures never cross this boundary: every
//! operation logs and downgrades to a default so a connection attempt can
//! proceed; at worst the next reconnect re-authenticates. The one
//! exception lives elsewhere (see `messaging::jid_exists`).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::socket::{
    AppStateSyncKeyData, AuthCreds, AuthState, SignalDataSet, SignalKeyKind, SignalKeyStore,
};
use crate::store::SessionStore;

/// Item id of the core identity credentials.
pub const CREDS_ID: &str = "creds";

/// Normalize an item id for use as a store key.
///
/// Applied identically on every read, write and delete, so the mapping
/// never needs to be reversed.
fn fix_id(id: &str) -> String {
    id.replace('/', "__").replace(':', "-")
}

/// Per-session credential accessor over the shared store.
pub struct CredStore {
    store: Arc<SessionStore>,
    session_id: String,
}

impl CredStore {
    pub fn new(store: Arc<SessionStore>, session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            session_id: session_id.into(),
        })
    }

    /// Serialize and upsert a payload. Store errors are logged, never raised.
    pub async fn write<T: Serialize>(&self, data: &T, id: &str) {
        let payload = match serde_json::to_string(data) {
            Ok(payload) => payload,
            Err(e) => {
                error!(session_id = %self.session_id, id, error = %e,
                       "An error occurred during session write");
                return;
            }
        };
        if let Err(e) = self.store.upsert(&self.session_id, &fix_id(id), &payload) {
            error!(session_id = %self.session_id, id, error = %e,
                   "An error occurred during session write");
        }
    }

    /// Fetch and deserialize a payload. Absence and failure both come back
    /// as `None`; only the log line differs.
    pub async fn read(&self, id: &str) -> Option<Value> {
        let raw = match self.store.find_or_fail(&self.session_id, &fix_id(id)) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                debug!(session_id = %self.session_id, id,
                       "Trying to read non existent session data");
                return None;
            }
            Err(e) => {
                error!(session_id = %self.session_id, id, error = %e,
                       "An error occurred during session read");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(session_id = %self.session_id, id, error = %e,
                       "An error occurred during session read");
                None
            }
        }
    }

    /// Delete a payload if present. Store errors are logged, never raised.
    pub async fn delete(&self, id: &str) {
        match self.store.delete(&self.session_id, &fix_id(id)) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(session_id = %self.session_id, id, error = %e,
                       "An error occurred during session delete");
            }
        }
    }

    /// Read the persisted identity credentials, or synthesize a fresh
    /// default identity. The synthesized identity is not persisted until
    /// the first credential update is saved.
    pub async fn load_or_init(&self) -> AuthCreds {
        match self.read(CREDS_ID).await {
            Some(value) => match serde_json::from_value(value) {
                Ok(creds) => creds,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e,
                          "Persisted credentials are unreadable, starting fresh");
                    AuthCreds::generate()
                }
            },
            None => AuthCreds::generate(),
        }
    }
}

/// Key-material accessor backed by a [`CredStore`].
struct StoreKeyStore {
    creds: Arc<CredStore>,
}

#[async_trait::async_trait]
impl SignalKeyStore for StoreKeyStore {
    async fn get(&self, kind: SignalKeyKind, ids: &[String]) -> HashMap<String, Option<Value>> {
        let lookups = ids.iter().map(|id| {
            let creds = Arc::clone(&self.creds);
            let id = id.clone();
            async move {
                let mut value = creds.read(&format!("{}-{}", kind.as_str(), id)).await;
                if kind == SignalKeyKind::AppStateSyncKey {
                    value = value.and_then(|v| decode_app_state_sync_key(&creds.session_id, v));
                }
                (id, value)
            }
        });
        join_all(lookups).await.into_iter().collect()
    }

    async fn set(&self, data: SignalDataSet) {
        let mut tasks = Vec::new();
        for (kind, items) in data {
            for (id, value) in items {
                let creds = Arc::clone(&self.creds);
                let item_id = format!("{}-{}", kind.as_str(), id);
                tasks.push(async move {
                    match value {
                        Some(value) => creds.write(&value, &item_id).await,
                        None => creds.delete(&item_id).await,
                    }
                });
            }
        }
        join_all(tasks).await;
    }
}

/// App-state sync keys are persisted as loose JSON but handed to the
/// socket in their typed shape; anything that fails to decode reads as
/// absent.
fn decode_app_state_sync_key(session_id: &str, value: Value) -> Option<Value> {
    match serde_json::from_value::<AppStateSyncKeyData>(value) {
        Ok(typed) => serde_json::to_value(typed).ok(),
        Err(e) => {
            warn!(session_id, error = %e, "Discarding undecodable app-state sync key");
            None
        }
    }
}

/// Build the authentication aggregate for one session.
///
/// Reconstructed fresh on every connect attempt so the store stays the
/// single source of truth. Returns the backing [`CredStore`] alongside so
/// credential updates can be persisted through the same normalization.
pub async fn use_store_auth_state(
    store: Arc<SessionStore>,
    session_id: &str,
) -> (AuthState, Arc<CredStore>) {
    let creds_store = CredStore::new(store, session_id);
    let creds = creds_store.load_or_init().await;
    let keys: Arc<dyn SignalKeyStore> = Arc::new(StoreKeyStore {
        creds: Arc::clone(&creds_store),
    });
    (AuthState { creds, keys }, creds_store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_fix_id_normalizes_store_unsafe_characters() {
        assert_eq!(fix_id("session-a/b:c"), "session-a__b-c");
        assert_eq!(fix_id("plain"), "plain");
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrips_unsafe_item_ids() {
        let creds = CredStore::new(store(), "s1");
        creds.write(&json!({"k": 1}), "session-abc/def:1.0").await;

        let value = creds.read("session-abc/def:1.0").await;
        assert_eq!(value, Some(json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_read_absent_returns_none() {
        let creds = CredStore::new(store(), "s1");
        assert_eq!(creds.read("missing").await, None);
        // Deleting something absent is also not an error
        creds.delete("missing").await;
    }

    #[tokio::test]
    async fn test_load_or_init_synthesizes_and_does_not_persist() {
        let backing = store();
        let creds = CredStore::new(Arc::clone(&backing), "s1");

        let fresh = creds.load_or_init().await;
        assert!(fresh.me.is_none());
        // Nothing was written yet
        assert!(backing.find_or_fail("s1", CREDS_ID).is_err());

        // An explicit save makes it durable
        creds.write(&fresh, CREDS_ID).await;
        let loaded = creds.load_or_init().await;
        assert_eq!(loaded, fresh);
    }

    #[tokio::test]
    async fn test_batched_get_returns_exactly_requested_ids() {
        let (state, creds) = use_store_auth_state(store(), "s1").await;
        creds.write(&json!("v-a"), "session-a").await;
        creds.write(&json!("v-c"), "session-c").await;

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let got = state.keys.get(SignalKeyKind::Session, &ids).await;

        assert_eq!(got.len(), 3);
        assert_eq!(got["a"], Some(json!("v-a")));
        assert_eq!(got["b"], None);
        assert_eq!(got["c"], Some(json!("v-c")));
    }

    #[tokio::test]
    async fn test_batched_set_writes_and_deletes() {
        let (state, creds) = use_store_auth_state(store(), "s1").await;
        creds.write(&json!("stale"), "pre-key-1").await;

        let mut items = HashMap::new();
        items.insert("1".to_string(), None);
        items.insert("2".to_string(), Some(json!("fresh")));
        let mut dataset: SignalDataSet = HashMap::new();
        dataset.insert(SignalKeyKind::PreKey, items);
        state.keys.set(dataset).await;

        let got = state
            .keys
            .get(SignalKeyKind::PreKey, &["1".to_string(), "2".to_string()])
            .await;
        assert_eq!(got["1"], None);
        assert_eq!(got["2"], Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_app_state_sync_key_is_decoded_on_read() {
        let (state, creds) = use_store_auth_state(store(), "s1").await;
        creds
            .write(
                &json!({"keyData": "AAA=", "timestamp": 7, "unknownField": true}),
                "app-state-sync-key-k1",
            )
            .await;

        let got = state
            .keys
            .get(SignalKeyKind::AppStateSyncKey, &["k1".to_string()])
            .await;
        let value = got["k1"].as_ref().expect("key should resolve");
        assert_eq!(value["keyData"], json!("AAA="));
        assert_eq!(value["timestamp"], json!(7));
        // Decoding projects onto the typed shape
        assert!(value.get("unknownField").is_none());
    }
}
