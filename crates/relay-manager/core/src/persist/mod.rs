pub(crate) mod sqlite;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    models::{RelayList, RelayPermission},
    url::RelayUrl,
};

pub use sqlite::SqliteStorage;

/// Errors that can occur during storage operations
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("Underline implementation error: {0}")]
    Implementation(String),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitializationError(String),

    #[error("Failed to serialize/deserialize data: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Which relay configuration a record belongs to.
///
/// Signed-in users get their own slot keyed by public key. Logged-out
/// sessions, and users that never had a configuration of their own, read the
/// global slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScope {
    Global,
    Identity(PublicKey),
}

impl StoreScope {
    pub fn for_identity(identity: Option<PublicKey>) -> Self {
        identity.map_or(StoreScope::Global, StoreScope::Identity)
    }

    pub(crate) fn key(&self) -> String {
        match self {
            StoreScope::Global => "global".to_string(),
            StoreScope::Identity(pk) => pk.to_hex(),
        }
    }
}

/// Permissions as they are written to durable storage.
///
/// Old clients stored a plain array of relay URLs meaning "these relays are
/// write relays"; it is still accepted on read but never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistedPermissions {
    Map(BTreeMap<String, RelayPermission>),
    Legacy(Vec<String>),
}

impl Default for PersistedPermissions {
    fn default() -> Self {
        PersistedPermissions::Map(BTreeMap::new())
    }
}

/// A relay configuration as persisted for one [`StoreScope`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRelayList {
    pub relays: Vec<String>,
    pub permissions: PersistedPermissions,
}

impl PersistedRelayList {
    pub fn from_relay_list(list: &RelayList) -> Self {
        Self {
            relays: list.relays().iter().map(ToString::to_string).collect(),
            permissions: PersistedPermissions::Map(
                list.permissions()
                    .iter()
                    .map(|(url, permission)| (url.to_string(), *permission))
                    .collect(),
            ),
        }
    }

    /// Explicit permission entries, normalized. Legacy arrays map to `write`.
    pub fn explicit_permissions(&self) -> HashMap<RelayUrl, RelayPermission> {
        match &self.permissions {
            PersistedPermissions::Map(map) => map
                .iter()
                .filter_map(|(url, permission)| Some((parse_stored_url(url)?, *permission)))
                .collect(),
            PersistedPermissions::Legacy(write_relays) => write_relays
                .iter()
                .filter_map(|url| Some((parse_stored_url(url)?, RelayPermission::Write)))
                .collect(),
        }
    }

    /// Converts into the in-memory list, dropping entries that fail to normalize.
    ///
    /// With the legacy format, relays missing from the write array are read relays.
    pub fn into_relay_list(self) -> RelayList {
        let mut permissions = self.explicit_permissions();
        let relays: Vec<RelayUrl> = self
            .relays
            .iter()
            .filter_map(|url| parse_stored_url(url))
            .collect();
        if matches!(self.permissions, PersistedPermissions::Legacy(_)) {
            for url in &relays {
                permissions
                    .entry(url.clone())
                    .or_insert(RelayPermission::Read);
            }
        }
        RelayList::from_parts(relays, permissions)
    }
}

fn parse_stored_url(url: &str) -> Option<RelayUrl> {
    match RelayUrl::parse(url) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Skipping stored relay {url}: {e}");
            None
        }
    }
}

/// Persisted pagination window of the feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedIndices {
    pub start: usize,
    pub end: usize,
}

/// Durable per-identity relay configuration
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn get_relay_list(
        &self,
        scope: StoreScope,
    ) -> Result<Option<PersistedRelayList>, StorageError>;

    async fn set_relay_list(
        &self,
        scope: StoreScope,
        list: PersistedRelayList,
    ) -> Result<(), StorageError>;

    async fn delete_relay_list(&self, scope: StoreScope) -> Result<(), StorageError>;
}

/// Durable pagination indices of the feed
#[async_trait]
pub trait FeedIndexStore: Send + Sync {
    async fn get_feed_indices(&self) -> Result<Option<FeedIndices>, StorageError>;
    async fn set_feed_indices(&self, indices: FeedIndices) -> Result<(), StorageError>;
    async fn clear_feed_indices(&self) -> Result<(), StorageError>;
}

/// In-memory storage, lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    relay_lists: RwLock<HashMap<StoreScope, PersistedRelayList>>,
    feed_indices: RwLock<Option<FeedIndices>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayStore for MemoryStorage {
    async fn get_relay_list(
        &self,
        scope: StoreScope,
    ) -> Result<Option<PersistedRelayList>, StorageError> {
        Ok(self.relay_lists.read().await.get(&scope).cloned())
    }

    async fn set_relay_list(
        &self,
        scope: StoreScope,
        list: PersistedRelayList,
    ) -> Result<(), StorageError> {
        self.relay_lists.write().await.insert(scope, list);
        Ok(())
    }

    async fn delete_relay_list(&self, scope: StoreScope) -> Result<(), StorageError> {
        self.relay_lists.write().await.remove(&scope);
        Ok(())
    }
}

#[async_trait]
impl FeedIndexStore for MemoryStorage {
    async fn get_feed_indices(&self) -> Result<Option<FeedIndices>, StorageError> {
        Ok(*self.feed_indices.read().await)
    }

    async fn set_feed_indices(&self, indices: FeedIndices) -> Result<(), StorageError> {
        *self.feed_indices.write().await = Some(indices);
        Ok(())
    }

    async fn clear_feed_indices(&self) -> Result<(), StorageError> {
        *self.feed_indices.write().await = None;
        Ok(())
    }
}

/// Relay defaults installed for the current session only, e.g. for a
/// public-key-only login. Never written to durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRelayDefaults {
    pub relays: Vec<String>,
    pub permissions: BTreeMap<String, RelayPermission>,
}

impl SessionRelayDefaults {
    pub fn from_relay_list(list: &RelayList) -> Self {
        Self {
            relays: list.relays().iter().map(ToString::to_string).collect(),
            permissions: list
                .entries()
                .map(|(url, permission)| (url.to_string(), permission))
                .collect(),
        }
    }

    /// Applies the session defaults on top of a persisted configuration.
    ///
    /// The relay set comes from the session defaults. A relay keeps the
    /// permission the account persisted for it, otherwise it takes the session
    /// default permission.
    pub fn overlay(&self, persisted: Option<&PersistedRelayList>) -> RelayList {
        let own = persisted
            .map(PersistedRelayList::explicit_permissions)
            .unwrap_or_default();
        let session_permissions: HashMap<RelayUrl, RelayPermission> = self
            .permissions
            .iter()
            .filter_map(|(url, permission)| Some((parse_stored_url(url)?, *permission)))
            .collect();

        RelayList::from_entries(
            self.relays
                .iter()
                .filter_map(|url| parse_stored_url(url))
                .map(|url| {
                    let permission = own
                        .get(&url)
                        .or_else(|| session_permissions.get(&url))
                        .copied()
                        .unwrap_or_default();
                    (url, permission)
                }),
        )
    }
}

/// Session scoped store for [`SessionRelayDefaults`], shared by every
/// registry of the process.
#[derive(Default)]
pub struct SessionOverrides {
    inner: RwLock<Option<SessionRelayDefaults>>,
}

impl SessionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<SessionRelayDefaults> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, defaults: SessionRelayDefaults) {
        *self.inner.write().await = Some(defaults);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

static GLOBAL_SESSION: LazyLock<Arc<SessionOverrides>> =
    LazyLock::new(|| Arc::new(SessionOverrides::new()));

/// Returns the session store of the process.
///
/// Registries built without an explicit session store share this one, so a
/// `session-relay-defaults-updated` broadcast reloads them all with the same
/// overrides.
pub fn global_session_overrides() -> Arc<SessionOverrides> {
    Arc::clone(&GLOBAL_SESSION)
}
