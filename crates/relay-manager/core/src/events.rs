use core::fmt;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use nostr::PublicKey;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{models::RelayPermission, url::RelayUrl};

/// A relay list mutation announced to the other registries of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RelayListChange {
    /// A relay was added. Carries the full list after the change.
    Add {
        url: RelayUrl,
        permission: RelayPermission,
        relays: Vec<RelayUrl>,
        permissions: BTreeMap<RelayUrl, RelayPermission>,
    },
    /// The list was replaced by the defaults.
    SetDefaults {
        relays: Vec<RelayUrl>,
        permissions: BTreeMap<RelayUrl, RelayPermission>,
    },
}

/// Events exchanged between registries and the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RelayEvent {
    RelayListChanged {
        /// Instance id of the registry that made the change
        origin: String,
        identity: Option<PublicKey>,
        change: RelayListChange,
    },
    /// Registries bound to `identity` must reload their list from storage
    RelayReload { identity: Option<PublicKey> },
    SessionRelayDefaultsUpdated,
    SignOut,
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::RelayListChanged { origin, change, .. } => match change {
                RelayListChange::Add { url, permission, .. } => {
                    write!(f, "RelayListChanged({origin}): add {url} as {permission}")
                }
                RelayListChange::SetDefaults { relays, .. } => {
                    write!(f, "RelayListChanged({origin}): {} defaults", relays.len())
                }
            },
            RelayEvent::RelayReload { identity } => match identity {
                Some(pk) => write!(f, "RelayReload: {pk}"),
                None => write!(f, "RelayReload: logged out"),
            },
            RelayEvent::SessionRelayDefaultsUpdated => write!(f, "SessionRelayDefaultsUpdated"),
            RelayEvent::SignOut => write!(f, "SignOut"),
        }
    }
}

/// Trait for event listeners
#[async_trait]
pub trait RelayEventListener: Send + Sync {
    /// Called when an event occurs
    async fn on_event(&self, event: RelayEvent);
}

/// In-process broadcast channel between registry instances.
///
/// Delivery is synchronous: [`RelayEventBus::emit`] returns once every
/// listener registered at the time of the call has handled the event.
pub struct RelayEventBus {
    listener_index: AtomicU64,
    listeners: RwLock<BTreeMap<String, Arc<dyn RelayEventListener>>>,
}

impl RelayEventBus {
    pub fn new() -> Self {
        Self {
            listener_index: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a listener to receive events
    ///
    /// # Returns
    ///
    /// A unique identifier for the listener, which can be used to remove it later
    pub async fn add_listener(&self, listener: Box<dyn RelayEventListener>) -> String {
        let index = self.listener_index.fetch_add(1, Ordering::Relaxed);
        let id = format!("listener_{}-{}", index, Uuid::new_v4());
        let mut listeners = self.listeners.write().await;
        listeners.insert(id.clone(), Arc::from(listener));
        id
    }

    /// Remove a listener by its ID
    ///
    /// Returns `true` if the listener was found and removed
    pub async fn remove_listener(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write().await;
        listeners.remove(id).is_some()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Emit an event to all registered listeners
    pub async fn emit(&self, event: &RelayEvent) {
        // Listeners may emit in turn, so they are called on a snapshot
        let listeners: Vec<Arc<dyn RelayEventListener>> =
            self.listeners.read().await.values().cloned().collect();

        for listener in listeners {
            listener.on_event(event.clone()).await;
        }
    }
}

impl Default for RelayEventBus {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_BUS: std::sync::RwLock<Option<Arc<RelayEventBus>>> = std::sync::RwLock::new(None);

/// Returns the process-wide bus, creating it on first use.
///
/// Registries built without an explicit bus share this one. It lives until
/// [`shutdown_global_bus`] is called.
pub fn global_bus() -> Arc<RelayEventBus> {
    if let Some(bus) = GLOBAL_BUS.read().ok().and_then(|bus| bus.clone()) {
        return bus;
    }
    init_global_bus()
}

/// Installs the process-wide bus if none exists and returns it.
pub fn init_global_bus() -> Arc<RelayEventBus> {
    let mut guard = match GLOBAL_BUS.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard
        .get_or_insert_with(|| Arc::new(RelayEventBus::new()))
        .clone()
}

/// Drops the process-wide bus. Registries keep the handle they already hold;
/// the next [`global_bus`] call creates a fresh bus.
pub fn shutdown_global_bus() {
    let mut guard = match GLOBAL_BUS.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.take();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Mutex;

    use super::*;

    struct RecordingListener {
        received: Arc<Mutex<Vec<RelayEvent>>>,
    }

    #[async_trait]
    impl RelayEventListener for RecordingListener {
        async fn on_event(&self, event: RelayEvent) {
            self.received.lock().await.push(event);
        }
    }

    struct ReentrantListener {
        bus: Arc<RelayEventBus>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RelayEventListener for ReentrantListener {
        async fn on_event(&self, event: RelayEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if event == RelayEvent::SessionRelayDefaultsUpdated {
                self.bus.emit(&RelayEvent::SignOut).await;
            }
        }
    }

    #[tokio::test]
    async fn test_event_emission() {
        let bus = RelayEventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        bus.add_listener(Box::new(RecordingListener {
            received: received.clone(),
        }))
        .await;

        bus.emit(&RelayEvent::SignOut).await;

        assert_eq!(*received.lock().await, vec![RelayEvent::SignOut]);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let bus = RelayEventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let id = bus
            .add_listener(Box::new(RecordingListener {
                received: received.clone(),
            }))
            .await;
        assert!(id.starts_with("listener_0-"));

        assert!(bus.remove_listener(&id).await);
        assert!(!bus.remove_listener(&id).await);
        bus.emit(&RelayEvent::SignOut).await;
        assert!(received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_listener_can_emit_while_handling() {
        let bus = Arc::new(RelayEventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_listener(Box::new(ReentrantListener {
            bus: bus.clone(),
            calls: calls.clone(),
        }))
        .await;

        bus.emit(&RelayEvent::SessionRelayDefaultsUpdated).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_bus_is_shared_until_shutdown() {
        let first = global_bus();
        assert!(Arc::ptr_eq(&first, &global_bus()));

        shutdown_global_bus();
        let second = global_bus();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
