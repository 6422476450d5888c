use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use nostr::{Keys, PublicKey};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::RelayError,
    events::{RelayEvent, RelayEventBus, RelayEventListener, RelayListChange},
    feed::{QueryCache, QueryMatch},
    models::{Config, RelayList, RelayPermission, RelayStatus},
    persist::{PersistedRelayList, RelayStore, SessionOverrides, SessionRelayDefaults, StoreScope},
    publisher::RelayListPublisher,
    supervisor::{ConnectionState, ConnectionSupervisor},
    url::RelayUrl,
};

struct RegistryState {
    identity: Option<PublicKey>,
    list: RelayList,
    /// `list` is a session overlay and must not be persisted as is
    session_overlay: bool,
}

/// Source of truth for the configured relays of the loaded identity.
///
/// Several registries may live in one process. They share storage and an
/// event bus, and apply each other's changes as they are broadcast.
pub struct RelayRegistry {
    instance_id: String,
    config: Config,
    store: Arc<dyn RelayStore>,
    session: Arc<SessionOverrides>,
    bus: Arc<RelayEventBus>,
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Arc<RelayListPublisher>,
    query_cache: Option<Arc<dyn QueryCache>>,
    state: RwLock<RegistryState>,
    /// Serializes the mutating operations of this instance
    ops: Mutex<()>,
    listener_id: Mutex<Option<String>>,
    shutdown_sender: watch::Sender<()>,
}

impl RelayRegistry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        store: Arc<dyn RelayStore>,
        session: Arc<SessionOverrides>,
        bus: Arc<RelayEventBus>,
        supervisor: Arc<ConnectionSupervisor>,
        publisher: Arc<RelayListPublisher>,
        query_cache: Option<Arc<dyn QueryCache>>,
        shutdown_sender: watch::Sender<()>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            config,
            store,
            session,
            bus,
            supervisor,
            publisher,
            query_cache,
            state: RwLock::new(RegistryState {
                identity: None,
                list: RelayList::new(),
                session_overlay: false,
            }),
            ops: Mutex::new(()),
            listener_id: Mutex::new(None),
            shutdown_sender,
        }
    }

    pub(crate) async fn subscribe(self: &Arc<Self>) {
        let id = self
            .bus
            .add_listener(Box::new(RegistrySyncListener {
                registry: Arc::downgrade(self),
            }))
            .await;
        *self.listener_id.lock().await = Some(id);
    }

    pub(crate) fn start_health_checks(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let period = self.config.health_check_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_receiver.changed() => {
                        info!("Relay health check loop shutdown signal received");
                        return;
                    }
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            return;
                        };
                        registry.check_health().await;
                    }
                }
            }
        });
    }

    /// Stops the health check loop and detaches from the event bus. Pending
    /// relay list broadcasts are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
        if let Some(id) = self.listener_id.lock().await.take() {
            self.bus.remove_listener(&id).await;
        }
        self.publisher.cancel().await;
        info!("Relay registry {} shut down", self.instance_id);
    }

    /// Loads the relay list of `identity`, or the global list when logged out,
    /// and brings the connections in line with it.
    ///
    /// A user without a record of their own gets a copy of the global record.
    /// With nothing persisted, or unreadable data, the default relays are
    /// used without being written back.
    pub async fn load(&self, identity: Option<PublicKey>) {
        let _guard = self.ops.lock().await;
        self.load_inner(identity).await;
    }

    async fn load_inner(&self, identity: Option<PublicKey>) {
        let (list, session_overlay) = self.resolve_list(identity).await;
        let previous = {
            let mut state = self.state.write().await;
            state.identity = identity;
            state.session_overlay = session_overlay;
            std::mem::replace(&mut state.list, list.clone())
        };
        debug!(
            "Loaded {} relays for {}",
            list.len(),
            StoreScope::for_identity(identity).key()
        );
        self.reconcile_connections(&previous, &list).await;
    }

    /// Returns the list to show for `identity` and whether it is a session
    /// overlay.
    async fn resolve_list(&self, identity: Option<PublicKey>) -> (RelayList, bool) {
        if let Some(session) = self.session.get().await {
            let persisted = self.read_persisted(identity).await;
            return (session.overlay(persisted.as_ref()), true);
        }
        (self.durable_list(identity).await, false)
    }

    /// The account's own list, ignoring session overrides.
    async fn durable_list(&self, identity: Option<PublicKey>) -> RelayList {
        match self.read_persisted(identity).await {
            Some(persisted) => persisted.into_relay_list(),
            None => self.config.default_relay_list(),
        }
    }

    async fn read_persisted(&self, identity: Option<PublicKey>) -> Option<PersistedRelayList> {
        let scope = StoreScope::for_identity(identity);
        match self.store.get_relay_list(scope).await {
            Ok(Some(persisted)) => Some(persisted),
            Ok(None) if scope != StoreScope::Global => self.migrate_from_global(scope).await,
            Ok(None) => None,
            Err(e) => {
                error!(
                    "Failed to read relay list for {}, using defaults: {e}",
                    scope.key()
                );
                None
            }
        }
    }

    async fn migrate_from_global(&self, scope: StoreScope) -> Option<PersistedRelayList> {
        let global = match self.store.get_relay_list(StoreScope::Global).await {
            Ok(global) => global?,
            Err(e) => {
                warn!("Failed to read global relay list: {e}");
                return None;
            }
        };
        match self.store.set_relay_list(scope, global.clone()).await {
            Ok(()) => info!("Copied global relay list to {}", scope.key()),
            Err(e) => error!("Failed to copy global relay list to {}: {e}", scope.key()),
        }
        Some(global)
    }

    /// Reloads the current identity.
    pub async fn reload(&self) {
        let identity = self.identity().await;
        self.load(identity).await;
    }

    /// Adds a relay, `readwrite` unless told otherwise.
    ///
    /// Returns `false` if the relay is already configured.
    pub async fn add(
        &self,
        url: &str,
        permission: Option<RelayPermission>,
    ) -> Result<bool, RelayError> {
        let url = RelayUrl::parse(url)?;
        let permission = permission.unwrap_or_default();

        let guard = self.ops.lock().await;
        let (identity, snapshot, session_overlay) = {
            let mut state = self.state.write().await;
            if !state.list.insert(url.clone(), permission) {
                debug!("Relay {url} is already configured");
                return Ok(false);
            }
            (state.identity, state.list.clone(), state.session_overlay)
        };
        self.persist_change(identity, &snapshot, session_overlay, |own| {
            own.insert(url.clone(), permission);
        })
        .await;
        drop(guard);
        info!("Added relay {url} as {permission}");

        if permission.can_read() {
            self.supervisor.reset_attempts(&url).await;
            self.supervisor.spawn_connect(url.clone(), Duration::ZERO);
        }
        self.emit_change(
            identity,
            RelayListChange::Add {
                url,
                permission,
                relays: snapshot.relays().to_vec(),
                permissions: sorted_permissions(&snapshot),
            },
        )
        .await;
        self.publisher.schedule(snapshot).await;
        Ok(true)
    }

    /// Removes a relay, closing its connection.
    ///
    /// Returns `false` if the relay was not configured.
    pub async fn remove(&self, url: &str) -> Result<bool, RelayError> {
        let url = RelayUrl::parse(url)?;

        let guard = self.ops.lock().await;
        let (identity, snapshot, session_overlay) = {
            let mut state = self.state.write().await;
            if !state.list.remove(&url) {
                return Ok(false);
            }
            (state.identity, state.list.clone(), state.session_overlay)
        };
        self.supervisor.forget(&url).await;
        self.persist_change(identity, &snapshot, session_overlay, |own| {
            own.remove(&url);
        })
        .await;
        drop(guard);
        info!("Removed relay {url}");

        self.publisher.schedule(snapshot).await;
        Ok(true)
    }

    /// Moves a relay to the next permission of the cycle and returns it, or
    /// `None` if the relay is not configured.
    pub async fn cycle_permission(&self, url: &str) -> Result<Option<RelayPermission>, RelayError> {
        let url = RelayUrl::parse(url)?;

        let guard = self.ops.lock().await;
        let (identity, snapshot, next, session_overlay) = {
            let mut state = self.state.write().await;
            let Some(current) = state.list.permission(&url) else {
                return Ok(None);
            };
            let next = current.next();
            state.list.set_permission(&url, next);
            (
                state.identity,
                state.list.clone(),
                next,
                state.session_overlay,
            )
        };
        // The overlay picks up the account's own permission for session relays
        self.persist_change(identity, &snapshot, session_overlay, |own| {
            own.set_permission_entry(&url, next);
        })
        .await;
        drop(guard);
        info!("Relay {url} is now {next}");

        if next.can_read() {
            self.supervisor.reset_attempts(&url).await;
            self.supervisor.spawn_connect(url, Duration::ZERO);
        } else {
            self.supervisor.disconnect(&url).await;
        }
        self.publisher.schedule(snapshot).await;
        Ok(Some(next))
    }

    /// Replaces the list with the default relays, dropping session overrides
    /// and every attempt counter.
    pub async fn restore_defaults(&self) {
        let guard = self.ops.lock().await;
        self.session.clear().await;
        let defaults = self.config.default_relay_list();
        let (identity, previous) = {
            let mut state = self.state.write().await;
            state.session_overlay = false;
            (
                state.identity,
                std::mem::replace(&mut state.list, defaults.clone()),
            )
        };
        self.persist(identity, &defaults).await;
        self.supervisor.reset_all_attempts().await;
        drop(guard);
        info!("Restored {} default relays", defaults.len());

        self.reconcile_connections(&previous, &defaults).await;
        self.emit_change(
            identity,
            RelayListChange::SetDefaults {
                relays: defaults.relays().to_vec(),
                permissions: sorted_permissions(&defaults),
            },
        )
        .await;
        self.publisher.schedule(defaults).await;
    }

    /// Deletes everything persisted for the loaded identity and empties the
    /// list. Nothing is announced to the network.
    pub async fn clear(&self) {
        let _guard = self.ops.lock().await;
        let identity = {
            let mut state = self.state.write().await;
            state.list = RelayList::new();
            state.session_overlay = false;
            state.identity
        };
        let scope = StoreScope::for_identity(identity);
        if let Err(e) = self.store.delete_relay_list(scope).await {
            error!("Failed to delete relay list for {}: {e}", scope.key());
        }
        self.publisher.cancel().await;
        self.supervisor.forget_all().await;
        info!("Cleared relays for {}", scope.key());
    }

    /// Restarts the connect sequence of a read relay from a clean counter.
    ///
    /// Returns `false` if the relay is not configured for reading.
    pub async fn reconnect(&self, url: &str) -> Result<bool, RelayError> {
        let url = RelayUrl::parse(url)?;
        let can_read = self
            .state
            .read()
            .await
            .list
            .permission(&url)
            .is_some_and(RelayPermission::can_read);
        if !can_read {
            debug!("Not reconnecting {url}, it is not a read relay");
            return Ok(false);
        }

        self.supervisor.reset_attempts(&url).await;
        self.supervisor.spawn_connect(url, Duration::ZERO);
        Ok(true)
    }

    /// Loads another identity and tells the other registries to follow.
    pub async fn switch_identity(&self, identity: Option<PublicKey>) {
        if self
            .publisher
            .signer_public_key()
            .await
            .is_some_and(|pk| Some(pk) != identity)
        {
            self.publisher.set_signer(None).await;
        }
        self.publisher.cancel().await;
        self.load(identity).await;
        self.bus.emit(&RelayEvent::RelayReload { identity }).await;
    }

    /// Enables publishing with `keys` and loads their relay list.
    pub async fn sign_in(&self, keys: Keys) {
        let identity = keys.public_key();
        self.publisher.set_signer(Some(keys)).await;
        self.switch_identity(Some(identity)).await;
    }

    pub async fn sign_out(&self) {
        self.publisher.set_signer(None).await;
        self.publisher.cancel().await;
        self.session.clear().await;
        self.load(None).await;
        info!("Signed out");
        self.bus.emit(&RelayEvent::SignOut).await;
    }

    /// Installs relay defaults for the rest of the session, e.g. the relay
    /// list of an account that was opened with its public key only.
    pub async fn set_session_defaults(&self, list: &RelayList) {
        self.session
            .set(SessionRelayDefaults::from_relay_list(list))
            .await;
        self.reload().await;
        self.bus.emit(&RelayEvent::SessionRelayDefaultsUpdated).await;
    }

    /// Runs one health check and returns whether a recovery was started.
    ///
    /// After a recovery the query cache is invalidated once the reconnects had
    /// time to land, so consumers refetch.
    pub async fn check_health(&self) -> bool {
        let (configured, read_relays) = {
            let state = self.state.read().await;
            (state.list.len(), state.list.read_relays())
        };
        if !self
            .supervisor
            .check_health(configured, &read_relays, self.config.recovery_stagger())
            .await
        {
            return false;
        }

        if let Some(cache) = self.query_cache.clone() {
            let delay = self.config.recovery_invalidate_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = cache.invalidate_queries(&QueryMatch::All).await {
                    warn!("Failed to invalidate queries after recovery: {e}");
                }
            });
        }
        true
    }

    pub async fn identity(&self) -> Option<PublicKey> {
        self.state.read().await.identity
    }

    pub async fn relay_list(&self) -> RelayList {
        self.state.read().await.list.clone()
    }

    pub async fn relay_urls(&self) -> Vec<RelayUrl> {
        self.state.read().await.list.relays().to_vec()
    }

    pub async fn permission(&self, url: &RelayUrl) -> Option<RelayPermission> {
        self.state.read().await.list.permission(url)
    }

    pub async fn permissions(&self) -> HashMap<RelayUrl, RelayPermission> {
        self.state
            .read()
            .await
            .list
            .entries()
            .map(|(url, permission)| (url.clone(), permission))
            .collect()
    }

    pub async fn read_relays(&self) -> Vec<RelayUrl> {
        self.state.read().await.list.read_relays()
    }

    pub async fn write_relays(&self) -> Vec<RelayUrl> {
        self.state.read().await.list.write_relays()
    }

    /// One status per configured relay, in list order.
    pub async fn statuses(&self) -> Vec<RelayStatus> {
        let entries: Vec<(RelayUrl, RelayPermission)> = self
            .state
            .read()
            .await
            .list
            .entries()
            .map(|(url, permission)| (url.clone(), permission))
            .collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for (url, permission) in entries {
            let connected = self.supervisor.is_connected(&url).await;
            statuses.push(RelayStatus::new(url, permission, connected));
        }
        statuses
    }

    pub async fn can_publish(&self) -> bool {
        self.publisher.can_sign().await
    }

    /// Persists a mutation of the loaded list.
    ///
    /// While a session overlay is loaded only the account's own record is
    /// written, with `change` applied to it, so session relays never reach
    /// durable storage.
    async fn persist_change(
        &self,
        identity: Option<PublicKey>,
        snapshot: &RelayList,
        session_overlay: bool,
        change: impl FnOnce(&mut RelayList) + Send,
    ) {
        if !session_overlay {
            self.persist(identity, snapshot).await;
            return;
        }
        let mut own = self.durable_list(identity).await;
        change(&mut own);
        self.persist(identity, &own).await;
    }

    async fn persist(&self, identity: Option<PublicKey>, list: &RelayList) {
        let scope = StoreScope::for_identity(identity);
        if let Err(e) = self
            .store
            .set_relay_list(scope, PersistedRelayList::from_relay_list(list))
            .await
        {
            error!("Failed to persist relay list for {}: {e}", scope.key());
        }
    }

    async fn emit_change(&self, identity: Option<PublicKey>, change: RelayListChange) {
        self.bus
            .emit(&RelayEvent::RelayListChanged {
                origin: self.instance_id.clone(),
                identity,
                change,
            })
            .await;
    }

    /// Closes relays that are gone or no longer readable and connects the
    /// read relays that are not connected yet.
    async fn reconcile_connections(&self, previous: &RelayList, next: &RelayList) {
        for url in previous.relays() {
            if !next.contains(url) {
                self.supervisor.forget(url).await;
            }
        }

        let mut to_connect = Vec::new();
        for (url, permission) in next.entries() {
            let state = self.supervisor.connection(url).await.map(|c| c.state);
            if permission.can_read() {
                if matches!(state, None | Some(ConnectionState::Disconnected)) {
                    to_connect.push(url.clone());
                }
            } else if matches!(
                state,
                Some(ConnectionState::Connected | ConnectionState::Attempting)
            ) {
                self.supervisor.disconnect(url).await;
            }
        }

        if !to_connect.is_empty() {
            self.supervisor
                .connect_staggered(to_connect, self.config.connect_stagger())
                .await;
        }
    }

    async fn apply_remote(&self, identity: Option<PublicKey>, change: RelayListChange) {
        let (previous, next) = {
            let mut state = self.state.write().await;
            if state.identity != identity {
                return;
            }
            let next = match change {
                RelayListChange::Add {
                    url,
                    relays,
                    permissions,
                    ..
                } => {
                    if state.list.contains(&url) {
                        return;
                    }
                    RelayList::from_parts(relays, permissions.into_iter().collect())
                }
                RelayListChange::SetDefaults {
                    relays,
                    permissions,
                } => {
                    state.session_overlay = false;
                    RelayList::from_parts(relays, permissions.into_iter().collect())
                }
            };
            let previous = std::mem::replace(&mut state.list, next.clone());
            (previous, next)
        };
        debug!("Applied relay list change from another registry");
        self.reconcile_connections(&previous, &next).await;
    }
}

fn sorted_permissions(list: &RelayList) -> BTreeMap<RelayUrl, RelayPermission> {
    list.permissions()
        .iter()
        .map(|(url, permission)| (url.clone(), *permission))
        .collect()
}

/// Applies the broadcasts of other registries to one registry.
struct RegistrySyncListener {
    registry: Weak<RelayRegistry>,
}

#[async_trait]
impl RelayEventListener for RegistrySyncListener {
    async fn on_event(&self, event: RelayEvent) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match event {
            RelayEvent::RelayListChanged {
                origin,
                identity,
                change,
            } => {
                if origin == registry.instance_id {
                    return;
                }
                registry.apply_remote(identity, change).await;
            }
            RelayEvent::RelayReload { identity } => {
                if registry.identity().await != identity {
                    registry.load(identity).await;
                }
            }
            RelayEvent::SessionRelayDefaultsUpdated => registry.reload().await,
            RelayEvent::SignOut => {
                registry.publisher.set_signer(None).await;
                registry.publisher.cancel().await;
                if registry.identity().await.is_some() {
                    registry.load(None).await;
                }
            }
        }
    }
}
