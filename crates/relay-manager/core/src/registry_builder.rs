use std::sync::Arc;

use nostr::{Keys, PublicKey};
use tokio::sync::watch;

use crate::{
    error::RelayError,
    events::{RelayEventBus, global_bus},
    feed::QueryCache,
    models::Config,
    persist::{RelayStore, SessionOverrides, global_session_overrides},
    pool::RelayPool,
    publisher::RelayListPublisher,
    registry::RelayRegistry,
    supervisor::ConnectionSupervisor,
};

/// Builder for creating `RelayRegistry` instances with customizable components.
pub struct RegistryBuilder {
    config: Config,
    store: Arc<dyn RelayStore>,
    pool: Arc<dyn RelayPool>,
    bus: Option<Arc<RelayEventBus>>,
    session: Option<Arc<SessionOverrides>>,
    query_cache: Option<Arc<dyn QueryCache>>,
    identity: Option<PublicKey>,
    signer: Option<Keys>,
}

impl RegistryBuilder {
    /// Creates a new `RegistryBuilder`.
    /// Arguments:
    /// - `config`: The configuration to be used.
    /// - `store`: Durable storage of the relay lists.
    /// - `pool`: The connection pool relays are connected through.
    pub fn new(config: Config, store: Arc<dyn RelayStore>, pool: Arc<dyn RelayPool>) -> Self {
        RegistryBuilder {
            config,
            store,
            pool,
            bus: None,
            session: None,
            query_cache: None,
            identity: None,
            signer: None,
        }
    }

    /// Sets the event bus shared with other registries. Defaults to the
    /// process-wide bus.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<RelayEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the session override store shared with other registries.
    /// Defaults to the process-wide store.
    #[must_use]
    pub fn with_session_overrides(mut self, session: Arc<SessionOverrides>) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the query cache invalidated after a connectivity recovery.
    #[must_use]
    pub fn with_query_cache(mut self, query_cache: Arc<dyn QueryCache>) -> Self {
        self.query_cache = Some(query_cache);
        self
    }

    /// Sets the identity loaded on build. Logged out when unset.
    #[must_use]
    pub fn with_identity(mut self, identity: Option<PublicKey>) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the keys used to sign relay list announcements. Implies the
    /// identity of the keys.
    #[must_use]
    pub fn with_signer(mut self, keys: Keys) -> Self {
        self.identity = Some(keys.public_key());
        self.signer = Some(keys);
        self
    }

    /// Builds the registry, loads its identity and starts its health checks.
    pub async fn build(self) -> Result<Arc<RelayRegistry>, RelayError> {
        self.config.validate()?;

        let bus = self.bus.unwrap_or_else(global_bus);
        let session = self.session.unwrap_or_else(global_session_overrides);
        let supervisor = Arc::new(ConnectionSupervisor::new(self.pool.clone(), &self.config));
        let publisher = Arc::new(RelayListPublisher::new(self.pool, &self.config));
        if let Some(keys) = self.signer {
            publisher.set_signer(Some(keys)).await;
        }
        let (shutdown_sender, _) = watch::channel::<()>(());

        let registry = Arc::new(RelayRegistry::new(
            self.config,
            self.store,
            session,
            bus,
            supervisor,
            publisher,
            self.query_cache,
            shutdown_sender,
        ));
        registry.subscribe().await;
        registry.load(self.identity).await;
        registry.start_health_checks();
        Ok(registry)
    }
}
