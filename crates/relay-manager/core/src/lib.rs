mod error;
mod events;
mod feed;
mod logger;
mod models;
mod persist;
mod pool;
mod publisher;
mod registry;
mod registry_builder;
mod supervisor;
mod url;
mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::RelayError;
pub use events::{
    RelayEvent, RelayEventBus, RelayEventListener, RelayListChange, global_bus, init_global_bus,
    shutdown_global_bus,
};
pub use feed::{
    CacheError, FeedFilter, FeedFilterReconciler, FeedSignOutListener, FeedState, FilterChange,
    LoadingIndicators, QueryCache, QueryKey, QueryMatch,
};
pub use logger::init_logging;
pub use models::*;
pub use persist::{
    FeedIndexStore, FeedIndices, MemoryStorage, PersistedPermissions, PersistedRelayList,
    RelayStore, SessionOverrides, SessionRelayDefaults, SqliteStorage, StorageError, StoreScope,
    global_session_overrides,
};
pub use pool::{NostrRelayPool, PoolError, RelayPool};
pub use publisher::{PublishOutcome, RelayListPublisher, SkipReason};
pub use registry::RelayRegistry;
pub use registry_builder::RegistryBuilder;
pub use supervisor::{ConnectionState, ConnectionSupervisor, RelayConnection};
pub use url::{RelayUrl, normalize};

#[cfg(feature = "test-utils")]
pub use persist::tests as storage_tests;
