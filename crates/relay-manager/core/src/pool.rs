use std::time::Duration;

use async_trait::async_trait;
use nostr::Event;
use nostr_sdk::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::url::RelayUrl;

#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("Failed to connect to {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("Failed to publish event: {0}")]
    Publish(String),
}

/// Live socket connections per relay.
///
/// Implementations own the sockets; the supervisor only asks for a relay to be
/// connected or closed and never holds a connection handle itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Ensures a connection to `url` exists, opening one if needed.
    async fn get_connection(&self, url: &RelayUrl) -> Result<(), PoolError>;

    /// Closes the connections to the given relays.
    async fn close(&self, urls: &[RelayUrl]) -> Result<(), PoolError>;

    /// Drops the pool's own bookkeeping of connections that are not live.
    async fn reset_connections(&self) -> Result<(), PoolError>;

    /// Releases resources held for relays that are gone.
    async fn cleanup(&self) -> Result<(), PoolError>;

    /// Sends a signed event to the given relays.
    async fn publish(&self, urls: &[RelayUrl], event: Event) -> Result<(), PoolError>;
}

/// [`RelayPool`] backed by a `nostr-sdk` client.
pub struct NostrRelayPool {
    client: Client,
    connect_timeout: Duration,
}

impl NostrRelayPool {
    pub fn new(client: Client, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }
}

#[async_trait]
impl RelayPool for NostrRelayPool {
    async fn get_connection(&self, url: &RelayUrl) -> Result<(), PoolError> {
        let connection_error = |reason: String| PoolError::Connection {
            url: url.to_string(),
            reason,
        };

        self.client
            .add_relay(url.as_str())
            .await
            .map_err(|e| connection_error(e.to_string()))?;
        self.client
            .try_connect_relay(url.as_str(), self.connect_timeout)
            .await
            .map_err(|e| connection_error(e.to_string()))?;
        debug!("Relay {url} connected");
        Ok(())
    }

    async fn close(&self, urls: &[RelayUrl]) -> Result<(), PoolError> {
        for url in urls {
            if let Err(e) = self.client.remove_relay(url.as_str()).await {
                warn!("Failed to close relay {url}: {e}");
            }
        }
        Ok(())
    }

    async fn reset_connections(&self) -> Result<(), PoolError> {
        let relays = self.client.relays().await;
        for (url, relay) in relays {
            if relay.is_connected() {
                continue;
            }
            debug!("Dropping stale relay {url} from pool");
            if let Err(e) = self.client.force_remove_relay(url.as_str()).await {
                warn!("Failed to drop stale relay {url}: {e}");
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PoolError> {
        let relays = self.client.relays().await;
        for (url, relay) in relays {
            if relay.is_connected() {
                continue;
            }
            if let Err(e) = self.client.disconnect_relay(url.as_str()).await {
                warn!("Failed to disconnect half-open relay {url}: {e}");
            }
        }
        Ok(())
    }

    async fn publish(&self, urls: &[RelayUrl], event: Event) -> Result<(), PoolError> {
        let output = self
            .client
            .send_event_to(urls.iter().map(RelayUrl::as_str), &event)
            .await
            .map_err(|e| PoolError::Publish(e.to_string()))?;

        for (url, reason) in &output.failed {
            warn!("Relay {url} rejected event {}: {reason}", event.id);
        }
        if output.success.is_empty() {
            return Err(PoolError::Publish(format!(
                "no relay accepted event {}",
                event.id
            )));
        }
        Ok(())
    }
}
