use std::sync::Arc;

use nostr::{EventBuilder, EventId, Keys, PublicKey, nips::nip65::RelayMetadata};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    models::{Config, RelayList, RelayPermission},
    pool::RelayPool,
    url::RelayUrl,
    utils::debounce::Debouncer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The session cannot sign, e.g. a public-key-only login
    NoSigner,
    NoWriteRelays,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Skipped(SkipReason),
    Published {
        event_id: EventId,
        relays: Vec<RelayUrl>,
    },
    Failed(String),
}

/// Announces the relay list of the signed-in user to its write relays.
///
/// Publishing is best effort: every failure is logged and reported through
/// [`PublishOutcome`], never as an error.
pub struct RelayListPublisher {
    pool: Arc<dyn RelayPool>,
    signer: RwLock<Option<Keys>>,
    debouncer: Debouncer,
}

impl RelayListPublisher {
    pub fn new(pool: Arc<dyn RelayPool>, config: &Config) -> Self {
        Self {
            pool,
            signer: RwLock::new(None),
            debouncer: Debouncer::new(config.publish_debounce()),
        }
    }

    pub async fn set_signer(&self, keys: Option<Keys>) {
        *self.signer.write().await = keys;
    }

    pub async fn can_sign(&self) -> bool {
        self.signer.read().await.is_some()
    }

    pub async fn signer_public_key(&self) -> Option<PublicKey> {
        self.signer.read().await.as_ref().map(Keys::public_key)
    }

    /// Schedules a broadcast of `list` after the quiet period, replacing any
    /// broadcast still waiting.
    pub async fn schedule(self: &Arc<Self>, list: RelayList) {
        let publisher = Arc::clone(self);
        self.debouncer
            .schedule(async move {
                publisher.broadcast(&list).await;
            })
            .await;
    }

    /// Drops a scheduled broadcast.
    pub async fn cancel(&self) {
        self.debouncer.cancel().await;
    }

    pub async fn is_pending(&self) -> bool {
        self.debouncer.is_pending().await
    }

    pub async fn broadcast(&self, list: &RelayList) -> PublishOutcome {
        let Some(keys) = self.signer.read().await.clone() else {
            debug!("No signer available, skipping relay list broadcast");
            return PublishOutcome::Skipped(SkipReason::NoSigner);
        };

        let write_relays = list.write_relays();
        if write_relays.is_empty() {
            warn!("No write relays configured, skipping relay list broadcast");
            return PublishOutcome::Skipped(SkipReason::NoWriteRelays);
        }

        let event = match EventBuilder::relay_list(relay_list_entries(list))
            .sign_with_keys(&keys)
        {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to sign relay list: {e}");
                return PublishOutcome::Failed(e.to_string());
            }
        };
        let event_id = event.id;

        match self.pool.publish(&write_relays, event).await {
            Ok(()) => {
                info!(
                    "Published relay list {event_id} to {} relays",
                    write_relays.len()
                );
                PublishOutcome::Published {
                    event_id,
                    relays: write_relays,
                }
            }
            Err(e) => {
                warn!("Failed to publish relay list: {e}");
                PublishOutcome::Failed(e.to_string())
            }
        }
    }
}

fn relay_metadata(permission: RelayPermission) -> Option<RelayMetadata> {
    match permission {
        RelayPermission::ReadWrite => None,
        RelayPermission::Read => Some(RelayMetadata::Read),
        RelayPermission::Write | RelayPermission::Indexer => Some(RelayMetadata::Write),
    }
}

/// NIP-65 entries for every listed relay that `nostr` accepts as a URL.
fn relay_list_entries(list: &RelayList) -> Vec<(nostr::RelayUrl, Option<RelayMetadata>)> {
    list.entries()
        .filter_map(|(url, permission)| match nostr::RelayUrl::try_from(url) {
            Ok(relay_url) => Some((relay_url, relay_metadata(permission))),
            Err(e) => {
                warn!("Leaving {url} out of the relay list: {e}");
                None
            }
        })
        .collect()
}
