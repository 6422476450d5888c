use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{models::Config, pool::RelayPool, url::RelayUrl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Attempting,
    Connected,
}

/// Connection bookkeeping for a single relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayConnection {
    pub state: ConnectionState,
    /// Consecutive failed attempts of the current connect sequence
    pub attempts: u32,
    /// Bumped by every connect or disconnect request; a connect sequence stops
    /// as soon as it no longer owns the current generation.
    generation: u64,
}

enum Step {
    Connected,
    Retry(u32),
    GaveUp(u32),
    Superseded { close: bool },
}

/// Keeps read relays connected with bounded retries.
pub struct ConnectionSupervisor {
    pool: Arc<dyn RelayPool>,
    max_attempts: u32,
    retry_delay: Duration,
    relays: Mutex<HashMap<RelayUrl, RelayConnection>>,
}

impl ConnectionSupervisor {
    pub fn new(pool: Arc<dyn RelayPool>, config: &Config) -> Self {
        Self {
            pool,
            max_attempts: config.max_connect_attempts.max(1),
            retry_delay: config.connect_retry_delay(),
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Runs a connect sequence for `url` and returns whether it ended connected.
    ///
    /// A failed attempt is retried after the retry delay until the attempt
    /// counter reaches the maximum, then the relay stays disconnected until the
    /// next external trigger. The sequence is abandoned early when a newer
    /// connect or disconnect request for the same relay supersedes it.
    pub async fn connect(&self, url: &RelayUrl) -> bool {
        let generation = {
            let mut relays = self.relays.lock().await;
            let entry = relays.entry(url.clone()).or_default();
            if entry.state == ConnectionState::Connected {
                return true;
            }
            if entry.attempts >= self.max_attempts {
                entry.attempts = 0;
            }
            entry.generation = entry.generation.wrapping_add(1);
            entry.state = ConnectionState::Attempting;
            entry.generation
        };

        loop {
            let result = self.pool.get_connection(url).await;

            let step = {
                let mut relays = self.relays.lock().await;
                match relays.get_mut(url) {
                    None => Step::Superseded { close: true },
                    Some(entry) if entry.generation != generation => Step::Superseded {
                        close: entry.state == ConnectionState::Disconnected,
                    },
                    Some(entry) => match &result {
                        Ok(()) => {
                            entry.state = ConnectionState::Connected;
                            entry.attempts = 0;
                            Step::Connected
                        }
                        Err(_) => {
                            entry.attempts = entry.attempts.saturating_add(1);
                            if entry.attempts >= self.max_attempts {
                                entry.state = ConnectionState::Disconnected;
                                Step::GaveUp(entry.attempts)
                            } else {
                                Step::Retry(entry.attempts)
                            }
                        }
                    },
                }
            };

            match (step, result) {
                (Step::Connected, _) => {
                    info!("Connected to relay {url}");
                    return true;
                }
                (Step::Superseded { close }, result) => {
                    debug!("Connect sequence for {url} was superseded");
                    // A disconnect raced with this attempt, do not leave the socket open
                    if close && result.is_ok() {
                        if let Err(e) = self.pool.close(std::slice::from_ref(url)).await {
                            warn!("Failed to close relay {url}: {e}");
                        }
                    }
                    return false;
                }
                (Step::GaveUp(attempts), Err(e)) => {
                    warn!("Giving up on relay {url} after {attempts} attempts: {e}");
                    return false;
                }
                (Step::Retry(attempts), Err(e)) => {
                    debug!(
                        "Connect attempt {attempts} to {url} failed, retrying in {:?}: {e}",
                        self.retry_delay
                    );
                }
                (_, Ok(())) => return false,
            }

            tokio::time::sleep(self.retry_delay).await;

            let relays = self.relays.lock().await;
            match relays.get(url) {
                Some(entry) if entry.generation == generation => {}
                _ => return false,
            }
        }
    }

    /// Starts a connect sequence in the background after `delay`.
    pub fn spawn_connect(self: &Arc<Self>, url: RelayUrl, delay: Duration) -> JoinHandle<bool> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            supervisor.connect(&url).await
        })
    }

    /// Connects to every relay in `urls`, relays with fewer prior failures
    /// first, spacing the requests `stagger` apart.
    pub async fn connect_staggered(
        self: &Arc<Self>,
        urls: Vec<RelayUrl>,
        stagger: Duration,
    ) -> Vec<JoinHandle<bool>> {
        let ordered = {
            let relays = self.relays.lock().await;
            let mut ordered: Vec<(u32, RelayUrl)> = urls
                .into_iter()
                .map(|url| (relays.get(&url).map_or(0, |c| c.attempts), url))
                .collect();
            ordered.sort_by_key(|(attempts, _)| *attempts);
            ordered
        };

        let mut delay = Duration::ZERO;
        let mut handles = Vec::with_capacity(ordered.len());
        for (_, url) in ordered {
            handles.push(self.spawn_connect(url, delay));
            delay = delay.saturating_add(stagger);
        }
        handles
    }

    /// Closes the connection to `url` and marks it disconnected, cancelling
    /// any connect sequence in flight.
    pub async fn disconnect(&self, url: &RelayUrl) {
        {
            let mut relays = self.relays.lock().await;
            let entry = relays.entry(url.clone()).or_default();
            entry.generation = entry.generation.wrapping_add(1);
            entry.state = ConnectionState::Disconnected;
        }

        if let Err(e) = self.pool.close(std::slice::from_ref(url)).await {
            warn!("Failed to close relay {url}: {e}");
        }
    }

    /// Disconnects `url` if needed and drops all bookkeeping for it.
    pub async fn forget(&self, url: &RelayUrl) {
        let previous = self.relays.lock().await.remove(url);
        if previous.is_some_and(|c| c.state != ConnectionState::Disconnected) {
            if let Err(e) = self.pool.close(std::slice::from_ref(url)).await {
                warn!("Failed to close relay {url}: {e}");
            }
        }
    }

    /// Forgets every relay, closing the open connections.
    pub async fn forget_all(&self) {
        let previous: Vec<(RelayUrl, RelayConnection)> =
            self.relays.lock().await.drain().collect();
        let open: Vec<RelayUrl> = previous
            .into_iter()
            .filter(|(_, c)| c.state != ConnectionState::Disconnected)
            .map(|(url, _)| url)
            .collect();
        if open.is_empty() {
            return;
        }
        if let Err(e) = self.pool.close(&open).await {
            warn!("Failed to close relays: {e}");
        }
    }

    pub async fn reset_attempts(&self, url: &RelayUrl) {
        if let Some(entry) = self.relays.lock().await.get_mut(url) {
            entry.attempts = 0;
        }
    }

    pub async fn reset_all_attempts(&self) {
        for entry in self.relays.lock().await.values_mut() {
            entry.attempts = 0;
        }
    }

    pub async fn connection(&self, url: &RelayUrl) -> Option<RelayConnection> {
        self.relays.lock().await.get(url).copied()
    }

    pub async fn is_connected(&self, url: &RelayUrl) -> bool {
        self.connection(url)
            .await
            .is_some_and(|c| c.state == ConnectionState::Connected)
    }

    pub async fn connected_count(&self, urls: &[RelayUrl]) -> usize {
        let relays = self.relays.lock().await;
        urls.iter()
            .filter(|url| {
                relays
                    .get(*url)
                    .is_some_and(|c| c.state == ConnectionState::Connected)
            })
            .count()
    }

    /// Detects the stuck state where read relays are configured but none of
    /// them is connected, and recovers from it.
    ///
    /// Recovery clears every attempt counter, lets the pool drop its own stale
    /// bookkeeping and reconnects all read relays `stagger` apart. Returns
    /// whether a recovery was started.
    pub async fn check_health(
        self: &Arc<Self>,
        configured: usize,
        read_relays: &[RelayUrl],
        stagger: Duration,
    ) -> bool {
        // Without read relays there is nothing to reconnect
        if configured == 0
            || read_relays.is_empty()
            || self.connected_count(read_relays).await > 0
        {
            return false;
        }

        warn!(
            "No read relay connected out of {configured} configured, resetting connections"
        );
        self.reset_all_attempts().await;
        {
            let mut relays = self.relays.lock().await;
            for url in read_relays {
                if let Some(entry) = relays.get_mut(url) {
                    entry.state = ConnectionState::Disconnected;
                }
            }
        }
        if let Err(e) = self.pool.cleanup().await {
            warn!("Relay pool cleanup failed: {e}");
        }
        if let Err(e) = self.pool.reset_connections().await {
            warn!("Relay pool reset failed: {e}");
        }

        self.connect_staggered(read_relays.to_vec(), stagger).await;
        true
    }
}
