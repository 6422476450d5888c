use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{error::RelayError, url::RelayUrl};

/// What the client allows itself to do with a relay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RelayPermission {
    Read,
    Write,
    #[default]
    #[serde(alias = "read_write", alias = "both")]
    #[strum(to_string = "readwrite", serialize = "both")]
    ReadWrite,
    Indexer,
}

impl RelayPermission {
    /// The relay is used for queries.
    pub fn can_read(self) -> bool {
        matches!(self, RelayPermission::Read | RelayPermission::ReadWrite)
    }

    /// The relay receives published events.
    pub fn can_write(self) -> bool {
        matches!(
            self,
            RelayPermission::Write | RelayPermission::ReadWrite | RelayPermission::Indexer
        )
    }

    /// Next permission in the `read -> write -> readwrite -> indexer -> read` cycle.
    pub fn next(self) -> Self {
        match self {
            RelayPermission::Read => RelayPermission::Write,
            RelayPermission::Write => RelayPermission::ReadWrite,
            RelayPermission::ReadWrite => RelayPermission::Indexer,
            RelayPermission::Indexer => RelayPermission::Read,
        }
    }
}

/// Observable state of one registered relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub url: RelayUrl,
    pub connected: bool,
    pub read: bool,
    pub write: bool,
}

impl RelayStatus {
    pub(crate) fn new(url: RelayUrl, permission: RelayPermission, connected: bool) -> Self {
        Self {
            url,
            connected,
            read: permission.can_read(),
            write: permission.can_write(),
        }
    }
}

/// Ordered set of relays together with their permissions.
///
/// Each normalized URL appears at most once in `relays`. `permissions` may keep
/// stale entries for relays that were removed from the list by an older writer;
/// a relay without an entry is treated as `readwrite`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    relays: Vec<RelayUrl>,
    permissions: HashMap<RelayUrl, RelayPermission>,
}

impl RelayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (RelayUrl, RelayPermission)>,
    {
        let mut list = Self::new();
        for (url, permission) in entries {
            list.insert(url, permission);
        }
        list
    }

    /// Builds a list from a relay order and a permission map that may carry
    /// entries for relays outside of `relays`.
    pub(crate) fn from_parts(
        relays: impl IntoIterator<Item = RelayUrl>,
        permissions: HashMap<RelayUrl, RelayPermission>,
    ) -> Self {
        let mut ordered: Vec<RelayUrl> = Vec::new();
        for url in relays {
            if !ordered.contains(&url) {
                ordered.push(url);
            }
        }
        Self {
            relays: ordered,
            permissions,
        }
    }

    pub fn relays(&self) -> &[RelayUrl] {
        &self.relays
    }

    pub fn permissions(&self) -> &HashMap<RelayUrl, RelayPermission> {
        &self.permissions
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn contains(&self, url: &RelayUrl) -> bool {
        self.relays.contains(url)
    }

    /// Permission of a listed relay, `None` if the relay is not in the list.
    pub fn permission(&self, url: &RelayUrl) -> Option<RelayPermission> {
        if !self.contains(url) {
            return None;
        }
        Some(self.permissions.get(url).copied().unwrap_or_default())
    }

    /// Appends a relay. Returns `false` if it was already listed.
    pub fn insert(&mut self, url: RelayUrl, permission: RelayPermission) -> bool {
        if self.contains(&url) {
            return false;
        }
        self.permissions.insert(url.clone(), permission);
        self.relays.push(url);
        true
    }

    /// Removes a relay and its permission. Returns `false` if it was not listed.
    pub fn remove(&mut self, url: &RelayUrl) -> bool {
        let before = self.relays.len();
        self.relays.retain(|r| r != url);
        self.permissions.remove(url);
        self.relays.len() != before
    }

    pub fn set_permission(&mut self, url: &RelayUrl, permission: RelayPermission) -> bool {
        if !self.contains(url) {
            return false;
        }
        self.permissions.insert(url.clone(), permission);
        true
    }

    /// Records a permission for `url` whether it is listed or not.
    pub(crate) fn set_permission_entry(&mut self, url: &RelayUrl, permission: RelayPermission) {
        self.permissions.insert(url.clone(), permission);
    }

    /// Listed relays paired with their effective permission, in list order.
    pub fn entries(&self) -> impl Iterator<Item = (&RelayUrl, RelayPermission)> {
        self.relays
            .iter()
            .map(|url| (url, self.permissions.get(url).copied().unwrap_or_default()))
    }

    pub fn read_relays(&self) -> Vec<RelayUrl> {
        self.entries()
            .filter(|(_, p)| p.can_read())
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn write_relays(&self) -> Vec<RelayUrl> {
        self.entries()
            .filter(|(_, p)| p.can_write())
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Default relay entry, kept as plain strings so it can live in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRelay {
    pub url: String,
    pub permission: RelayPermission,
}

/// Relay manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relays used when nothing is persisted and after "restore defaults"
    pub default_relays: Vec<DefaultRelay>,
    /// Consecutive failed connects after which a relay is left disconnected
    pub max_connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    /// Delay increment between queued connect requests
    pub connect_stagger_ms: u64,
    /// Delay increment between connect requests issued by a health check recovery
    pub recovery_stagger_ms: u64,
    pub health_check_interval_secs: u64,
    /// Delay between a health check recovery and the cache invalidation that follows it
    pub recovery_invalidate_delay_ms: u64,
    /// Quiet period before the relay list is announced to the network
    pub publish_debounce_ms: u64,
    /// Quiet period before a feed filter change is committed to the query cache
    pub filter_commit_debounce_ms: u64,
    /// Filter changes this close to a user interaction are classified as user driven
    pub user_change_window_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_connect_attempts == 0 {
            return Err(RelayError::InvalidConfig(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "health_check_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_relay_list(&self) -> RelayList {
        RelayList::from_entries(self.default_relays.iter().filter_map(|relay| {
            match RelayUrl::parse(&relay.url) {
                Ok(url) => Some((url, relay.permission)),
                Err(e) => {
                    tracing::warn!("Ignoring invalid default relay {}: {e}", relay.url);
                    None
                }
            }
        }))
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_stagger(&self) -> Duration {
        Duration::from_millis(self.connect_stagger_ms)
    }

    pub fn recovery_stagger(&self) -> Duration {
        Duration::from_millis(self.recovery_stagger_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn recovery_invalidate_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_invalidate_delay_ms)
    }

    pub fn publish_debounce(&self) -> Duration {
        Duration::from_millis(self.publish_debounce_ms)
    }

    pub fn filter_commit_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_commit_debounce_ms)
    }

    pub fn user_change_window(&self) -> Duration {
        Duration::from_millis(self.user_change_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        default_config()
    }
}

pub const DEFAULT_RELAYS: [(&str, RelayPermission); 5] = [
    ("wss://relay.damus.io", RelayPermission::ReadWrite),
    ("wss://nos.lol", RelayPermission::ReadWrite),
    ("wss://relay.primal.net", RelayPermission::ReadWrite),
    ("wss://relay.nostr.band", RelayPermission::Read),
    ("wss://purplepag.es", RelayPermission::Indexer),
];

pub fn default_config() -> Config {
    Config {
        default_relays: DEFAULT_RELAYS
            .iter()
            .map(|(url, permission)| DefaultRelay {
                url: (*url).to_string(),
                permission: *permission,
            })
            .collect(),
        max_connect_attempts: 3,
        connect_retry_delay_ms: 2_000,
        connect_stagger_ms: 100,
        recovery_stagger_ms: 200,
        health_check_interval_secs: 30,
        recovery_invalidate_delay_ms: 1_500,
        publish_debounce_ms: 3_000,
        filter_commit_debounce_ms: 300,
        user_change_window_ms: 2_000,
        connect_timeout_secs: 10,
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, l: LogEntry);
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub line: String,
    pub level: String,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn test_cycle_closes_after_four_steps() {
        for start in [
            RelayPermission::Read,
            RelayPermission::Write,
            RelayPermission::ReadWrite,
            RelayPermission::Indexer,
        ] {
            assert_eq!(start.next().next().next().next(), start);
        }
        assert_eq!(RelayPermission::ReadWrite.next(), RelayPermission::Indexer);
    }

    #[test]
    fn test_permission_capabilities() {
        assert!(RelayPermission::Read.can_read());
        assert!(!RelayPermission::Read.can_write());
        assert!(!RelayPermission::Write.can_read());
        assert!(RelayPermission::ReadWrite.can_read() && RelayPermission::ReadWrite.can_write());
        assert!(!RelayPermission::Indexer.can_read());
        assert!(RelayPermission::Indexer.can_write());
    }

    #[test]
    fn test_permission_string_forms() {
        assert_eq!(RelayPermission::ReadWrite.to_string(), "readwrite");
        assert_eq!(
            RelayPermission::from_str("Indexer").unwrap(),
            RelayPermission::Indexer
        );
        assert_eq!(
            serde_json::from_str::<RelayPermission>(r#""readwrite""#).unwrap(),
            RelayPermission::ReadWrite
        );
        assert_eq!(
            serde_json::to_string(&RelayPermission::Write).unwrap(),
            r#""write""#
        );
    }

    #[test]
    fn test_relay_list_rejects_duplicates() {
        let mut list = RelayList::new();
        assert!(list.insert(url("relay.example.com"), RelayPermission::ReadWrite));
        assert!(!list.insert(url("wss://relay.example.com/"), RelayPermission::Read));
        assert_eq!(list.len(), 1);
        assert_eq!(
            list.permission(&url("relay.example.com")),
            Some(RelayPermission::ReadWrite)
        );
    }

    #[test]
    fn test_relay_list_read_and_write_sets() {
        let list = RelayList::from_entries([
            (url("a.relay"), RelayPermission::Read),
            (url("b.relay"), RelayPermission::Write),
            (url("c.relay"), RelayPermission::ReadWrite),
            (url("d.relay"), RelayPermission::Indexer),
        ]);
        assert_eq!(list.read_relays(), vec![url("a.relay"), url("c.relay")]);
        assert_eq!(
            list.write_relays(),
            vec![url("b.relay"), url("c.relay"), url("d.relay")]
        );
    }

    #[test]
    fn test_relay_list_remove_drops_permission() {
        let mut list = RelayList::from_entries([(url("a.relay"), RelayPermission::Read)]);
        assert!(list.remove(&url("a.relay")));
        assert!(!list.remove(&url("a.relay")));
        assert!(list.permissions().is_empty());
        assert_eq!(list.permission(&url("a.relay")), None);
    }

    #[test]
    fn test_default_config_relays_parse() {
        let config = default_config();
        let list = config.default_relay_list();
        assert_eq!(list.len(), DEFAULT_RELAYS.len());
        assert_eq!(
            list.permission(&url("purplepag.es")),
            Some(RelayPermission::Indexer)
        );
        assert_eq!(config.connect_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_config_is_rejected() {
        let config = Config {
            health_check_interval_secs: 0,
            ..default_config()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfig(_))
        ));
    }
}
