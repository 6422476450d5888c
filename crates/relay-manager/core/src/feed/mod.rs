mod reconciler;

use core::fmt;

use async_trait::async_trait;
use nostr::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::FeedIndices;

pub use reconciler::{FeedFilterReconciler, FeedSignOutListener, FilterChange};

const FEED_ROOT: &str = "feed";

#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("Query cache error: {0}")]
    Generic(String),
}

/// Hierarchical key of a cached query, e.g. `["feed", "<filter hash>"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(pub Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Prefix shared by every feed query.
    pub fn feed_root() -> Self {
        Self::new([FEED_ROOT])
    }

    pub fn feed(filter_hash: &str) -> Self {
        Self::new([FEED_ROOT, filter_hash])
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Selects the cached queries an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryMatch {
    All,
    Exact(QueryKey),
    Prefix(QueryKey),
    /// Every key under `prefix` other than `except`
    PrefixExcept { prefix: QueryKey, except: QueryKey },
}

impl QueryMatch {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            QueryMatch::All => true,
            QueryMatch::Exact(k) => key == k,
            QueryMatch::Prefix(prefix) => key.starts_with(prefix),
            QueryMatch::PrefixExcept { prefix, except } => {
                key.starts_with(prefix) && key != except
            }
        }
    }
}

/// Opaque async query cache the feed reads through.
///
/// Cancellation is advisory: a fetch already on the wire may still complete,
/// its result is discarded by the remove/reset that follows.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn cancel_queries(&self, target: &QueryMatch) -> Result<(), CacheError>;
    async fn remove_queries(&self, target: &QueryMatch) -> Result<(), CacheError>;
    /// Drops cached data of the matching queries and refetches the active ones.
    async fn reset_queries(&self, target: &QueryMatch) -> Result<(), CacheError>;
    /// Marks the matching queries stale so their consumers refetch.
    async fn invalidate_queries(&self, target: &QueryMatch) -> Result<(), CacheError>;
}

/// Feed-affecting filter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFilter {
    pub show_replies: bool,
    pub show_reposts: bool,
    pub hashtags: Vec<String>,
}

impl FeedFilter {
    /// Summary of the filter combination used to key the cached feed.
    ///
    /// Hashtags are length-prefixed so that no two tag lists share a hash.
    pub fn filter_hash(&self) -> String {
        let hashtags: String = self
            .hashtags
            .iter()
            .map(|tag| format!("{}:{tag}", tag.len()))
            .collect();
        format!(
            "r{}p{}:{hashtags}",
            u8::from(self.show_replies),
            u8::from(self.show_reposts),
        )
    }

    pub fn cache_key(&self) -> QueryKey {
        QueryKey::feed(&self.filter_hash())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadingIndicators {
    pub checking_for_new: bool,
    pub fetching_page: bool,
    pub new_notes_found: u32,
}

/// Visible feed state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedState {
    pub notes: Vec<Event>,
    pub pagination: FeedIndices,
    pub is_initialized: bool,
    pub loading: LoadingIndicators,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_match() {
        let root = QueryKey::feed_root();
        let a = QueryKey::feed("a");
        let b = QueryKey::feed("b");
        let profile = QueryKey::new(["profile", "a"]);

        assert!(QueryMatch::All.matches(&profile));
        assert!(QueryMatch::Exact(a.clone()).matches(&a));
        assert!(!QueryMatch::Exact(a.clone()).matches(&b));
        assert!(QueryMatch::Prefix(root.clone()).matches(&a));
        assert!(QueryMatch::Prefix(root.clone()).matches(&root));
        assert!(!QueryMatch::Prefix(root.clone()).matches(&profile));

        let others = QueryMatch::PrefixExcept {
            prefix: root,
            except: a.clone(),
        };
        assert!(!others.matches(&a));
        assert!(others.matches(&b));
        assert!(!others.matches(&profile));
    }

    #[test]
    fn test_filter_hash_depends_on_hashtag_list() {
        let base = FeedFilter {
            show_replies: true,
            show_reposts: false,
            hashtags: vec!["rust".to_string()],
        };
        let mut other = base.clone();
        assert_eq!(base.cache_key(), other.cache_key());

        other.hashtags.push("nostr".to_string());
        assert_ne!(base.cache_key(), other.cache_key());
        assert!(other.cache_key().starts_with(&QueryKey::feed_root()));
    }

    #[test]
    fn test_filter_hash_keeps_tag_boundaries() {
        let joined = FeedFilter {
            hashtags: vec!["a,b".to_string()],
            ..FeedFilter::default()
        };
        let split = FeedFilter {
            hashtags: vec!["a".to_string(), "b".to_string()],
            ..FeedFilter::default()
        };
        let shifted = FeedFilter {
            hashtags: vec!["1:a".to_string()],
            ..FeedFilter::default()
        };
        let single = FeedFilter {
            hashtags: vec!["a".to_string()],
            ..FeedFilter::default()
        };
        assert_ne!(joined.filter_hash(), split.filter_hash());
        assert_ne!(shifted.filter_hash(), single.filter_hash());
        assert_eq!(split.filter_hash(), "r0p0:1:a1:b");
    }
}
