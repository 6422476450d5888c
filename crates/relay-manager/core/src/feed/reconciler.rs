use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use nostr::Event;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use super::{CacheError, FeedFilter, FeedState, LoadingIndicators, QueryCache, QueryKey, QueryMatch};
use crate::{
    events::{RelayEvent, RelayEventBus, RelayEventListener},
    models::Config,
    persist::{FeedIndexStore, FeedIndices},
    utils::debounce::Debouncer,
};

/// Outcome of [`FeedFilterReconciler::on_filter_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChange {
    Unchanged,
    /// Recorded, but the feed has not loaded yet so there is nothing to reconcile
    NotInitialized,
    /// The previous query was cancelled and a cache commit is pending
    Scheduled,
}

struct ReconcilerState {
    filter: FeedFilter,
    feed: FeedState,
    last_user_interaction: Option<Instant>,
}

/// Moves the cached, paginated feed from one filter to the next without
/// mixing results of both.
pub struct FeedFilterReconciler {
    cache: Arc<dyn QueryCache>,
    index_store: Arc<dyn FeedIndexStore>,
    state: Mutex<ReconcilerState>,
    commit: Debouncer,
    user_change_window: Duration,
}

impl FeedFilterReconciler {
    pub fn new(
        cache: Arc<dyn QueryCache>,
        index_store: Arc<dyn FeedIndexStore>,
        filter: FeedFilter,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            index_store,
            state: Mutex::new(ReconcilerState {
                filter,
                feed: FeedState::default(),
                last_user_interaction: None,
            }),
            commit: Debouncer::new(config.filter_commit_debounce()),
            user_change_window: config.user_change_window(),
        })
    }

    /// Subscribes the reconciler to sign-out events of `bus`.
    pub async fn attach(self: &Arc<Self>, bus: &RelayEventBus) -> String {
        bus.add_listener(Box::new(FeedSignOutListener {
            reconciler: Arc::downgrade(self),
        }))
        .await
    }

    pub async fn state(&self) -> FeedState {
        self.state.lock().await.feed.clone()
    }

    pub async fn filter(&self) -> FeedFilter {
        self.state.lock().await.filter.clone()
    }

    pub async fn note_user_interaction(&self) {
        self.state.lock().await.last_user_interaction = Some(Instant::now());
    }

    pub async fn mark_initialized(&self) {
        self.state.lock().await.feed.is_initialized = true;
    }

    pub async fn push_notes(&self, notes: Vec<Event>) {
        self.state.lock().await.feed.notes.extend(notes);
    }

    pub async fn set_loading(&self, loading: LoadingIndicators) {
        self.state.lock().await.feed.loading = loading;
    }

    pub async fn set_pagination(&self, pagination: FeedIndices) {
        self.state.lock().await.feed.pagination = pagination;
        if let Err(e) = self.index_store.set_feed_indices(pagination).await {
            warn!("Failed to persist feed indices: {e}");
        }
    }

    /// Restores the pagination window persisted by a previous session.
    pub async fn restore_pagination(&self) {
        match self.index_store.get_feed_indices().await {
            Ok(Some(indices)) => self.state.lock().await.feed.pagination = indices,
            Ok(None) => {}
            Err(e) => warn!("Failed to read feed indices: {e}"),
        }
    }

    /// Handles a new filter selection.
    ///
    /// The query of the previous filter is cancelled right away and the
    /// loading indicators are cleared. The cache transition itself is
    /// debounced; only the last change of a burst is committed.
    pub async fn on_filter_change(self: &Arc<Self>, filter: FeedFilter) -> FilterChange {
        let (previous_key, next_key) = {
            let mut state = self.state.lock().await;
            if state.filter == filter {
                return FilterChange::Unchanged;
            }
            let previous = std::mem::replace(&mut state.filter, filter);
            if !state.feed.is_initialized {
                debug!("Feed filter changed before the initial load");
                return FilterChange::NotInitialized;
            }

            let user_driven = state
                .last_user_interaction
                .is_some_and(|at| at.elapsed() <= self.user_change_window);
            info!(
                "Feed filter changed ({}): {} -> {}",
                if user_driven { "user" } else { "automatic" },
                previous.filter_hash(),
                state.filter.filter_hash()
            );

            state.feed.loading = LoadingIndicators::default();
            (previous.cache_key(), state.filter.cache_key())
        };

        log_cache_error(
            "cancel previous feed query",
            self.cache
                .cancel_queries(&QueryMatch::Exact(previous_key))
                .await,
        );

        let reconciler = Arc::clone(self);
        self.commit
            .schedule(async move { reconciler.commit(next_key).await })
            .await;
        FilterChange::Scheduled
    }

    async fn commit(&self, key: QueryKey) {
        {
            let mut state = self.state.lock().await;
            if state.filter.cache_key() != key {
                debug!("Feed commit for {key} superseded");
                return;
            }
            state.feed.notes.clear();
            state.feed.pagination = FeedIndices::default();
        }
        if let Err(e) = self.index_store.set_feed_indices(FeedIndices::default()).await {
            warn!("Failed to persist feed indices: {e}");
        }

        let root = QueryKey::feed_root();
        log_cache_error(
            "cancel feed queries",
            self.cache
                .cancel_queries(&QueryMatch::Prefix(root.clone()))
                .await,
        );
        log_cache_error(
            "remove stale feed entry",
            self.cache
                .remove_queries(&QueryMatch::Exact(key.clone()))
                .await,
        );
        log_cache_error(
            "remove other feed entries",
            self.cache
                .remove_queries(&QueryMatch::PrefixExcept {
                    prefix: root,
                    except: key.clone(),
                })
                .await,
        );
        log_cache_error(
            "reset feed query",
            self.cache
                .reset_queries(&QueryMatch::Exact(key.clone()))
                .await,
        );
        debug!("Feed committed to {key}");
    }

    /// Drops everything the feed shows or remembers for the signed-out user.
    pub async fn on_sign_out(&self) {
        self.commit.cancel().await;
        {
            let mut state = self.state.lock().await;
            state.feed = FeedState::default();
            state.last_user_interaction = None;
        }
        if let Err(e) = self.index_store.clear_feed_indices().await {
            warn!("Failed to clear feed indices: {e}");
        }
        log_cache_error(
            "invalidate feed queries",
            self.cache
                .invalidate_queries(&QueryMatch::Prefix(QueryKey::feed_root()))
                .await,
        );
        info!("Feed reset after sign out");
    }
}

fn log_cache_error(action: &str, result: Result<(), CacheError>) {
    if let Err(e) = result {
        warn!("Failed to {action}: {e}");
    }
}

/// Bus listener resetting the feed on sign out.
pub struct FeedSignOutListener {
    reconciler: Weak<FeedFilterReconciler>,
}

#[async_trait]
impl RelayEventListener for FeedSignOutListener {
    async fn on_event(&self, event: RelayEvent) {
        if event != RelayEvent::SignOut {
            return;
        }
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler.on_sign_out().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys};

    use super::*;
    use crate::{
        models::default_config,
        persist::MemoryStorage,
        test_utils::{CacheCall, RecordingQueryCache},
    };

    fn filter(replies: bool, hashtags: &[&str]) -> FeedFilter {
        FeedFilter {
            show_replies: replies,
            show_reposts: true,
            hashtags: hashtags.iter().map(ToString::to_string).collect(),
        }
    }

    fn note(content: &str) -> Event {
        EventBuilder::text_note(content)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    async fn initialized_reconciler(
        cache: Arc<RecordingQueryCache>,
        storage: Arc<MemoryStorage>,
    ) -> Arc<FeedFilterReconciler> {
        let reconciler =
            FeedFilterReconciler::new(cache, storage, filter(false, &[]), &default_config());
        reconciler.mark_initialized().await;
        reconciler.push_notes(vec![note("one"), note("two")]).await;
        reconciler
            .set_pagination(FeedIndices { start: 0, end: 40 })
            .await;
        reconciler
            .set_loading(LoadingIndicators {
                checking_for_new: true,
                fetching_page: true,
                new_notes_found: 3,
            })
            .await;
        reconciler
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_filter_is_ignored() {
        let cache = Arc::new(RecordingQueryCache::new());
        let reconciler =
            initialized_reconciler(cache.clone(), Arc::new(MemoryStorage::new())).await;

        assert_eq!(
            reconciler.on_filter_change(filter(false, &[])).await,
            FilterChange::Unchanged
        );
        assert!(cache.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_initial_load_only_records_filter() {
        let cache = Arc::new(RecordingQueryCache::new());
        let reconciler = FeedFilterReconciler::new(
            cache.clone(),
            Arc::new(MemoryStorage::new()),
            filter(false, &[]),
            &default_config(),
        );

        assert_eq!(
            reconciler.on_filter_change(filter(true, &[])).await,
            FilterChange::NotInitialized
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(cache.calls().await.is_empty());
        assert_eq!(reconciler.filter().await, filter(true, &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_cancels_previous_query_immediately() {
        let cache = Arc::new(RecordingQueryCache::new());
        let reconciler =
            initialized_reconciler(cache.clone(), Arc::new(MemoryStorage::new())).await;
        let previous = filter(false, &[]).cache_key();

        assert_eq!(
            reconciler.on_filter_change(filter(true, &[])).await,
            FilterChange::Scheduled
        );

        assert_eq!(
            cache.calls().await,
            vec![CacheCall::Cancel(QueryMatch::Exact(previous))]
        );
        let state = reconciler.state().await;
        assert_eq!(state.loading, LoadingIndicators::default());
        // Notes stay visible until the commit
        assert_eq!(state.notes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_changes_within_window_commit_once() {
        let cache = Arc::new(RecordingQueryCache::new());
        let storage = Arc::new(MemoryStorage::new());
        let reconciler = initialized_reconciler(cache.clone(), storage.clone()).await;
        let first = filter(true, &[]);
        let second = filter(true, &["rust"]);

        reconciler.on_filter_change(first.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        reconciler.on_filter_change(second.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let root = QueryKey::feed_root();
        let key = second.cache_key();
        assert_eq!(
            cache.calls().await,
            vec![
                CacheCall::Cancel(QueryMatch::Exact(filter(false, &[]).cache_key())),
                CacheCall::Cancel(QueryMatch::Exact(first.cache_key())),
                CacheCall::Cancel(QueryMatch::Prefix(root.clone())),
                CacheCall::Remove(QueryMatch::Exact(key.clone())),
                CacheCall::Remove(QueryMatch::PrefixExcept {
                    prefix: root,
                    except: key.clone(),
                }),
                CacheCall::Reset(QueryMatch::Exact(key)),
            ]
        );

        let state = reconciler.state().await;
        assert!(state.notes.is_empty());
        assert_eq!(state.pagination, FeedIndices::default());
        assert!(state.is_initialized);
        assert_eq!(
            storage.get_feed_indices().await.unwrap(),
            Some(FeedIndices::default())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_resets_feed() {
        let cache = Arc::new(RecordingQueryCache::new());
        let storage = Arc::new(MemoryStorage::new());
        let reconciler = initialized_reconciler(cache.clone(), storage.clone()).await;
        let bus = RelayEventBus::new();
        reconciler.attach(&bus).await;

        // A pending commit is dropped by the sign out
        reconciler.on_filter_change(filter(true, &[])).await;
        bus.emit(&RelayEvent::SignOut).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let state = reconciler.state().await;
        assert!(state.notes.is_empty());
        assert!(!state.is_initialized);
        assert_eq!(state.pagination, FeedIndices::default());
        assert_eq!(storage.get_feed_indices().await.unwrap(), None);

        let calls = cache.calls().await;
        assert_eq!(
            calls.last(),
            Some(&CacheCall::Invalidate(QueryMatch::Prefix(
                QueryKey::feed_root()
            )))
        );
        assert!(!calls.iter().any(|c| matches!(c, CacheCall::Reset(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_failures_do_not_stop_commit() {
        let cache = Arc::new(RecordingQueryCache::new());
        cache.fail_all(true);
        let reconciler =
            initialized_reconciler(cache.clone(), Arc::new(MemoryStorage::new())).await;

        reconciler.on_filter_change(filter(true, &[])).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(cache.calls().await.len(), 5);
        assert!(reconciler.state().await.notes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_pagination() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set_feed_indices(FeedIndices { start: 10, end: 30 })
            .await
            .unwrap();
        let reconciler = FeedFilterReconciler::new(
            Arc::new(RecordingQueryCache::new()),
            storage,
            FeedFilter::default(),
            &default_config(),
        );

        reconciler.restore_pagination().await;
        assert_eq!(
            reconciler.state().await.pagination,
            FeedIndices { start: 10, end: 30 }
        );
    }
}
