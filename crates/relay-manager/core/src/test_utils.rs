use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use nostr::Event;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    feed::{CacheError, QueryCache, QueryMatch},
    pool::{PoolError, RelayPool},
    url::RelayUrl,
};

/// Scriptable in-memory [`RelayPool`]. Every relay connects unless told to
/// fail.
#[derive(Default)]
pub struct FakeRelayPool {
    /// `None` fails forever, `Some(n)` fails the next `n` attempts
    failures: Mutex<HashMap<RelayUrl, Option<u32>>>,
    connect_log: Mutex<Vec<(RelayUrl, Instant)>>,
    closed: Mutex<Vec<RelayUrl>>,
    published: Mutex<Vec<(Vec<RelayUrl>, Event)>>,
    fail_publish: AtomicBool,
    resets: AtomicUsize,
    cleanups: AtomicUsize,
}

impl FakeRelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail(&self, url: &RelayUrl) {
        self.failures.lock().await.insert(url.clone(), None);
    }

    pub async fn fail_times(&self, url: &RelayUrl, times: u32) {
        self.failures.lock().await.insert(url.clone(), Some(times));
    }

    pub async fn heal(&self, url: &RelayUrl) {
        self.failures.lock().await.remove(url);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Relays passed to `get_connection`, in call order.
    pub async fn connect_log(&self) -> Vec<RelayUrl> {
        self.connect_log
            .lock()
            .await
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Relays passed to `get_connection` together with the time of the call.
    pub async fn connect_times(&self) -> Vec<(RelayUrl, Instant)> {
        self.connect_log.lock().await.clone()
    }

    pub async fn connect_calls(&self, url: &RelayUrl) -> usize {
        self.connect_log
            .lock()
            .await
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    pub async fn clear_log(&self) {
        self.connect_log.lock().await.clear();
        self.closed.lock().await.clear();
    }

    pub async fn closed(&self) -> Vec<RelayUrl> {
        self.closed.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<(Vec<RelayUrl>, Event)> {
        self.published.lock().await.clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayPool for FakeRelayPool {
    async fn get_connection(&self, url: &RelayUrl) -> Result<(), PoolError> {
        self.connect_log
            .lock()
            .await
            .push((url.clone(), Instant::now()));

        let mut failures = self.failures.lock().await;
        let fails = match failures.get_mut(url) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                failures.remove(url);
                false
            }
            Some(Some(remaining)) => {
                *remaining = remaining.saturating_sub(1);
                true
            }
        };
        if fails {
            return Err(PoolError::Connection {
                url: url.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self, urls: &[RelayUrl]) -> Result<(), PoolError> {
        self.closed.lock().await.extend_from_slice(urls);
        Ok(())
    }

    async fn reset_connections(&self) -> Result<(), PoolError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PoolError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, urls: &[RelayUrl], event: Event) -> Result<(), PoolError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(PoolError::Publish("scripted failure".to_string()));
        }
        self.published.lock().await.push((urls.to_vec(), event));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCall {
    Cancel(QueryMatch),
    Remove(QueryMatch),
    Reset(QueryMatch),
    Invalidate(QueryMatch),
}

/// [`QueryCache`] that records every call in order.
#[derive(Default)]
pub struct RecordingQueryCache {
    calls: Mutex<Vec<CacheCall>>,
    fail: AtomicBool,
}

impl RecordingQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail after being recorded.
    pub fn fail_all(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<CacheCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }

    async fn record(&self, call: CacheCall) -> Result<(), CacheError> {
        self.calls.lock().await.push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Generic("scripted failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryCache for RecordingQueryCache {
    async fn cancel_queries(&self, target: &QueryMatch) -> Result<(), CacheError> {
        self.record(CacheCall::Cancel(target.clone())).await
    }

    async fn remove_queries(&self, target: &QueryMatch) -> Result<(), CacheError> {
        self.record(CacheCall::Remove(target.clone())).await
    }

    async fn reset_queries(&self, target: &QueryMatch) -> Result<(), CacheError> {
        self.record(CacheCall::Reset(target.clone())).await
    }

    async fn invalidate_queries(&self, target: &QueryMatch) -> Result<(), CacheError> {
        self.record(CacheCall::Invalidate(target.clone())).await
    }
}
