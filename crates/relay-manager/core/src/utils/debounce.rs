use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};

/// Delays a task until a quiet period has passed since the last call to
/// [`Debouncer::schedule`].
///
/// Holds a single pending slot: scheduling always cancels and replaces the
/// task waiting there, so at most one task is pending at any time. Once the
/// quiet period elapses the task is detached from the slot and runs to
/// completion even if a newer task is scheduled meanwhile.
pub(crate) struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
        }
    }

    pub async fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let current = Arc::clone(&self.generation);
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            tokio::spawn(task);
        }));
    }

    /// Drops the pending task, if any.
    pub async fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = self.pending.lock().await.take() {
            previous.abort();
        }
    }

    pub async fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_quiet_period() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        debouncer
            .schedule(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(debouncer.is_pending().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_collapse_to_last() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let last = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        for value in 1..=5 {
            let last = Arc::clone(&last);
            let runs = Arc::clone(&runs);
            debouncer
                .schedule(async move {
                    last.store(value, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_task() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        debouncer
            .schedule(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        debouncer.cancel().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
