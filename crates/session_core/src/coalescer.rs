use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error};

use shared::domain::SessionKey;

/// Receiver of coalesced flush requests; reads the current in-memory state
/// for the key and persists it.
#[async_trait]
pub trait FlushTarget: Send + Sync {
    async fn flush(&self, key: SessionKey) -> Result<()>;
}

/// Per-key flush state machine: absent = idle, `Pending` = debounce timer
/// armed, `Flushing` = write in flight (`dirty` records a re-trigger).
enum PendingFlush {
    Pending { generation: u64 },
    Flushing { dirty: bool },
}

/// Debounces and serializes persistence of mutable session state.
///
/// Guarantees at most one in-flight flush per key; bursts of `schedule`
/// calls within the debounce window collapse into a single flush that
/// reflects the state at flush time.
pub struct FlushCoalescer {
    target: Arc<dyn FlushTarget>,
    debounce: Duration,
    entries: Mutex<HashMap<SessionKey, PendingFlush>>,
}

impl FlushCoalescer {
    pub fn new(target: Arc<dyn FlushTarget>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            target,
            debounce,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Requests a flush for `key`, (re)starting its debounce timer. If a
    /// flush for the key is already in flight, marks it dirty instead so
    /// exactly one follow-up flush runs after the current one completes.
    pub async fn schedule(self: &Arc<Self>, key: SessionKey) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key)
            .and_modify(|entry| {
                // Restart the window; the superseded timer sees a stale
                // generation when it fires and backs off.
                if let PendingFlush::Pending { generation } = entry {
                    *generation += 1;
                }
            })
            .or_insert(PendingFlush::Pending { generation: 0 });
        match entry {
            PendingFlush::Flushing { dirty } => *dirty = true,
            PendingFlush::Pending { generation } => self.spawn_timer(key, *generation),
        }
    }

    /// Bypasses the debounce window and flushes now, honoring the same
    /// single-writer discipline. If a flush is already in flight this marks
    /// it dirty and returns; otherwise it awaits the write.
    pub async fn force_flush(self: &Arc<Self>, key: SessionKey) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(PendingFlush::Flushing { dirty }) = entries.get_mut(&key) {
                *dirty = true;
                return;
            }
            // Idle or debounce-pending: claim the writer slot now. A timer
            // that was armed finds the slot gone and backs off.
            entries.insert(key, PendingFlush::Flushing { dirty: false });
        }
        self.run_flushes(key).await;
    }

    /// Drops any armed timer for `key`. An in-flight flush is left to
    /// drain on its own.
    pub async fn cancel(&self, key: SessionKey) {
        let mut entries = self.entries.lock().await;
        if let Some(PendingFlush::Pending { .. }) = entries.get(&key) {
            entries.remove(&key);
        }
    }

    fn spawn_timer(self: &Arc<Self>, key: SessionKey, generation: u64) {
        let coalescer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(coalescer.debounce).await;
            coalescer.debounce_elapsed(key, generation).await;
        });
    }

    async fn debounce_elapsed(self: &Arc<Self>, key: SessionKey, generation: u64) {
        {
            let mut entries = self.entries.lock().await;
            let armed = matches!(
                entries.get(&key),
                Some(PendingFlush::Pending { generation: current }) if *current == generation
            );
            // Cancelled, superseded, force-flushed, or already flushing.
            if !armed {
                return;
            }
            entries.insert(key, PendingFlush::Flushing { dirty: false });
        }
        self.run_flushes(key).await;
    }

    /// Owns the writer slot for `key`: flushes, then keeps flushing while
    /// re-triggers landed mid-write, then releases the slot.
    async fn run_flushes(&self, key: SessionKey) {
        loop {
            if let Err(error) = self.target.flush(key).await {
                // Not retried here: in-memory state stays authoritative and
                // the next mutation or force flush writes it out.
                error!(session = %key, %error, "session state flush failed");
            }

            let mut entries = self.entries.lock().await;
            let rerun = match entries.get_mut(&key) {
                Some(PendingFlush::Flushing { dirty }) if *dirty => {
                    *dirty = false;
                    true
                }
                _ => false,
            };
            if !rerun {
                entries.remove(&key);
                return;
            }
            debug!(session = %key, "running follow-up flush for writes coalesced mid-flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const DEBOUNCE: Duration = Duration::from_millis(1000);

    #[derive(Default)]
    struct CountingTarget {
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl FlushTarget for CountingTarget {
        async fn flush(&self, _key: SessionKey) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks each flush until released, so tests can observe the in-flight
    /// window deterministically.
    struct GatedTarget {
        flushes: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    impl GatedTarget {
        fn new() -> Self {
            Self {
                flushes: AtomicUsize::new(0),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl FlushTarget for GatedTarget {
        async fn flush(&self, _key: SessionKey) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct FailingTarget {
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl FlushTarget for FailingTarget {
        async fn flush(&self, _key: SessionKey) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("store unavailable"))
        }
    }

    fn key() -> SessionKey {
        use shared::domain::{ChannelId, TenantId};
        SessionKey::new(TenantId(1), ChannelId(1))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_schedules_coalesces_into_one_flush() {
        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        for _ in 0..10 {
            coalescer.schedule(key()).await;
        }
        tokio::time::sleep(DEBOUNCE * 3).await;

        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_schedule_restarts_the_debounce_window() {
        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.schedule(key()).await;
        tokio::time::sleep(DEBOUNCE / 2).await;
        coalescer.schedule(key()).await;
        // The first timer's deadline has passed, but it was superseded.
        tokio::time::sleep(DEBOUNCE / 2 + Duration::from_millis(10)).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(DEBOUNCE).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_during_inflight_flush_runs_exactly_one_follow_up() {
        let target = Arc::new(GatedTarget::new());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.schedule(key()).await;
        tokio::time::sleep(DEBOUNCE * 2).await;
        target.entered.notified().await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);

        // Three re-triggers while the first write is still in flight.
        for _ in 0..3 {
            coalescer.schedule(key()).await;
        }
        target.release.notify_one();

        // Exactly one follow-up starts, with no debounce delay.
        target.entered.notified().await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 2);
        target.release.notify_one();

        tokio::time::sleep(DEBOUNCE * 3).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_bypasses_debounce() {
        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.force_flush(key()).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);

        // The writer slot was released; nothing further is pending.
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_absorbs_a_pending_timer() {
        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.schedule(key()).await;
        coalescer.force_flush(key()).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);

        // The armed timer finds the slot released and backs off.
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_an_armed_timer() {
        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.schedule(key()).await;
        coalescer.cancel(key()).await;
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(target.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failure_is_not_retried_until_next_trigger() {
        let target = Arc::new(FailingTarget {
            flushes: AtomicUsize::new(0),
        });
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer.schedule(key()).await;
        tokio::time::sleep(DEBOUNCE * 3).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);

        coalescer.schedule(key()).await;
        tokio::time::sleep(DEBOUNCE * 3).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_flush_independently() {
        use shared::domain::{ChannelId, TenantId};

        let target = Arc::new(CountingTarget::default());
        let coalescer = FlushCoalescer::new(target.clone(), DEBOUNCE);

        coalescer
            .schedule(SessionKey::new(TenantId(1), ChannelId(1)))
            .await;
        coalescer
            .schedule(SessionKey::new(TenantId(2), ChannelId(1)))
            .await;
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(target.flushes.load(Ordering::SeqCst), 2);
    }
}
