//! View counter: the single consumer of the view queue.
//!
//! The loop waits on four things at once:
//!
//! - a forced cancellation: exit immediately, the batch is lost;
//! - a polite stop: flush, drain the queue, exit;
//! - a new event: add it to the batch, flush when the batch is full;
//! - the flush timer: flush whatever is pending.
//!
//! Flushes run inline, so flush *k* has finished every storage call before
//! flush *k + 1* starts.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{Aggregate, Batch};
use super::queue::{ViewEvent, ViewReceiver};
use super::task::{self, TaskHandle, TaskSignals};
use crate::config::ViewQueueConfig;
use crate::content::ViewStore;

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCause {
    Size,
    Timer,
    Shutdown,
}

impl FlushCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timer => "timer",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub events: u64,
    pub contents: usize,
    pub day_groups: usize,
    /// Storage calls that returned an error. Their increments are lost.
    pub failed_writes: usize,
}

/// Applies `events` to `store`.
///
/// Per content id this issues one `increment_view_count` with the id's total,
/// then one `record_views` per calendar day. A failing call is logged and
/// skipped; the rest of the batch is still written.
pub async fn flush_batch<S>(store: &S, events: &[ViewEvent]) -> FlushReport
where
    S: ViewStore + ?Sized,
{
    let aggregate = Aggregate::from_events(events);
    let mut report = FlushReport {
        events: aggregate.event_count(),
        contents: aggregate.totals.len(),
        day_groups: aggregate.daily.len(),
        failed_writes: 0,
    };

    for (&id, &total) in &aggregate.totals {
        if let Err(e) = store.increment_view_count(id, total).await {
            error!(content_id = %id, views = total, error = %e, "failed to increment view count");
            report.failed_writes += 1;
        }
        for (day, count) in aggregate.days_for(id) {
            if let Err(e) = store.record_views(id, day, count).await {
                error!(
                    content_id = %id,
                    day = %day,
                    views = count,
                    error = %e,
                    "failed to record daily views"
                );
                report.failed_writes += 1;
            }
        }
    }

    report
}

/// Consumes the view queue and writes coalesced counts to a [`ViewStore`].
pub struct ViewCounter<S: ViewStore> {
    receiver: ViewReceiver,
    store: Arc<S>,
    config: ViewQueueConfig,
}

impl<S: ViewStore> ViewCounter<S> {
    pub fn new(receiver: ViewReceiver, store: Arc<S>, config: ViewQueueConfig) -> Self {
        Self {
            receiver,
            store,
            config,
        }
    }

    /// Spawns the consumer loop.
    ///
    /// Cancelling `ctx` is a forced shutdown. Use [`TaskHandle::stop`] for a
    /// draining one.
    pub fn start(self, ctx: &CancellationToken) -> TaskHandle {
        let stop_timeout = self.config.drain_timeout;
        task::spawn("view-counter", ctx, stop_timeout, move |signals| {
            self.run(signals)
        })
    }

    async fn run(mut self, signals: TaskSignals) {
        let period = self.config.effective_flush_interval();
        let mut flush_timer = interval_at(Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Batch::with_limit(self.config.batch_size);

        info!(
            capacity = self.config.capacity,
            batch_size = self.config.batch_size,
            flush_interval_ms = period.as_millis() as u64,
            "view counter started"
        );

        loop {
            tokio::select! {
                biased;

                _ = signals.kill.cancelled() => {
                    if !batch.is_empty() || !self.receiver.is_empty() {
                        warn!(
                            lost_batched = batch.len(),
                            lost_queued = self.receiver.len(),
                            "view counter cancelled, pending views discarded"
                        );
                    }
                    return;
                }

                _ = signals.stop.cancelled() => {
                    self.drain(&mut batch, &signals.kill).await;
                    break;
                }

                maybe_event = self.receiver.recv() => match maybe_event {
                    Some(event) => {
                        batch.push(event);
                        if batch.is_full() {
                            self.flush(&mut batch, FlushCause::Size).await;
                            flush_timer.reset();
                        }
                    }
                    None => {
                        info!("all view queue producers dropped");
                        self.drain(&mut batch, &signals.kill).await;
                        break;
                    }
                },

                _ = flush_timer.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch, FlushCause::Timer).await;
                    }
                }
            }
        }

        info!("view counter stopped");
    }

    /// Flushes the current batch, then empties the queue in batch-sized chunks.
    async fn drain(&mut self, batch: &mut Batch, kill: &CancellationToken) {
        self.receiver.close();
        let mut drained = batch.len();
        self.flush(batch, FlushCause::Shutdown).await;

        loop {
            if kill.is_cancelled() {
                warn!(
                    lost_queued = self.receiver.len(),
                    "drain interrupted by forced shutdown"
                );
                return;
            }
            while !batch.is_full() {
                match self.receiver.try_recv() {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            drained += batch.len();
            self.flush(batch, FlushCause::Shutdown).await;
        }

        info!(drained, "view queue drained");
    }

    async fn flush(&self, batch: &mut Batch, cause: FlushCause) -> FlushReport {
        let events = batch.take();
        if events.is_empty() {
            return FlushReport::default();
        }

        let started = Instant::now();
        let report = flush_batch(self.store.as_ref(), &events).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if report.failed_writes > 0 {
            warn!(
                cause = cause.as_str(),
                events = report.events,
                failed_writes = report.failed_writes,
                elapsed_ms,
                "view flush finished with errors"
            );
        } else {
            debug!(
                cause = cause.as_str(),
                events = report.events,
                contents = report.contents,
                day_groups = report.day_groups,
                elapsed_ms,
                "view flush complete"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::queue::{ViewQueue, view_queue};
    use crate::background::task::TaskError;
    use crate::clock::ManualClock;
    use crate::content::{ContentId, ContentItem, ContentStatus, InMemoryContentStore, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use std::time::Duration;

    const A: ContentId = ContentId(1);
    const B: ContentId = ContentId(2);

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn store() -> Arc<InMemoryContentStore> {
        Arc::new(InMemoryContentStore::with_items([
            ContentItem::new(A, "a", ContentStatus::Published, start_time()),
            ContentItem::new(B, "b", ContentStatus::Published, start_time()),
        ]))
    }

    fn config(batch_size: usize, flush_interval: Duration) -> ViewQueueConfig {
        ViewQueueConfig {
            capacity: 64,
            batch_size,
            flush_interval,
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn setup(
        config: ViewQueueConfig,
        store: Arc<InMemoryContentStore>,
    ) -> (ViewQueue, Arc<ManualClock>, TaskHandle, CancellationToken) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let (queue, receiver) = view_queue(&config, clock.clone());
        let ctx = CancellationToken::new();
        let handle = ViewCounter::new(receiver, store, config).start(&ctx);
        (queue, clock, handle, ctx)
    }

    #[tokio::test]
    async fn flush_batch_splits_totals_and_days() {
        let store = store();
        let at = |day, hour| Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap();
        let events: Vec<ViewEvent> = [(1, 9), (1, 10), (1, 11), (2, 9), (2, 10)]
            .into_iter()
            .map(|(day, hour)| ViewEvent {
                content_id: A,
                observed_at: at(day, hour),
            })
            .collect();

        let report = flush_batch(store.as_ref(), &events).await;

        assert_eq!(report.events, 5);
        assert_eq!(report.day_groups, 2);
        assert_eq!(report.failed_writes, 0);
        assert_eq!(store.increment_calls().await, vec![(A, 5)]);
        assert_eq!(
            store.record_calls().await,
            vec![(A, date(1), 3), (A, date(2), 2)]
        );
    }

    #[tokio::test]
    async fn failed_write_does_not_abort_flush() {
        let store = store();
        store.fail_views_for(A).await;
        let events: Vec<ViewEvent> = [A, B, B]
            .into_iter()
            .map(|content_id| ViewEvent {
                content_id,
                observed_at: start_time(),
            })
            .collect();

        let report = flush_batch(store.as_ref(), &events).await;

        assert_eq!(report.failed_writes, 2);
        assert_eq!(store.view_count(A).await, 0);
        assert_eq!(store.view_count(B).await, 2);
        assert_eq!(store.daily_views(B, date(1)).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_batch_size_reached() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(4, Duration::from_secs(3600)), store.clone());

        for _ in 0..4 {
            queue.enqueue(A);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.increment_calls().await, vec![(A, 4)]);
        assert_eq!(store.daily_views(A, date(1)).await, 4);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_timer() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(100, Duration::from_secs(1)), store.clone());

        queue.enqueue(A);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.increment_calls().await.is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.increment_calls().await, vec![(A, 1)]);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_days_in_one_batch() {
        let store = store();
        let (queue, clock, handle, _ctx) =
            setup(config(5, Duration::from_secs(3600)), store.clone());

        for _ in 0..3 {
            queue.enqueue(A);
        }
        clock.set(Utc.with_ymd_and_hms(2024, 1, 2, 0, 30, 0).unwrap());
        for _ in 0..2 {
            queue.enqueue(A);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.view_count(A).await, 5);
        assert_eq!(store.daily_views(A, date(1)).await, 3);
        assert_eq!(store.daily_views(A, date(2)).await, 2);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn all_accepted_events_are_counted() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(8, Duration::from_secs(1)), store.clone());

        for i in 0..30u64 {
            queue.enqueue(if i % 3 == 0 { B } else { A });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(queue.stats().dropped, 0);
        assert_eq!(store.view_count(A).await, 20);
        assert_eq!(store.view_count(B).await, 10);
        assert_eq!(store.total_increments().await, 30);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_pending_views() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(10, Duration::from_secs(3600)), store.clone());

        for _ in 0..3 {
            queue.enqueue(A);
        }
        handle.stop().await.unwrap();

        assert_eq!(store.total_increments().await, 3);
        assert_eq!(store.view_count(A).await, 3);
    }

    #[tokio::test]
    async fn stop_drains_more_than_one_batch() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(4, Duration::from_secs(3600)), store.clone());

        for _ in 0..11 {
            queue.enqueue(B);
        }
        handle.stop().await.unwrap();

        assert_eq!(store.view_count(B).await, 11);
        assert!(store.increment_calls().await.iter().all(|&(_, by)| by <= 4));
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_dropped() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(4, Duration::from_secs(3600)), store.clone());

        handle.stop().await.unwrap();
        queue.enqueue(A);

        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(store.view_count(A).await, 0);
    }

    #[tokio::test]
    async fn abort_discards_pending_views() {
        let store = store();
        let (queue, _clock, handle, _ctx) =
            setup(config(10, Duration::from_secs(3600)), store.clone());

        for _ in 0..3 {
            queue.enqueue(A);
        }
        handle.abort().await.unwrap();

        assert_eq!(store.total_increments().await, 0);
    }

    #[tokio::test]
    async fn context_cancel_is_forced() {
        let store = store();
        let (queue, _clock, handle, ctx) =
            setup(config(10, Duration::from_secs(3600)), store.clone());

        queue.enqueue(A);
        ctx.cancel();
        handle.stop().await.unwrap();

        assert_eq!(store.total_increments().await, 0);
    }

    /// Delegates to the in-memory store after a fixed delay per increment.
    struct SlowStore {
        inner: Arc<InMemoryContentStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ViewStore for SlowStore {
        async fn increment_view_count(&self, id: ContentId, by: u64) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.increment_view_count(id, by).await
        }

        async fn record_views(
            &self,
            id: ContentId,
            day: NaiveDate,
            count: u64,
        ) -> Result<(), StoreError> {
            self.inner.record_views(id, day, count).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forced_shutdown_interrupts_drain() {
        let store = store();
        let slow = Arc::new(SlowStore {
            inner: store.clone(),
            delay: Duration::from_secs(1),
        });
        let config = ViewQueueConfig {
            drain_timeout: Duration::from_secs(60),
            ..config(1, Duration::from_secs(3600))
        };
        let clock = Arc::new(ManualClock::new(start_time()));
        let (queue, receiver) = view_queue(&config, clock);
        let ctx = CancellationToken::new();
        let handle = ViewCounter::new(receiver, slow, config).start(&ctx);

        for _ in 0..4 {
            queue.enqueue(A);
        }
        let stopping = tokio::spawn(handle.stop());

        // one event flushed, the second flush in flight when the kill lands
        tokio::time::sleep(Duration::from_millis(1500)).await;
        ctx.cancel();

        stopping.await.unwrap().unwrap();
        assert_eq!(store.view_count(A).await, 2);
        assert_eq!(queue.stats().accepted, 4);
    }

    struct StuckStore;

    #[async_trait]
    impl ViewStore for StuckStore {
        async fn increment_view_count(&self, _id: ContentId, _by: u64) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn record_views(
            &self,
            _id: ContentId,
            _day: NaiveDate,
            _count: u64,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_after_drain_timeout() {
        let config = ViewQueueConfig {
            drain_timeout: Duration::from_secs(2),
            ..config(10, Duration::from_secs(3600))
        };
        let clock = Arc::new(ManualClock::new(start_time()));
        let (queue, receiver) = view_queue(&config, clock);
        let handle = ViewCounter::new(receiver, Arc::new(StuckStore), config)
            .start(&CancellationToken::new());

        queue.enqueue(A);
        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, TaskError::DrainTimeout { task: "view-counter", .. }));
    }
}
