//! Publish/expire scheduler.
//!
//! Each tick asks the content service for items whose scheduled time has
//! passed and moves them along as the system actor:
//!
//! 1. `pending_review` items with `publish_at <= now` → `published`
//! 2. `published` items with `expire_at <= now` → `archived`
//!
//! Ticks run inside the scheduler's own loop, so they never overlap; ticks
//! missed while one runs long are skipped. Nothing is persisted between ticks
//! apart from in-memory retry bookkeeping, and after a restart the first tick
//! fires immediately and picks up anything overdue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::{self, TaskHandle, TaskSignals};
use crate::clock::Clock;
use crate::config::{RetryPolicy, SchedulerConfig};
use crate::content::{
    Actor, ContentId, ContentItem, ContentService, ContentStatus, StoreError, TransitionOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Publish,
    Expire,
}

impl Phase {
    fn target(self) -> ContentStatus {
        match self {
            Self::Publish => ContentStatus::Published,
            Self::Expire => ContentStatus::Archived,
        }
    }

    fn source(self) -> ContentStatus {
        match self {
            Self::Publish => ContentStatus::PendingReview,
            Self::Expire => ContentStatus::Published,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Expire => "expire",
        }
    }
}

/// Counts from a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub published: usize,
    pub archived: usize,
    /// Items that already had the target status when the transition ran.
    pub unchanged: usize,
    /// Items that had moved past the phase's source status since the query.
    pub superseded: usize,
    pub failed: usize,
    /// Items skipped because they are backing off or dead-lettered.
    pub deferred: usize,
    /// Items that reached the attempt limit during this tick.
    pub dead_lettered: usize,
    pub failed_queries: usize,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug)]
struct RetryState {
    failures: u32,
    retry_at: DateTime<Utc>,
    dead: bool,
}

enum Gate {
    Ready,
    Backoff(DateTime<Utc>),
    DeadLettered,
}

enum Failure {
    Retry { attempt: u32, retry_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
}

/// In-memory failure bookkeeping, keyed by phase and item.
#[derive(Debug)]
struct RetryTracker {
    policy: RetryPolicy,
    entries: HashMap<(Phase, ContentId), RetryState>,
}

impl RetryTracker {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    fn gate(&self, phase: Phase, id: ContentId, now: DateTime<Utc>) -> Gate {
        match self.entries.get(&(phase, id)) {
            None => Gate::Ready,
            Some(state) if state.dead => Gate::DeadLettered,
            Some(state) if state.retry_at > now => Gate::Backoff(state.retry_at),
            Some(_) => Gate::Ready,
        }
    }

    fn record_failure(&mut self, phase: Phase, id: ContentId, now: DateTime<Utc>) -> Failure {
        let state = self.entries.entry((phase, id)).or_insert(RetryState {
            failures: 0,
            retry_at: now,
            dead: false,
        });
        state.failures = state.failures.saturating_add(1);
        if state.failures >= self.policy.max_attempts {
            state.dead = true;
            return Failure::DeadLettered {
                attempts: state.failures,
            };
        }

        let backoff = self.policy.backoff_after(state.failures);
        let delay = TimeDelta::from_std(backoff).unwrap_or(TimeDelta::MAX);
        state.retry_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Failure::Retry {
            attempt: state.failures,
            retry_at: state.retry_at,
        }
    }

    fn clear(&mut self, phase: Phase, id: ContentId) {
        self.entries.remove(&(phase, id));
    }

    /// Forgets items of `phase` that are no longer due.
    fn prune(&mut self, phase: Phase, due: &[ContentItem]) {
        let due: HashSet<ContentId> = due.iter().map(|item| item.id).collect();
        self.entries
            .retain(|&(entry_phase, id), _| entry_phase != phase || due.contains(&id));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Periodically publishes and expires content whose time has come.
pub struct Scheduler<C: ContentService> {
    service: Arc<C>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    actor: Actor,
    retries: RetryTracker,
}

impl<C: ContentService> Scheduler<C> {
    /// Creates a scheduler acting as [`Actor::system`].
    pub fn new(service: Arc<C>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        let retries = RetryTracker::new(config.retry.clone());
        Self {
            service,
            clock,
            config,
            actor: Actor::system(),
            retries,
        }
    }

    /// Spawns the tick loop. The first tick runs immediately.
    ///
    /// Stop requests are honoured between items, so [`TaskHandle::stop`]
    /// waits at most for the transition in flight.
    pub fn start(self, ctx: &CancellationToken) -> TaskHandle {
        let stop_timeout = self.config.stop_timeout;
        task::spawn("scheduler", ctx, stop_timeout, move |signals| {
            self.run(signals)
        })
    }

    /// Runs one tick now, outside the timer.
    pub async fn run_tick(&mut self) -> TickReport {
        self.tick(&TaskSignals::detached()).await
    }

    /// Number of items currently backing off or dead-lettered.
    pub fn tracked_failures(&self) -> usize {
        self.retries.len()
    }

    async fn run(mut self, signals: TaskSignals) {
        let period = self.config.effective_tick_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_interval_ms = period.as_millis() as u64,
            max_attempts = self.config.retry.max_attempts,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = signals.kill.cancelled() => break,
                _ = signals.stop.cancelled() => break,

                _ = ticker.tick() => {
                    self.tick(&signals).await;
                }
            }
        }

        info!("scheduler stopped");
    }

    async fn tick(&mut self, signals: &TaskSignals) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for phase in [Phase::Publish, Phase::Expire] {
            if signals.should_halt() {
                break;
            }
            self.run_phase(phase, now, signals, &mut report).await;
        }

        if report.is_quiet() {
            debug!(now = %now, "scheduler tick: nothing due");
        } else {
            info!(
                now = %now,
                published = report.published,
                archived = report.archived,
                unchanged = report.unchanged,
                superseded = report.superseded,
                failed = report.failed,
                deferred = report.deferred,
                dead_lettered = report.dead_lettered,
                "scheduler tick complete"
            );
        }
        report
    }

    async fn run_phase(
        &mut self,
        phase: Phase,
        now: DateTime<Utc>,
        signals: &TaskSignals,
        report: &mut TickReport,
    ) {
        let due = match self.find_due(phase, now).await {
            Ok(items) => items,
            Err(e) => {
                error!(phase = phase.as_str(), error = %e, "scheduler query failed");
                report.failed_queries += 1;
                return;
            }
        };
        self.retries.prune(phase, &due);

        for item in due {
            if signals.should_halt() {
                debug!(phase = phase.as_str(), "stop requested, leaving remaining items");
                return;
            }

            match self.retries.gate(phase, item.id, now) {
                Gate::Ready => {}
                Gate::Backoff(retry_at) => {
                    debug!(content_id = %item.id, retry_at = %retry_at, "item backing off");
                    report.deferred += 1;
                    continue;
                }
                Gate::DeadLettered => {
                    report.deferred += 1;
                    continue;
                }
            }

            match self
                .service
                .transition_status_from(item.id, phase.source(), phase.target(), &self.actor)
                .await
            {
                Ok(TransitionOutcome::Applied) => {
                    self.retries.clear(phase, item.id);
                    info!(
                        content_id = %item.id,
                        title = %item.title,
                        status = %phase.target(),
                        "scheduled transition applied"
                    );
                    match phase {
                        Phase::Publish => report.published += 1,
                        Phase::Expire => report.archived += 1,
                    }
                }
                Ok(TransitionOutcome::Unchanged) => {
                    self.retries.clear(phase, item.id);
                    debug!(
                        content_id = %item.id,
                        status = %phase.target(),
                        "already transitioned"
                    );
                    report.unchanged += 1;
                }
                Ok(TransitionOutcome::Superseded { current }) => {
                    self.retries.clear(phase, item.id);
                    debug!(
                        content_id = %item.id,
                        current = %current,
                        expected = %phase.source(),
                        "item moved on since the query, skipped"
                    );
                    report.superseded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    self.on_failure(phase, item.id, now, &e, report);
                }
            }
        }
    }

    async fn find_due(
        &self,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, StoreError> {
        match phase {
            Phase::Publish => self.service.find_pending_publish(now).await,
            Phase::Expire => self.service.find_pending_expire(now).await,
        }
    }

    fn on_failure(
        &mut self,
        phase: Phase,
        id: ContentId,
        now: DateTime<Utc>,
        err: &StoreError,
        report: &mut TickReport,
    ) {
        match self.retries.record_failure(phase, id, now) {
            Failure::Retry { attempt, retry_at } => {
                warn!(
                    content_id = %id,
                    phase = phase.as_str(),
                    attempt,
                    retry_at = %retry_at,
                    error = %err,
                    "scheduled transition failed, will retry"
                );
            }
            Failure::DeadLettered { attempts } => {
                error!(
                    content_id = %id,
                    phase = phase.as_str(),
                    attempts,
                    error = %err,
                    "scheduled transition keeps failing, giving up until restart"
                );
                report.dead_lettered += 1;
            }
        }
    }
}
