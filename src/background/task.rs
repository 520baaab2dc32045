//! Supervised background tasks.
//!
//! Every long-lived loop in this crate is spawned through [`spawn`], which
//! hands the loop two [`CancellationToken`]s:
//!
//! - `stop` (polite): finish what is buffered, then exit.
//! - `kill` (forced): exit as soon as possible, buffered work may be lost.
//!   It is a child of the context token passed to `start`, so cancelling the
//!   process-wide context forces every task down.
//!
//! The returned [`TaskHandle`] owns the `JoinHandle`; [`TaskHandle::stop`]
//! only returns once the loop has exited or the stop deadline expired.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors surfaced when shutting a background task down.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{task} did not stop within {timeout:?}; remaining work was abandoned")]
    DrainTimeout {
        task: &'static str,
        timeout: Duration,
    },

    #[error("{task} terminated abnormally: {source}")]
    Join {
        task: &'static str,
        #[source]
        source: JoinError,
    },
}

/// Shutdown signals observed by a background loop.
#[derive(Debug, Clone)]
pub struct TaskSignals {
    pub stop: CancellationToken,
    pub kill: CancellationToken,
}

impl TaskSignals {
    /// Signals that are never fired, for driving a loop body by hand.
    pub fn detached() -> Self {
        Self {
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// True once either a polite stop or a forced cancellation was requested.
    pub fn should_halt(&self) -> bool {
        self.stop.is_cancelled() || self.kill.is_cancelled()
    }
}

/// Handle to a running background task.
///
/// Dropping the handle does not stop the task; it keeps running until the
/// context token given to `start` is cancelled.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    signals: TaskSignals,
    join: JoinHandle<()>,
    stop_timeout: Duration,
}

/// Spawns `body` on the tokio runtime as a supervised task.
pub(crate) fn spawn<F, Fut>(
    name: &'static str,
    ctx: &CancellationToken,
    stop_timeout: Duration,
    body: F,
) -> TaskHandle
where
    F: FnOnce(TaskSignals) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let signals = TaskSignals {
        stop: CancellationToken::new(),
        kill: ctx.child_token(),
    };
    let join = tokio::spawn(body(signals.clone()));
    debug!(task = name, "background task spawned");
    TaskHandle {
        name,
        signals,
        join,
        stop_timeout,
    }
}

impl TaskHandle {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task's loop has already exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Requests a polite stop and waits for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::DrainTimeout`] if the loop is still running after
    /// the stop deadline; it is then force-cancelled and aborted. Returns
    /// [`TaskError::Join`] if the task panicked.
    pub async fn stop(mut self) -> Result<(), TaskError> {
        self.signals.stop.cancel();
        let joined = tokio::time::timeout(self.stop_timeout, &mut self.join).await;
        match joined {
            Ok(joined) => joined.map_err(|source| TaskError::Join {
                task: self.name,
                source,
            }),
            Err(_) => {
                warn!(
                    task = self.name,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "stop deadline exceeded, forcing shutdown"
                );
                self.signals.kill.cancel();
                self.join.abort();
                let _ = (&mut self.join).await;
                Err(TaskError::DrainTimeout {
                    task: self.name,
                    timeout: self.stop_timeout,
                })
            }
        }
    }

    /// Forces the task down without draining and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Join`] if the task panicked.
    pub async fn abort(self) -> Result<(), TaskError> {
        self.signals.kill.cancel();
        let name = self.name;
        self.join
            .await
            .map_err(|source| TaskError::Join { task: name, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_waits_for_loop_exit() {
        let ctx = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = spawn("test", &ctx, Duration::from_secs(5), |signals| async move {
            signals.stop.cancelled().await;
            let _ = tx.send("exited");
        });

        handle.stop().await.unwrap();
        assert_eq!(rx.await.unwrap(), "exited");
    }

    #[tokio::test]
    async fn context_cancellation_reaches_kill() {
        let ctx = CancellationToken::new();
        let handle = spawn("test", &ctx, Duration::from_secs(5), |signals| async move {
            signals.kill.cancelled().await;
        });

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_on_stuck_loop() {
        let ctx = CancellationToken::new();
        let handle = spawn("stuck", &ctx, Duration::from_secs(2), |_signals| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, TaskError::DrainTimeout { task: "stuck", .. }));
    }

    #[tokio::test]
    async fn abort_skips_polite_stop() {
        let ctx = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = spawn("test", &ctx, Duration::from_secs(5), |signals| async move {
            tokio::select! {
                _ = signals.stop.cancelled() => { let _ = tx.send("stop"); }
                _ = signals.kill.cancelled() => { let _ = tx.send("kill"); }
            }
        });

        handle.abort().await.unwrap();
        assert_eq!(rx.await.unwrap(), "kill");
    }

    #[test]
    fn detached_signals_never_halt() {
        let signals = TaskSignals::detached();
        assert!(!signals.should_halt());
        signals.stop.cancel();
        assert!(signals.should_halt());
    }
}
