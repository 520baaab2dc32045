//! Background tasks: coalesced view counting and scheduled publishing.
//!
//! ## Core types
//!
//! - [`ViewQueue`] — what request handlers hold; [`ViewQueue::enqueue`] never
//!   blocks and never fails.
//! - [`ViewCounter`] — single consumer that batches views by content id and
//!   calendar day and writes them through a [`ViewStore`](crate::content::ViewStore).
//! - [`Scheduler`] — ticking loop that publishes and expires due content.
//! - [`TaskHandle`] — returned by every `start`; [`TaskHandle::stop`] drains
//!   and joins, [`TaskHandle::abort`] does not drain.
//! - [`Background`] — both tasks started together from one config.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pressroom::background::Background;
//! use pressroom::clock::SystemClock;
//! use pressroom::config::BackgroundConfig;
//! use pressroom::content::{ContentId, InMemoryContentStore};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryContentStore::new());
//!     let ctx = CancellationToken::new();
//!     let (views, background) =
//!         Background::start(&BackgroundConfig::from_env()?, store, Arc::new(SystemClock), &ctx);
//!
//!     views.enqueue(ContentId(42));
//!
//!     background.stop().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod batch;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod views;

pub use batch::{Aggregate, Batch};
pub use queue::{QueueStats, ViewEvent, ViewQueue, ViewReceiver, view_queue};
pub use scheduler::{Scheduler, TickReport};
pub use task::{TaskError, TaskHandle, TaskSignals};
pub use views::{FlushCause, FlushReport, ViewCounter, flush_batch};

use crate::clock::Clock;
use crate::config::BackgroundConfig;
use crate::content::{ContentService, ViewStore};

/// The view counter and the scheduler, running side by side.
#[derive(Debug)]
pub struct Background {
    pub views: TaskHandle,
    pub scheduler: TaskHandle,
}

impl Background {
    /// Starts both tasks against one content repository.
    ///
    /// Returns the queue handle for request handlers. Cancelling `ctx` forces
    /// both tasks down without draining.
    pub fn start<S>(
        config: &BackgroundConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ctx: &CancellationToken,
    ) -> (ViewQueue, Self)
    where
        S: ViewStore + ContentService,
    {
        let (queue, receiver) = view_queue(&config.views, clock.clone());
        let views = ViewCounter::new(receiver, store.clone(), config.views.clone()).start(ctx);
        let scheduler = Scheduler::new(store, clock, config.scheduler.clone()).start(ctx);
        info!("background tasks started");
        (queue, Self { views, scheduler })
    }

    /// Stops the scheduler, then drains and stops the view counter.
    ///
    /// Both are always stopped; the first error is returned.
    pub async fn stop(self) -> Result<(), TaskError> {
        let scheduler = self.scheduler.stop().await;
        let views = self.views.stop().await;
        info!("background tasks stopped");
        scheduler.and(views)
    }
}
