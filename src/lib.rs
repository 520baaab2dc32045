//! # pressroom
//!
//! Background processing for a content backend: view events are coalesced into
//! batched counter writes, and a scheduler publishes and expires content when
//! its time comes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pressroom::{Background, BackgroundConfig, ContentId, InMemoryContentStore, SystemClock};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryContentStore::new());
//!     let ctx = CancellationToken::new();
//!     let (views, background) =
//!         Background::start(&BackgroundConfig::default(), store, Arc::new(SystemClock), &ctx);
//!
//!     // From a request handler:
//!     views.enqueue(ContentId(1));
//!
//!     background.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod clock;
pub mod config;
pub mod content;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use background::{Background, Scheduler, TaskError, TaskHandle, ViewCounter, ViewQueue};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackgroundConfig, ConfigError};
pub use content::{
    Actor, ContentId, ContentItem, ContentService, ContentStatus, InMemoryContentStore,
    StoreError, ViewStore,
};
