//! Runs the background subsystem against an in-memory newsroom.
//!
//! Simulated readers hit a handful of articles while the scheduler publishes
//! and archives on a short tick. Press Ctrl-C to stop; the view queue is
//! drained before the process exits.
//!
//! ```text
//! RUST_LOG=pressroom=debug cargo run --example newsroom
//! PRESSROOM_CONFIG=background.json cargo run --example newsroom
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use pressroom::{
    Background, BackgroundConfig, ContentId, ContentItem, ContentStatus, InMemoryContentStore,
    SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<BackgroundConfig, Box<dyn std::error::Error>> {
    let mut config = match std::env::var("PRESSROOM_CONFIG") {
        Ok(path) => BackgroundConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => {
            let mut config = BackgroundConfig::default();
            config.views.flush_interval = Duration::from_secs(2);
            config.scheduler.tick_interval = Duration::from_secs(5);
            config
        }
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn seed() -> Vec<ContentItem> {
    let now = Utc::now();
    let hour = ChronoDuration::hours(1);
    vec![
        ContentItem::new(1, "Front page", ContentStatus::Published, now - hour),
        // publishes on the first tick after eight seconds
        ContentItem::new(
            2,
            "Embargoed scoop",
            ContentStatus::PendingReview,
            now + ChronoDuration::seconds(8),
        ),
        ContentItem::new(3, "Flash sale", ContentStatus::Published, now - hour)
            .expires_at(now + ChronoDuration::seconds(12)),
        ContentItem::new(4, "Unfinished draft", ContentStatus::Draft, now),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pressroom=info,newsroom=info")),
        )
        .init();

    let config = load_config()?;
    let store = Arc::new(InMemoryContentStore::with_items(seed()));
    let ctx = CancellationToken::new();
    let (views, background) =
        Background::start(&config, store.clone(), Arc::new(SystemClock), &ctx);

    // Stand-in for request handlers calling the view endpoint.
    let readers = ctx.child_token();
    let reader_task = {
        let views = views.clone();
        let readers = readers.clone();
        tokio::spawn(async move {
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = readers.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        views.enqueue(ContentId(1 + n % 3));
                        n += 1;
                    }
                }
            }
        })
    };

    info!("newsroom running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    readers.cancel();
    reader_task.await?;
    background.stop().await?;

    let stats = views.stats();
    info!(accepted = stats.accepted, dropped = stats.dropped, "view queue totals");
    for id in 1..=4 {
        if let Some(item) = store.get(ContentId(id)).await {
            info!(
                content_id = %item.id,
                title = %item.title,
                status = %item.status,
                views = item.view_count,
                "final state"
            );
        }
    }
    Ok(())
}
