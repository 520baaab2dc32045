//! In-memory content repository.
//!
//! Implements [`ViewStore`] and [`ContentService`] over a mutex-guarded map.
//! Besides backing the demo, it records every write call and can be told to
//! fail writes for chosen items, which is how the flush and scheduler error
//! paths are exercised.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{
    Actor, ContentId, ContentItem, ContentService, ContentStatus, StoreError, TransitionOutcome,
    ViewStore,
};

/// A status change applied by [`InMemoryContentStore::transition_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransition {
    pub id: ContentId,
    pub from: ContentStatus,
    pub to: ContentStatus,
    pub actor: Actor,
}

#[derive(Default)]
struct Inner {
    items: HashMap<ContentId, ContentItem>,
    daily_views: BTreeMap<(ContentId, NaiveDate), u64>,
    increment_calls: Vec<(ContentId, u64)>,
    record_calls: Vec<(ContentId, NaiveDate, u64)>,
    transitions: Vec<AppliedTransition>,
    failing_views: HashSet<ContentId>,
    failing_transitions: HashSet<ContentId>,
}

/// Content repository kept entirely in memory.
#[derive(Default)]
pub struct InMemoryContentStore {
    inner: Mutex<Inner>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `items`.
    pub fn with_items(items: impl IntoIterator<Item = ContentItem>) -> Self {
        let inner = Inner {
            items: items.into_iter().map(|item| (item.id, item)).collect(),
            ..Inner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Inserts or replaces an item.
    pub async fn insert(&self, item: ContentItem) {
        self.inner.lock().await.items.insert(item.id, item);
    }

    pub async fn get(&self, id: ContentId) -> Option<ContentItem> {
        self.inner.lock().await.items.get(&id).cloned()
    }

    pub async fn status(&self, id: ContentId) -> Option<ContentStatus> {
        self.inner.lock().await.items.get(&id).map(|item| item.status)
    }

    /// Cumulative view count, or 0 for unknown items.
    pub async fn view_count(&self, id: ContentId) -> u64 {
        self.inner
            .lock()
            .await
            .items
            .get(&id)
            .map_or(0, |item| item.view_count)
    }

    /// Views recorded for `id` on `day`.
    pub async fn daily_views(&self, id: ContentId, day: NaiveDate) -> u64 {
        self.inner
            .lock()
            .await
            .daily_views
            .get(&(id, day))
            .copied()
            .unwrap_or(0)
    }

    /// Every `increment_view_count` call that succeeded, in order.
    pub async fn increment_calls(&self) -> Vec<(ContentId, u64)> {
        self.inner.lock().await.increment_calls.clone()
    }

    /// Every `record_views` call that succeeded, in order.
    pub async fn record_calls(&self) -> Vec<(ContentId, NaiveDate, u64)> {
        self.inner.lock().await.record_calls.clone()
    }

    /// Sum of all successful increments across all items.
    pub async fn total_increments(&self) -> u64 {
        self.inner
            .lock()
            .await
            .increment_calls
            .iter()
            .map(|(_, by)| by)
            .sum()
    }

    /// Status changes that were actually written, in order.
    pub async fn transitions(&self) -> Vec<AppliedTransition> {
        self.inner.lock().await.transitions.clone()
    }

    /// Makes view writes for `id` fail with [`StoreError::Unavailable`].
    pub async fn fail_views_for(&self, id: ContentId) {
        self.inner.lock().await.failing_views.insert(id);
    }

    /// Makes status transitions for `id` fail with [`StoreError::Unavailable`].
    pub async fn fail_transitions_for(&self, id: ContentId) {
        self.inner.lock().await.failing_transitions.insert(id);
    }

    /// Lets transitions for `id` succeed again.
    pub async fn heal_transitions_for(&self, id: ContentId) {
        self.inner.lock().await.failing_transitions.remove(&id);
    }
}

#[async_trait]
impl ViewStore for InMemoryContentStore {
    async fn increment_view_count(&self, id: ContentId, by: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_views.contains(&id) {
            return Err(StoreError::Unavailable(format!("view writes for {id} are failing")));
        }
        let item = inner.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.view_count = item.view_count.saturating_add(by);
        inner.increment_calls.push((id, by));
        Ok(())
    }

    async fn record_views(
        &self,
        id: ContentId,
        day: NaiveDate,
        count: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_views.contains(&id) {
            return Err(StoreError::Unavailable(format!("view writes for {id} are failing")));
        }
        if !inner.items.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        *inner.daily_views.entry((id, day)).or_insert(0) += count;
        inner.record_calls.push((id, day, count));
        Ok(())
    }
}

#[async_trait]
impl ContentService for InMemoryContentStore {
    async fn find_pending_publish(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<ContentItem> = inner
            .items
            .values()
            .filter(|item| item.is_due_for_publish(now))
            .cloned()
            .collect();
        due.sort_by_key(|item| (item.publish_at, item.id));
        Ok(due)
    }

    async fn find_pending_expire(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<ContentItem> = inner
            .items
            .values()
            .filter(|item| item.is_due_for_expiry(now))
            .cloned()
            .collect();
        due.sort_by_key(|item| (item.expire_at, item.id));
        Ok(due)
    }

    async fn transition_status(
        &self,
        id: ContentId,
        status: ContentStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome, StoreError> {
        self.apply_transition(id, None, status, actor).await
    }

    async fn transition_status_from(
        &self,
        id: ContentId,
        from: ContentStatus,
        to: ContentStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome, StoreError> {
        self.apply_transition(id, Some(from), to, actor).await
    }
}

impl InMemoryContentStore {
    async fn apply_transition(
        &self,
        id: ContentId,
        expected: Option<ContentStatus>,
        status: ContentStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_transitions.contains(&id) {
            return Err(StoreError::Unavailable(format!("transitions for {id} are failing")));
        }
        let item = inner.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Re-check under the lock: a concurrent caller may already have moved it.
        let from = item.status;
        if from == status {
            return Ok(TransitionOutcome::Unchanged);
        }
        if expected.is_some_and(|expected| expected != from) {
            return Ok(TransitionOutcome::Superseded { current: from });
        }
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { id, from, to: status });
        }
        if matches!(status, ContentStatus::Published | ContentStatus::Archived)
            && !actor.role.can_publish()
        {
            return Err(StoreError::Forbidden {
                id,
                actor: actor.id.clone(),
                to: status,
            });
        }

        item.status = status;
        inner.transitions.push(AppliedTransition {
            id,
            from,
            to: status,
            actor: actor.clone(),
        });
        Ok(TransitionOutcome::Applied)
    }
}
