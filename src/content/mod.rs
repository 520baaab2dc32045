//! Content domain types and the storage collaborator interfaces.
//!
//! The background subsystem does not own content. It talks to the content
//! repository through two narrow traits:
//!
//! - [`ViewStore`] — atomic view counter increments and per-day statistics.
//! - [`ContentService`] — due-item queries and status transitions.
//!
//! [`InMemoryContentStore`] implements both and is what the tests and the demo
//! run against.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryContentStore;

/// Identifier of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub u64);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    PendingReview,
    Published,
    Archived,
    Deleted,
}

impl ContentStatus {
    /// Returns the status as its storage string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingReview => "pending_review",
            Self::Published => "published",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the lifecycle allows moving from `self` straight to `target`.
    ///
    /// Staying in the same status is not a transition; see
    /// [`TransitionOutcome::Unchanged`].
    pub fn can_transition_to(self, target: ContentStatus) -> bool {
        use ContentStatus::*;
        matches!(
            (self, target),
            (Draft, PendingReview)
                | (PendingReview, Published)
                | (PendingReview, Draft)
                | (Published, Archived)
                | (Archived, Published)
                | (Draft | PendingReview | Published | Archived, Deleted)
        )
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A publishable unit, as seen by the background subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub title: String,
    pub status: ContentStatus,
    pub publish_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub view_count: u64,
}

impl ContentItem {
    /// Creates an item with no views and no expiry.
    pub fn new(
        id: impl Into<ContentId>,
        title: impl Into<String>,
        status: ContentStatus,
        publish_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status,
            publish_at,
            expire_at: None,
            view_count: 0,
        }
    }

    /// Sets the expiry instant.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expire_at = Some(at);
        self
    }

    /// Due for the scheduler's publish phase at `now`.
    pub fn is_due_for_publish(&self, now: DateTime<Utc>) -> bool {
        self.status == ContentStatus::PendingReview && self.publish_at <= now
    }

    /// Due for the scheduler's expire phase at `now`.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == ContentStatus::Published && self.expire_at.is_some_and(|at| at <= now)
    }
}

/// Role carried by an [`Actor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Author,
    Editor,
    Admin,
}

impl Role {
    /// Whether this role may publish or archive content.
    pub fn can_publish(self) -> bool {
        self >= Role::Editor
    }
}

/// The identity on whose behalf a status transition is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    /// Identifier used by the system actor.
    pub const SYSTEM_ID: &'static str = "system";

    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// The synthetic identity used for unattended transitions.
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, Role::Admin)
    }
}

/// Result of a successful [`ContentService::transition_status`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The status was changed.
    Applied,
    /// The item already had the requested status; nothing was written.
    Unchanged,
    /// The item had moved to `current`, which is neither the expected source
    /// status nor the target; nothing was written.
    Superseded { current: ContentStatus },
}

/// Errors reported by the storage collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("content {0} not found")]
    NotFound(ContentId),

    #[error("content {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ContentId,
        from: ContentStatus,
        to: ContentStatus,
    },

    #[error("actor {actor} may not move content {id} to {to}")]
    Forbidden {
        id: ContentId,
        actor: String,
        to: ContentStatus,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// View counter storage.
///
/// Implementations must apply each call atomically; the view consumer issues
/// them one at a time and never retries.
#[async_trait]
pub trait ViewStore: Send + Sync + 'static {
    /// Adds `by` to the item's cumulative view count.
    async fn increment_view_count(&self, id: ContentId, by: u64) -> Result<(), StoreError>;

    /// Adds `count` views to the item's statistics for `day`.
    async fn record_views(
        &self,
        id: ContentId,
        day: NaiveDate,
        count: u64,
    ) -> Result<(), StoreError>;
}

/// Content lifecycle operations used by the scheduler.
#[async_trait]
pub trait ContentService: Send + Sync + 'static {
    /// Items in `pending_review` whose `publish_at` is at or before `now`.
    async fn find_pending_publish(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, StoreError>;

    /// Items in `published` whose `expire_at` is set and at or before `now`.
    async fn find_pending_expire(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, StoreError>;

    /// Moves an item to `status`.
    ///
    /// Must re-read the current status before writing. Requesting the status
    /// the item already has returns [`TransitionOutcome::Unchanged`], not an
    /// error.
    async fn transition_status(
        &self,
        id: ContentId,
        status: ContentStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Moves an item from `from` to `to`, only if it is still in `from`.
    ///
    /// Same as [`transition_status`](Self::transition_status) when the
    /// current status is `from` or `to`. Any other current status returns
    /// [`TransitionOutcome::Superseded`] without writing, so a caller acting
    /// on a stale read cannot replay an older transition.
    async fn transition_status_from(
        &self,
        id: ContentId,
        from: ContentStatus,
        to: ContentStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn lifecycle_edges() {
        use ContentStatus::*;
        assert!(PendingReview.can_transition_to(Published));
        assert!(Published.can_transition_to(Archived));
        assert!(Archived.can_transition_to(Published));
        assert!(Draft.can_transition_to(Deleted));

        assert!(!Draft.can_transition_to(Published));
        assert!(!Deleted.can_transition_to(Draft));
        assert!(!Published.can_transition_to(Published));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ContentStatus::PendingReview).unwrap();
        assert_eq!(json, "\"pending_review\"");
        assert_eq!(ContentStatus::PendingReview.to_string(), "pending_review");
    }

    #[test]
    fn item_json_shape() {
        let item =
            ContentItem::new(7, "Launch", ContentStatus::Published, at(9)).expires_at(at(17));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "title": "Launch",
                "status": "published",
                "publish_at": "2024-01-01T09:00:00Z",
                "expire_at": "2024-01-01T17:00:00Z",
                "view_count": 0
            })
        );

        let back: ContentItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, ContentId(7));
        assert_eq!(back.expire_at, Some(at(17)));
    }

    #[test]
    fn actor_from_json() {
        let actor: Actor = serde_json::from_str(r#"{"id":"dana","role":"editor"}"#).unwrap();
        assert_eq!(actor, Actor::new("dana", Role::Editor));
        assert!(actor.role.can_publish());
        assert!(serde_json::from_str::<Actor>(r#"{"id":"x","role":"owner"}"#).is_err());
    }

    #[test]
    fn due_for_publish_requires_pending_review() {
        let item = ContentItem::new(1, "a", ContentStatus::PendingReview, at(10));
        assert!(item.is_due_for_publish(at(10)));
        assert!(item.is_due_for_publish(at(11)));
        assert!(!item.is_due_for_publish(at(9)));

        let draft = ContentItem::new(2, "b", ContentStatus::Draft, at(10));
        assert!(!draft.is_due_for_publish(at(11)));
    }

    #[test]
    fn due_for_expiry_requires_expire_at() {
        let item = ContentItem::new(1, "a", ContentStatus::Published, at(1));
        assert!(!item.is_due_for_expiry(at(23)));

        let item = item.expires_at(at(5));
        assert!(item.is_due_for_expiry(at(5)));
        assert!(!item.is_due_for_expiry(at(5) - Duration::seconds(1)));
    }

    #[test]
    fn system_actor_is_admin() {
        let actor = Actor::system();
        assert_eq!(actor.id, "system");
        assert!(actor.role.can_publish());
        assert!(!Role::Author.can_publish());
    }
}
