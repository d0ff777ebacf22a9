//! Remote follow service contract
//!
//! The cache talks to the authoritative follow graph through
//! [`RemoteFollowService`]. Two implementations ship with the crate:
//!
//! - [`HttpFollowService`]: RPC-over-HTTP client with polled push events
//! - [`InMemoryFollowService`]: in-process backend for tests and offline use
//!
//! # Push events
//!
//! A subscription for user `U` carries two streams:
//! - `followers`: rows where `U` is the followed user
//! - `following`: rows where `U` is the follower

pub mod dedup;
mod http;
mod memory;
pub mod retry;

pub use dedup::{EventDeduplicator, EVENT_DEDUP_WINDOW};
pub use http::HttpFollowService;
pub use memory::InMemoryFollowService;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error code returned when a user tries to follow themselves
pub const CANNOT_FOLLOW_SELF: &str = "cannot_follow_self";
/// Error code returned by backends that throttle follow churn
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
/// Error code returned when either side has blocked the other
pub const USER_BLOCKED: &str = "user_blocked";

/// Result of a follow/unfollow call, as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Relationship between a follower and one other user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowStatus {
    pub user_id: String,
    pub is_following: bool,
    #[serde(default)]
    pub is_followed_by: bool,
}

/// Which side of the relationship the subscribed user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Followers,
    Following,
}

impl EventStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStream::Followers => "followers",
            EventStream::Following => "following",
        }
    }
}

/// Row-level change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// A `follows` row as carried by push events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following_id: Option<String>,
}

/// Server-pushed follow change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowEvent {
    #[serde(rename = "type")]
    pub stream: EventStream,

    pub event_type: ChangeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<FollowRow>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<FollowRow>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Server timestamp in epoch millis, used as the polling cursor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl FollowEvent {
    /// `follower` started following `following`, seen from `stream`
    pub fn inserted(stream: EventStream, follower: &str, following: &str) -> Self {
        Self {
            stream,
            event_type: ChangeType::Insert,
            new: Some(FollowRow {
                follower_id: Some(follower.to_string()),
                following_id: Some(following.to_string()),
            }),
            old: None,
            event_id: None,
            created_at: None,
        }
    }

    /// `follower` stopped following `following`, seen from `stream`
    pub fn deleted(stream: EventStream, follower: &str, following: &str) -> Self {
        Self {
            stream,
            event_type: ChangeType::Delete,
            new: None,
            old: Some(FollowRow {
                follower_id: Some(follower.to_string()),
                following_id: Some(following.to_string()),
            }),
            event_id: None,
            created_at: None,
        }
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// The row describing the change: `new` for inserts, `old` for deletes
    pub fn row(&self) -> Option<&FollowRow> {
        match self.event_type {
            ChangeType::Insert | ChangeType::Update => self.new.as_ref(),
            ChangeType::Delete => self.old.as_ref(),
        }
    }
}

/// Callback invoked for every delivered push event
pub type EventHandler = Arc<dyn Fn(&FollowEvent) + Send + Sync>;

/// Opaque handle to a live push subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    user_id: String,
}

impl SubscriptionHandle {
    pub fn new(id: u64, user_id: impl Into<String>) -> Self {
        Self {
            id,
            user_id: user_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Authoritative follow graph
#[async_trait]
pub trait RemoteFollowService: Send + Sync {
    /// Make `follower_id` follow `target_id`
    async fn follow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome>;

    /// Make `follower_id` stop following `target_id`
    async fn unfollow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome>;

    /// Whether `follower_id` currently follows `target_id`
    async fn is_following(&self, follower_id: &str, target_id: &str) -> Result<bool>;

    /// Relationship between `follower_id` and each of `user_ids`
    async fn follow_status_batch(
        &self,
        follower_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<FollowStatus>>;

    /// Start delivering push events for `user_id` to `handler`
    fn subscribe_to_follow_events(
        &self,
        user_id: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle>;

    /// Stop a subscription; unknown handles are ignored
    fn unsubscribe_from_follow_events(&self, handle: &SubscriptionHandle);
}
