//! Cached facts and their keys

use crate::{FollowGraphError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Separator between follower and target in the composite key
pub const KEY_SEPARATOR: char = ':';

/// Reject ids the composite key cannot represent
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() || user_id.contains(KEY_SEPARATOR) {
        return Err(FollowGraphError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

/// Whether a timestamp is older than `ttl` at `now` (all in epoch millis)
pub(crate) fn is_expired(last_updated: i64, now: i64, ttl: Duration) -> bool {
    now.saturating_sub(last_updated) > ttl.as_millis() as i64
}

/// Directional (follower, target) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FollowKey {
    pub follower_id: String,
    pub target_id: String,
}

impl FollowKey {
    pub fn new(follower_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            follower_id: follower_id.into(),
            target_id: target_id.into(),
        }
    }
}

impl fmt::Display for FollowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.follower_id, KEY_SEPARATOR, self.target_id)
    }
}

impl FromStr for FollowKey {
    type Err = FollowGraphError;

    fn from_str(s: &str) -> Result<Self> {
        let (follower, target) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| FollowGraphError::InvalidUserId(s.to_string()))?;
        validate_user_id(follower)?;
        validate_user_id(target)?;
        Ok(Self::new(follower, target))
    }
}

/// Cached answer to "does follower follow target"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowFact {
    pub is_following: bool,

    /// Epoch millis of the last write
    pub last_updated: i64,

    /// Monotonic write stamp; not persisted
    #[serde(skip)]
    pub(crate) version: u64,
}

impl FollowFact {
    pub fn new(is_following: bool, last_updated: i64) -> Self {
        Self {
            is_following,
            last_updated,
            version: 0,
        }
    }
}

/// Follower/following counters for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub followers_count: u64,
    pub following_count: u64,

    /// Epoch millis of the last write
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

/// Which counter a mutation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Followers,
    Following,
}

impl UserStats {
    pub(crate) fn counter_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::Followers => &mut self.followers_count,
            Counter::Following => &mut self.following_count,
        }
    }
}

/// Partial update for [`UserStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsPatch {
    pub followers_count: Option<u64>,
    pub following_count: Option<u64>,
}

impl StatsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn followers(mut self, count: u64) -> Self {
        self.followers_count = Some(count);
        self
    }

    pub fn following(mut self, count: u64) -> Self {
        self.following_count = Some(count);
        self
    }
}
