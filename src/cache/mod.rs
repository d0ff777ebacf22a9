//! Follow graph cache
//!
//! In-memory maps of follow facts and per-user counters with:
//! - optimistic follow/unfollow and rollback on backend refusal
//! - TTL expiry on read plus a periodic sweep
//! - snapshot persistence after every state change
//! - push-event subscriptions that keep facts fresh

mod entries;
mod graph_cache;
mod snapshot;

pub use entries::{validate_user_id, FollowFact, FollowKey, StatsPatch, UserStats, KEY_SEPARATOR};
pub use graph_cache::{
    CacheChange, CacheSettings, ChangeOrigin, SocialGraphCache, SweepReport, FOLLOW_TTL,
    STATS_TTL, SWEEP_INTERVAL,
};
pub use snapshot::{CacheSnapshot, SNAPSHOT_VERSION};
