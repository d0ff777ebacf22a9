//! followgraph - optimistic social graph cache
//!
//! Keeps a client-side view of "who follows whom" plus follower/following
//! counters. Writes are applied locally before the backend confirms them and
//! rolled back if it refuses; entries expire after a TTL; state survives
//! restarts through a pluggable key-value store; server-pushed events keep
//! the view current.
//!
//! # Architecture
//!
//! - **cache**: [`SocialGraphCache`] and the types it stores
//! - **remote**: backend contract plus HTTP and in-memory implementations
//! - **persistence**: snapshot storage (SQLite, JSON files, memory)
//! - **config**: YAML configuration
//! - **clock**: time source, swappable for tests
//! - **metrics**: Prometheus counters for cache activity

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod remote;

// Re-exports
pub use cache::{CacheSettings, SocialGraphCache, StatsPatch, UserStats};
pub use error::{FollowGraphError, Result};
pub use remote::{MutationOutcome, RemoteFollowService};
