//! Persisted form of the cache
//!
//! Maps are written as ordered lists of `[key, value]` pairs inside the same
//! `{"state": ..., "version": N}` envelope the mobile client's store used, so
//! a blob written by either side can warm-start the other.

use super::entries::{FollowFact, FollowKey, UserStats};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Envelope version written by this crate
pub const SNAPSHOT_VERSION: u32 = 0;

/// Array-of-pairs view of both maps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    #[serde(default)]
    pub follow_states: Vec<(String, FollowFact)>,

    #[serde(default)]
    pub user_stats: Vec<(String, UserStats)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    state: CacheSnapshot,
    #[serde(default)]
    version: u32,
}

/// Maps rebuilt from a snapshot
#[derive(Debug, Default)]
pub(crate) struct RestoredMaps {
    pub follow_states: HashMap<FollowKey, FollowFact>,
    pub user_stats: HashMap<String, UserStats>,
    pub skipped: usize,
}

impl CacheSnapshot {
    /// Build a snapshot, sorted by key so equal caches serialize identically
    pub fn from_maps(
        follow_states: &HashMap<FollowKey, FollowFact>,
        user_stats: &HashMap<String, UserStats>,
    ) -> Self {
        let mut follows: Vec<_> = follow_states.iter().collect();
        follows.sort_by(|a, b| a.0.cmp(b.0));

        let mut stats: Vec<_> = user_stats.iter().collect();
        stats.sort_by(|a, b| a.0.cmp(b.0));

        Self {
            follow_states: follows
                .into_iter()
                .map(|(key, fact)| (key.to_string(), *fact))
                .collect(),
            user_stats: stats
                .into_iter()
                .map(|(user, stats)| (user.clone(), *stats))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.follow_states.is_empty() && self.user_stats.is_empty()
    }

    /// Serialize inside the persistence envelope
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            state: self.clone(),
            version: SNAPSHOT_VERSION,
        })
    }

    /// Parse a persisted blob; accepts the bare snapshot too
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        match serde_json::from_str::<Envelope>(json) {
            Ok(envelope) => {
                if envelope.version != SNAPSHOT_VERSION {
                    tracing::warn!(
                        version = envelope.version,
                        "Unknown snapshot version, attempting to load anyway"
                    );
                }
                Ok(envelope.state)
            }
            Err(_) => serde_json::from_str(json),
        }
    }

    /// Convert back into maps, skipping entries with malformed keys
    pub(crate) fn into_maps(self) -> RestoredMaps {
        let mut restored = RestoredMaps::default();

        for (raw_key, fact) in self.follow_states {
            match raw_key.parse::<FollowKey>() {
                Ok(key) => {
                    restored.follow_states.insert(key, fact);
                }
                Err(_) => {
                    tracing::warn!(key = %raw_key, "Skipping malformed follow key in snapshot");
                    restored.skipped += 1;
                }
            }
        }

        for (user_id, stats) in self.user_stats {
            if super::entries::validate_user_id(&user_id).is_err() {
                tracing::warn!(user = %user_id, "Skipping malformed user id in snapshot");
                restored.skipped += 1;
                continue;
            }
            restored.user_stats.insert(user_id, stats);
        }

        restored
    }
}
