//! Integration tests for followgraph
//!
//! These tests drive the cache through its public API with scripted
//! backends and real persistence stores.

use async_trait::async_trait;
use followgraph::cache::{
    CacheChange, CacheSettings, CacheSnapshot, ChangeOrigin, FollowKey, SocialGraphCache,
    StatsPatch,
};
use followgraph::clock::ManualClock;
use followgraph::persistence::{
    JsonFileStore, MemoryStore, PersistenceAdapter, SqliteStore, SqliteStoreConfig,
};
use followgraph::remote::{
    EventHandler, EventStream, FollowEvent, FollowStatus, InMemoryFollowService, MutationOutcome,
    RemoteFollowService, SubscriptionHandle,
};
use followgraph::{FollowGraphError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};

const T0: i64 = 1_700_000_000_000;

/// Backend whose mutations block until the test releases them
#[derive(Default)]
struct GatedRemote {
    gates: Mutex<VecDeque<oneshot::Receiver<MutationOutcome>>>,
    started: Notify,
}

impl GatedRemote {
    /// Queue a gate for the next mutation; send on the returned half to release it
    fn gate(&self) -> oneshot::Sender<MutationOutcome> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().push_back(rx);
        tx
    }

    async fn pass(&self) -> Result<MutationOutcome> {
        let gate = self.gates.lock().unwrap().pop_front();
        self.started.notify_one();
        match gate {
            Some(rx) => rx
                .await
                .map_err(|_| FollowGraphError::Network("gate dropped".to_string())),
            None => Ok(MutationOutcome::ok()),
        }
    }
}

#[async_trait]
impl RemoteFollowService for GatedRemote {
    async fn follow_user(&self, _follower_id: &str, _target_id: &str) -> Result<MutationOutcome> {
        self.pass().await
    }

    async fn unfollow_user(&self, _follower_id: &str, _target_id: &str) -> Result<MutationOutcome> {
        self.pass().await
    }

    async fn is_following(&self, _follower_id: &str, _target_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn follow_status_batch(
        &self,
        _follower_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<FollowStatus>> {
        Ok(user_ids
            .iter()
            .map(|id| FollowStatus {
                user_id: id.clone(),
                is_following: false,
                is_followed_by: false,
            })
            .collect())
    }

    fn subscribe_to_follow_events(
        &self,
        user_id: &str,
        _handler: EventHandler,
    ) -> Result<SubscriptionHandle> {
        Ok(SubscriptionHandle::new(1, user_id))
    }

    fn unsubscribe_from_follow_events(&self, _handle: &SubscriptionHandle) {}
}

fn gated_cache() -> (SocialGraphCache, Arc<GatedRemote>) {
    let remote = Arc::new(GatedRemote::default());
    let cache = SocialGraphCache::with_clock(
        remote.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(T0)),
        CacheSettings::default(),
    );
    (cache, remote)
}

fn seed(cache: &SocialGraphCache, user: &str, followers: u64, following: u64) {
    cache
        .update_user_stats(
            user,
            StatsPatch::new().followers(followers).following(following),
        )
        .unwrap();
}

mod optimistic_tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_commit_then_refused_unfollow() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 5, 2);

        // Follow, visible before the backend answers
        let gate = remote.gate();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(true));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 6);

        gate.send(MutationOutcome::ok()).unwrap();
        assert!(task.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(true));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 6);

        // Unfollow that the backend refuses
        let gate = remote.gate();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.unfollow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 5);

        gate.send(MutationOutcome::failed("user_blocked")).unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("user_blocked"));
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(true));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 6);
    }

    #[tokio::test]
    async fn test_committed_newer_write_keeps_its_state() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 10, 0);

        let follow_gate = remote.gate();
        let follow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;

        let unfollow_gate = remote.gate();
        let unfollow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.unfollow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));

        // The older follow fails after the unfollow already overwrote the pair
        follow_gate
            .send(MutationOutcome::failed("rate_limit_exceeded"))
            .unwrap();
        assert!(!follow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);

        unfollow_gate.send(MutationOutcome::ok()).unwrap();
        assert!(unfollow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);
    }

    #[tokio::test]
    async fn test_overlapping_failures_restore_original_state() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 10, 0);

        let follow_gate = remote.gate();
        let follow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;

        let unfollow_gate = remote.gate();
        let unfollow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.unfollow_user("u1", "u2").await })
        };
        remote.started.notified().await;

        follow_gate
            .send(MutationOutcome::failed("rate_limit_exceeded"))
            .unwrap();
        assert!(!follow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));

        unfollow_gate
            .send(MutationOutcome::failed("rate_limit_exceeded"))
            .unwrap();
        assert!(!unfollow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);
    }

    #[tokio::test]
    async fn test_newer_failure_returns_pair_to_older_write() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 10, 0);

        let follow_gate = remote.gate();
        let follow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;

        let unfollow_gate = remote.gate();
        let unfollow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.unfollow_user("u1", "u2").await })
        };
        remote.started.notified().await;

        // The unfollow fails first: the follow is still pending, so it shows again
        unfollow_gate.send(MutationOutcome::failed("nope")).unwrap();
        assert!(!unfollow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(true));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 11);

        follow_gate.send(MutationOutcome::failed("nope")).unwrap();
        assert!(!follow.await.unwrap().unwrap().success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);
    }

    #[tokio::test]
    async fn test_three_overlapping_failures_restore_original_state() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 10, 0);
        seed(&cache, "u1", 0, 3);

        let mut gates = Vec::new();
        let mut tasks = Vec::new();
        for follow in [true, false, true] {
            gates.push(Some(remote.gate()));
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                if follow {
                    cache.follow_user("u1", "u2").await
                } else {
                    cache.unfollow_user("u1", "u2").await
                }
            }));
            remote.started.notified().await;
        }
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 11);

        // Middle, newest, then oldest
        for index in [1, 2, 0] {
            let gate = gates[index].take().unwrap();
            gate.send(MutationOutcome::failed("nope")).unwrap();
        }
        for task in tasks {
            assert!(!task.await.unwrap().unwrap().success);
        }

        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);
        assert_eq!(cache.get_user_stats("u1").unwrap().following_count, 3);
    }

    #[tokio::test]
    async fn test_cancelled_mutation_rolls_back() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u2", 10, 0);

        let _gate = remote.gate();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 11);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u2").unwrap().followers_count, 10);
    }

    #[tokio::test]
    async fn test_rollback_after_invalidation_restores_fact() {
        let (cache, remote) = gated_cache();

        let gate = remote.gate();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        cache.invalidate_follow_status("u1", "u2");

        gate.send(MutationOutcome::failed("nope")).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
    }

    #[tokio::test]
    async fn test_dropped_backend_reply_rolls_back() {
        let (cache, remote) = gated_cache();
        seed(&cache, "u1", 0, 4);

        let gate = remote.gate();
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.follow_user("u1", "u2").await })
        };
        remote.started.notified().await;
        assert_eq!(cache.get_user_stats("u1").unwrap().following_count, 5);
        drop(gate);

        let outcome = task.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(false));
        assert_eq!(cache.get_user_stats("u1").unwrap().following_count, 4);
    }

    #[tokio::test]
    async fn test_change_stream_reports_optimistic_and_rollback() {
        let (cache, remote) = gated_cache();
        let mut changes = cache.changes();
        let gate = remote.gate();
        gate.send(MutationOutcome::failed("nope")).unwrap();

        cache.follow_user("u1", "u2").await.unwrap();

        let origins: Vec<ChangeOrigin> = std::iter::from_fn(|| changes.try_recv().ok())
            .filter_map(|change| match change {
                CacheChange::FollowStatus { origin, .. } => Some(origin),
                _ => None,
            })
            .collect();
        assert_eq!(origins, vec![ChangeOrigin::Optimistic, ChangeOrigin::Rollback]);
    }
}

mod push_tests {
    use super::*;

    fn cache_with(remote: Arc<InMemoryFollowService>) -> SocialGraphCache {
        SocialGraphCache::new(remote, Arc::new(MemoryStore::new()), CacheSettings::default())
    }

    #[tokio::test]
    async fn test_other_users_follow_reaches_subscriber() {
        let remote = Arc::new(InMemoryFollowService::new());
        let alice = cache_with(remote.clone());
        let bob = cache_with(remote.clone());
        alice.subscribe_to_user("alice", None).unwrap();

        bob.follow_user("bob", "alice").await.unwrap();
        assert_eq!(alice.get_follow_status("bob", "alice"), Some(true));

        bob.unfollow_user("bob", "alice").await.unwrap();
        assert_eq!(alice.get_follow_status("bob", "alice"), Some(false));
    }

    #[tokio::test]
    async fn test_callback_sees_every_event_once() {
        let remote = Arc::new(InMemoryFollowService::new());
        let cache = cache_with(remote.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |event: &FollowEvent| {
            sink.lock().unwrap().push(event.event_id.clone());
        });
        cache.subscribe_to_user("u2", Some(handler)).unwrap();

        let event =
            FollowEvent::inserted(EventStream::Followers, "u1", "u2").with_event_id("INSERT_99");
        remote.push_event("u2", event.clone());
        remote.push_event("u2", event);

        assert_eq!(*seen.lock().unwrap(), vec![Some("INSERT_99".to_string())]);
    }

    #[tokio::test]
    async fn test_unsubscribed_cache_ignores_events() {
        let remote = Arc::new(InMemoryFollowService::new());
        let cache = cache_with(remote.clone());
        cache.subscribe_to_user("u2", None).unwrap();
        cache.unsubscribe_from_user("u2");

        remote.push_event(
            "u2",
            FollowEvent::inserted(EventStream::Followers, "u1", "u2"),
        );
        assert_eq!(cache.get_follow_status("u1", "u2"), None);
    }

    #[tokio::test]
    async fn test_push_never_touches_counters() {
        let remote = Arc::new(InMemoryFollowService::new());
        let cache = cache_with(remote.clone());
        seed(&cache, "u2", 3, 3);
        cache.subscribe_to_user("u2", None).unwrap();

        remote.push_event(
            "u2",
            FollowEvent::inserted(EventStream::Followers, "u9", "u2"),
        );
        let stats = cache.get_user_stats("u2").unwrap();
        assert_eq!((stats.followers_count, stats.following_count), (3, 3));
    }
}

mod persistence_tests {
    use super::*;

    fn sqlite_store(dir: &TempDir) -> Arc<SqliteStore> {
        Arc::new(
            SqliteStore::new(SqliteStoreConfig {
                path: dir.path().join("cache.db"),
                wal_mode: true,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_state_survives_restart_with_sqlite() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(T0));

        {
            let cache = SocialGraphCache::with_clock(
                Arc::new(InMemoryFollowService::new()),
                sqlite_store(&dir),
                clock.clone(),
                CacheSettings::default(),
            );
            seed(&cache, "u2", 5, 0);
            cache.follow_user("u1", "u2").await.unwrap();
            cache.subscribe_to_user("u2", None).unwrap();
            cache.initialize();
        }

        let remote = Arc::new(InMemoryFollowService::new());
        let restored = SocialGraphCache::with_clock(
            remote.clone(),
            sqlite_store(&dir),
            clock,
            CacheSettings::default(),
        );

        assert_eq!(restored.get_follow_status("u1", "u2"), Some(true));
        assert_eq!(restored.get_user_stats("u2").unwrap().followers_count, 6);
        // Transient state starts over
        assert_eq!(restored.subscription_count(), 0);
        assert!(!restored.is_initialized());
        assert_eq!(remote.subscribe_calls(), 0);
    }

    #[test]
    fn test_expired_entries_load_but_read_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(T0));

        let cache = SocialGraphCache::with_clock(
            Arc::new(InMemoryFollowService::new()),
            store.clone(),
            clock.clone(),
            CacheSettings::default(),
        );
        cache.set_follow_status("u1", "u2", true).unwrap();
        drop(cache);

        clock.advance(Duration::from_secs(301));
        let restored = SocialGraphCache::with_clock(
            Arc::new(InMemoryFollowService::new()),
            store,
            clock,
            CacheSettings::default(),
        );
        assert_eq!(restored.follow_state_count(), 1);
        assert_eq!(restored.get_follow_status("u1", "u2"), None);
        assert_eq!(restored.clear_expired_cache().follow_states_removed, 1);
    }

    #[test]
    fn test_snapshot_matches_persisted_blob() {
        let store = Arc::new(MemoryStore::new());
        let cache = SocialGraphCache::with_clock(
            Arc::new(InMemoryFollowService::new()),
            store.clone(),
            Arc::new(ManualClock::new(T0)),
            CacheSettings::default(),
        );
        cache.set_follow_status("a", "b", true).unwrap();
        seed(&cache, "b", 1, 0);

        let blob = store.get("follow-store").unwrap().unwrap();
        assert_eq!(blob, cache.snapshot().to_json().unwrap());
        assert_eq!(CacheSnapshot::from_json(&blob).unwrap().user_stats.len(), 1);
        assert_eq!(cache.snapshot().follow_states[0].0, FollowKey::new("a", "b").to_string());
    }

    #[test]
    fn test_custom_storage_key() {
        let store = Arc::new(MemoryStore::new());
        let settings = CacheSettings {
            storage_key: "graph-v2".to_string(),
            ..CacheSettings::default()
        };
        let cache = SocialGraphCache::new(
            Arc::new(InMemoryFollowService::new()),
            store.clone(),
            settings,
        );
        cache.set_follow_status("a", "b", false).unwrap();

        assert!(store.get("graph-v2").unwrap().is_some());
        assert!(store.get("follow-store").unwrap().is_none());
    }
}

mod ttl_tests {
    use super::*;

    #[tokio::test]
    async fn test_expired_counters_are_not_adjusted() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = SocialGraphCache::with_clock(
            Arc::new(InMemoryFollowService::new()),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            CacheSettings::default(),
        );
        seed(&cache, "u2", 5, 0);
        clock.advance(Duration::from_secs(601));

        cache.follow_user("u1", "u2").await.unwrap();
        assert!(cache.get_user_stats("u2").is_none());
        assert_eq!(cache.get_follow_status("u1", "u2"), Some(true));
    }

    #[tokio::test]
    async fn test_resolve_refetches_after_expiry() {
        let clock = Arc::new(ManualClock::new(T0));
        let remote = Arc::new(InMemoryFollowService::with_edges([("u1", "u2")]));
        let cache = SocialGraphCache::with_clock(
            remote.clone(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            CacheSettings::default(),
        );
        cache.set_follow_status("u1", "u2", false).unwrap();
        assert!(!cache.resolve_follow_status("u1", "u2").await.unwrap());

        clock.advance(Duration::from_secs(301));
        assert!(cache.resolve_follow_status("u1", "u2").await.unwrap());
    }

    #[tokio::test]
    async fn test_short_ttls_from_settings() {
        let clock = Arc::new(ManualClock::new(T0));
        let settings = CacheSettings {
            follow_ttl: Duration::from_secs(1),
            stats_ttl: Duration::from_secs(2),
            ..CacheSettings::default()
        };
        let cache = SocialGraphCache::with_clock(
            Arc::new(InMemoryFollowService::new()),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            settings,
        );
        cache.set_follow_status("u1", "u2", true).unwrap();
        seed(&cache, "u2", 1, 1);

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(cache.get_follow_status("u1", "u2"), None);
        assert!(cache.get_user_stats("u2").is_some());
    }
}
