//! The social graph cache

use super::entries::{
    is_expired, validate_user_id, Counter, FollowFact, FollowKey, StatsPatch, UserStats,
};
use super::snapshot::CacheSnapshot;
use crate::clock::{Clock, SystemClock};
use crate::metrics;
use crate::persistence::PersistenceAdapter;
use crate::remote::{
    ChangeType, EventHandler, EventStream, FollowEvent, MutationOutcome, RemoteFollowService,
    SubscriptionHandle, CANNOT_FOLLOW_SELF,
};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Follow facts stay fresh for 5 minutes
pub const FOLLOW_TTL: Duration = Duration::from_secs(5 * 60);
/// Counters stay fresh for 10 minutes
pub const STATS_TTL: Duration = Duration::from_secs(10 * 60);
/// Background sweep period
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub follow_ttl: Duration,
    pub stats_ttl: Duration,
    pub sweep_interval: Duration,
    pub change_channel_capacity: usize,
    pub storage_key: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            follow_ttl: FOLLOW_TTL,
            stats_ttl: STATS_TTL,
            sweep_interval: SWEEP_INTERVAL,
            change_channel_capacity: 256,
            storage_key: "follow-store".to_string(),
        }
    }
}

/// What caused a follow fact to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Local mutation applied before the backend confirmed it
    Optimistic,
    /// Reverting an optimistic write the backend refused
    Rollback,
    /// Server-pushed event
    Push,
    /// Answer fetched from the backend on a cache miss
    Fetched,
    /// Written directly by the host application
    Manual,
}

/// Entries removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub follow_states_removed: usize,
    pub user_stats_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.follow_states_removed + self.user_stats_removed
    }
}

/// Store-wide change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    FollowStatus {
        key: FollowKey,
        is_following: bool,
        origin: ChangeOrigin,
    },
    FollowStatusInvalidated(FollowKey),
    UserStats {
        user_id: String,
        stats: UserStats,
    },
    UserStatsInvalidated(String),
    Swept(SweepReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationKind {
    Follow,
    Unfollow,
}

impl MutationKind {
    fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Follow => "follow",
            MutationKind::Unfollow => "unfollow",
        }
    }

    fn target_state(&self) -> bool {
        matches!(self, MutationKind::Follow)
    }
}

/// Bookkeeping for an optimistic write awaiting confirmation
#[derive(Debug)]
struct PendingMutation {
    key: FollowKey,
    version: u64,
    /// Deltas actually applied (after flooring), so rollback reverses exactly them
    followers_delta: i64,
    following_delta: i64,
}

/// Resolves an optimistic write exactly once
///
/// A mutation future dropped before the backend answers rolls its write back,
/// the same as a transport error.
struct PendingGuard<'a> {
    cache: &'a SocialGraphCache,
    pending: Option<PendingMutation>,
    restore_to: bool,
}

impl PendingGuard<'_> {
    fn settle(mut self) {
        if let Some(pending) = self.pending.take() {
            self.cache.settle(&pending);
        }
    }

    fn roll_back(mut self) {
        if let Some(pending) = self.pending.take() {
            self.cache.rollback(pending, self.restore_to);
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!(key = %pending.key, "Mutation dropped before the backend answered");
            self.cache.rollback(pending, self.restore_to);
        }
    }
}

/// Rollback work handed down by superseded mutations on the same pair
#[derive(Debug, Default, Clone, Copy)]
struct Inherited {
    followers_delta: i64,
    following_delta: i64,
    /// Restore value of the oldest failed mutation, keyed by its version
    restore: Option<(u64, bool)>,
}

impl Inherited {
    fn absorb(&mut self, followers_delta: i64, following_delta: i64, restore: (u64, bool)) {
        self.followers_delta += followers_delta;
        self.following_delta += following_delta;
        self.restore = Some(oldest_restore(self.restore, restore));
    }
}

fn oldest_restore(current: Option<(u64, bool)>, candidate: (u64, bool)) -> (u64, bool) {
    match current {
        Some(current) if current.0 < candidate.0 => current,
        _ => candidate,
    }
}

#[derive(Debug)]
struct InFlight {
    key: FollowKey,
    is_following: bool,
    inherited: Inherited,
}

/// Copy-on-write maps plus the write stamp counter
#[derive(Debug, Default)]
struct GraphState {
    follow_states: Arc<HashMap<FollowKey, FollowFact>>,
    user_stats: Arc<HashMap<String, UserStats>>,
    last_version: u64,
    /// Bumped on every change, orders snapshots for persistence
    revision: u64,
    /// Optimistic writes still waiting on the backend, by version
    in_flight: HashMap<u64, InFlight>,
}

impl GraphState {
    fn stamp(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn put_fact(&mut self, key: FollowKey, is_following: bool, now: i64) -> u64 {
        let version = self.stamp();
        self.put_fact_at(key, is_following, now, version);
        version
    }

    /// Write a fact under an existing version, handing the pair back to its writer
    fn put_fact_at(&mut self, key: FollowKey, is_following: bool, now: i64, version: u64) {
        Arc::make_mut(&mut self.follow_states).insert(
            key,
            FollowFact {
                is_following,
                last_updated: now,
                version,
            },
        );
    }

    /// Newest optimistic write on `key` still waiting on the backend
    fn newest_in_flight(&self, key: &FollowKey) -> Option<u64> {
        self.in_flight
            .iter()
            .filter(|(_, pending)| &pending.key == key)
            .map(|(version, _)| *version)
            .max()
    }

    /// Shift one counter of a live stats entry; returns the delta applied
    fn adjust(
        &mut self,
        user_id: &str,
        counter: Counter,
        delta: i64,
        now: i64,
        ttl: Duration,
    ) -> Option<(i64, UserStats)> {
        match self.user_stats.get(user_id) {
            Some(stats) if !is_expired(stats.last_updated, now, ttl) => {}
            _ => return None,
        }

        let stats = Arc::make_mut(&mut self.user_stats).get_mut(user_id)?;
        let slot = stats.counter_mut(counter);
        let before = *slot as i64;
        let after = (before + delta).max(0);
        *slot = after as u64;
        stats.last_updated = now;
        Some((after - before, *stats))
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    sweeper: Option<JoinHandle<()>>,
}

struct CacheInner {
    state: RwLock<GraphState>,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    lifecycle: Mutex<Lifecycle>,
    remote: Arc<dyn RemoteFollowService>,
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    changes: broadcast::Sender<CacheChange>,
    /// Revision of the last snapshot handed to the store
    persisted: Mutex<u64>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.get_mut() {
            if let Some(task) = lifecycle.sweeper.take() {
                task.abort();
            }
        }
        if let Ok(subscriptions) = self.subscriptions.get_mut() {
            for (_, handle) in subscriptions.drain() {
                self.remote.unsubscribe_from_follow_events(&handle);
            }
        }
    }
}

/// Optimistic, TTL-bounded cache of follow relationships and counters
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct SocialGraphCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for SocialGraphCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocialGraphCache")
            .field("follow_states", &self.follow_state_count())
            .field("user_stats", &self.user_stats_count())
            .field("subscriptions", &self.subscription_count())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl SocialGraphCache {
    /// Create a cache on the wall clock, warm-started from `store`
    pub fn new(
        remote: Arc<dyn RemoteFollowService>,
        store: Arc<dyn PersistenceAdapter>,
        settings: CacheSettings,
    ) -> Self {
        Self::with_clock(remote, store, Arc::new(SystemClock), settings)
    }

    /// Create a cache with an explicit time source
    pub fn with_clock(
        remote: Arc<dyn RemoteFollowService>,
        store: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        let state = Self::restore(store.as_ref(), &settings.storage_key);
        let (changes, _) = broadcast::channel(settings.change_channel_capacity.max(1));

        Self {
            inner: Arc::new(CacheInner {
                state: RwLock::new(state),
                subscriptions: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
                remote,
                store,
                clock,
                settings,
                changes,
                persisted: Mutex::new(0),
            }),
        }
    }

    /// Load the persisted snapshot; transient state always starts empty
    fn restore(store: &dyn PersistenceAdapter, key: &str) -> GraphState {
        let blob = match store.get(key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return GraphState::default(),
            Err(e) => {
                tracing::warn!(error = %e, key, "Failed to read persisted cache, starting empty");
                metrics::record_persistence_failure("load");
                return GraphState::default();
            }
        };

        let snapshot = match CacheSnapshot::from_json(&blob) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, key, "Persisted cache is unreadable, starting empty");
                metrics::record_persistence_failure("load");
                return GraphState::default();
            }
        };

        let restored = snapshot.into_maps();
        tracing::info!(
            follow_states = restored.follow_states.len(),
            user_stats = restored.user_stats.len(),
            skipped = restored.skipped,
            "Restored follow cache"
        );

        GraphState {
            follow_states: Arc::new(restored.follow_states),
            user_stats: Arc::new(restored.user_stats),
            ..GraphState::default()
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, GraphState> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, SubscriptionHandle>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Subscribe to every state change
    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.changes.subscribe()
    }

    /// Run `apply` under the write lock, then persist and publish what changed
    fn mutate<R>(&self, apply: impl FnOnce(&mut GraphState, &mut Vec<CacheChange>) -> R) -> R {
        let mut changes = Vec::new();
        let (result, revision, follow_states, user_stats) = {
            let mut state = self.write_state();
            let result = apply(&mut *state, &mut changes);
            if !changes.is_empty() {
                state.revision += 1;
            }
            (
                result,
                state.revision,
                state.follow_states.clone(),
                state.user_stats.clone(),
            )
        };

        if !changes.is_empty() {
            metrics::set_entries("follow_states", follow_states.len());
            metrics::set_entries("user_stats", user_stats.len());
            self.persist(revision, CacheSnapshot::from_maps(&follow_states, &user_stats));
            for change in changes {
                // No receivers is fine
                let _ = self.inner.changes.send(change);
            }
        }

        result
    }

    /// Store the snapshot taken at `revision` unless a newer one got there first
    ///
    /// Best effort: failures are logged and memory is left as is. An empty
    /// cache removes the stored copy instead of writing an empty blob.
    fn persist(&self, revision: u64, snapshot: CacheSnapshot) {
        let mut persisted = self
            .inner
            .persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if revision <= *persisted {
            tracing::trace!(revision, latest = *persisted, "Skipping stale snapshot");
            return;
        }
        *persisted = revision;

        let key = &self.inner.settings.storage_key;
        let result = if snapshot.is_empty() {
            self.inner.store.remove(key)
        } else {
            snapshot
                .to_json()
                .map_err(crate::FollowGraphError::from)
                .and_then(|json| self.inner.store.set(key, &json))
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, key = %key, "Failed to persist follow cache");
            metrics::record_persistence_failure("save");
        }
    }

    fn write_fact(&self, key: FollowKey, is_following: bool, origin: ChangeOrigin) -> u64 {
        let now = self.now();
        self.mutate(|state, changes| {
            let version = state.put_fact(key.clone(), is_following, now);
            changes.push(CacheChange::FollowStatus {
                key,
                is_following,
                origin,
            });
            version
        })
    }

    /// Write a fetched answer unless a newer write landed while it was in flight
    fn write_fetched(&self, key: FollowKey, is_following: bool, issued_at: u64) -> bool {
        let now = self.now();
        self.mutate(|state, changes| {
            if let Some(fact) = state.follow_states.get(&key) {
                if fact.version > issued_at {
                    return false;
                }
            }
            state.put_fact(key.clone(), is_following, now);
            changes.push(CacheChange::FollowStatus {
                key,
                is_following,
                origin: ChangeOrigin::Fetched,
            });
            true
        })
    }

    fn current_version(&self) -> u64 {
        self.read_state().last_version
    }

    // ------------------------------------------------------------------
    // Mutations

    /// Follow `target_id` as `current_user_id`
    ///
    /// The fact and any live counters change before the backend is asked, so
    /// readers see the follow immediately. A refusal or transport error rolls
    /// the write back and comes back as `Ok` with `success: false`; only
    /// malformed ids produce `Err`.
    pub async fn follow_user(
        &self,
        current_user_id: &str,
        target_user_id: &str,
    ) -> Result<MutationOutcome> {
        self.run_mutation(MutationKind::Follow, current_user_id, target_user_id)
            .await
    }

    /// Unfollow `target_id` as `current_user_id`; mirror of [`Self::follow_user`]
    pub async fn unfollow_user(
        &self,
        current_user_id: &str,
        target_user_id: &str,
    ) -> Result<MutationOutcome> {
        self.run_mutation(MutationKind::Unfollow, current_user_id, target_user_id)
            .await
    }

    async fn run_mutation(
        &self,
        kind: MutationKind,
        current_user_id: &str,
        target_user_id: &str,
    ) -> Result<MutationOutcome> {
        validate_user_id(current_user_id)?;
        validate_user_id(target_user_id)?;

        if current_user_id == target_user_id {
            metrics::record_mutation(kind.as_str(), "rejected");
            return Ok(MutationOutcome::failed(CANNOT_FOLLOW_SELF));
        }

        let key = FollowKey::new(current_user_id, target_user_id);
        let pending = PendingGuard {
            cache: self,
            pending: Some(self.apply_optimistic(key, kind.target_state())),
            restore_to: !kind.target_state(),
        };

        let result = match kind {
            MutationKind::Follow => {
                self.inner
                    .remote
                    .follow_user(current_user_id, target_user_id)
                    .await
            }
            MutationKind::Unfollow => {
                self.inner
                    .remote
                    .unfollow_user(current_user_id, target_user_id)
                    .await
            }
        };

        let outcome = match result {
            Ok(outcome) if outcome.success => {
                pending.settle();
                metrics::record_mutation(kind.as_str(), "committed");
                tracing::debug!(
                    kind = kind.as_str(),
                    follower = current_user_id,
                    target = target_user_id,
                    "Optimistic write committed"
                );
                return Ok(outcome);
            }
            Ok(outcome) => {
                metrics::record_mutation(kind.as_str(), "refused");
                tracing::info!(
                    kind = kind.as_str(),
                    follower = current_user_id,
                    target = target_user_id,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "Backend refused follow change"
                );
                outcome
            }
            Err(e) => {
                metrics::record_mutation(kind.as_str(), "error");
                tracing::warn!(
                    kind = kind.as_str(),
                    follower = current_user_id,
                    target = target_user_id,
                    error = %e,
                    "Follow change failed"
                );
                MutationOutcome::failed(e.to_string())
            }
        };

        pending.roll_back();
        Ok(outcome)
    }

    fn apply_optimistic(&self, key: FollowKey, is_following: bool) -> PendingMutation {
        let now = self.now();
        let ttl = self.inner.settings.stats_ttl;
        let delta = if is_following { 1 } else { -1 };

        self.mutate(|state, changes| {
            let version = state.put_fact(key.clone(), is_following, now);
            state.in_flight.insert(
                version,
                InFlight {
                    key: key.clone(),
                    is_following,
                    inherited: Inherited::default(),
                },
            );
            changes.push(CacheChange::FollowStatus {
                key: key.clone(),
                is_following,
                origin: ChangeOrigin::Optimistic,
            });

            let followers_delta =
                match state.adjust(&key.target_id, Counter::Followers, delta, now, ttl) {
                    Some((applied, stats)) => {
                        changes.push(CacheChange::UserStats {
                            user_id: key.target_id.clone(),
                            stats,
                        });
                        applied
                    }
                    None => 0,
                };
            let following_delta =
                match state.adjust(&key.follower_id, Counter::Following, delta, now, ttl) {
                    Some((applied, stats)) => {
                        changes.push(CacheChange::UserStats {
                            user_id: key.follower_id.clone(),
                            stats,
                        });
                        applied
                    }
                    None => 0,
                };

            PendingMutation {
                key,
                version,
                followers_delta,
                following_delta,
            }
        })
    }

    /// Drop bookkeeping for a committed write; whatever it inherited stays applied
    fn settle(&self, pending: &PendingMutation) {
        self.write_state().in_flight.remove(&pending.version);
    }

    /// Revert an optimistic write, or hand the revert to another write in flight
    ///
    /// When a newer mutation on the same pair owns the fact and is still in
    /// flight, this write's counter deltas and restore value move onto it: if
    /// that one fails too it undoes both, and if it commits its state stands.
    /// Any other newer write owns the pair outright and the rollback is
    /// dropped. When an older mutation is still in flight, the pair goes back
    /// to that mutation's optimistic value.
    fn rollback(&self, pending: PendingMutation, restore_to: bool) {
        let now = self.now();
        let ttl = self.inner.settings.stats_ttl;

        let disposition = self.mutate(|state, changes| {
            let inherited = state
                .in_flight
                .remove(&pending.version)
                .map(|entry| entry.inherited)
                .unwrap_or_default();
            let followers_delta = pending.followers_delta + inherited.followers_delta;
            let following_delta = pending.following_delta + inherited.following_delta;
            let restore = oldest_restore(inherited.restore, (pending.version, restore_to));

            let owner = state
                .follow_states
                .get(&pending.key)
                .map(|fact| fact.version)
                .filter(|version| *version != pending.version);
            if let Some(owner) = owner {
                return match state.in_flight.get_mut(&owner) {
                    Some(next) => {
                        next.inherited.absorb(followers_delta, following_delta, restore);
                        "handed_off"
                    }
                    None => "superseded",
                };
            }

            // Counters settle here; an older write still in flight only takes the restore value
            let older = state.newest_in_flight(&pending.key).and_then(|version| {
                let older = state.in_flight.get_mut(&version)?;
                older.inherited.absorb(0, 0, restore);
                Some((version, older.is_following))
            });
            let is_following = match older {
                Some((version, is_following)) => {
                    state.put_fact_at(pending.key.clone(), is_following, now, version);
                    is_following
                }
                None => {
                    state.put_fact(pending.key.clone(), restore.1, now);
                    restore.1
                }
            };
            changes.push(CacheChange::FollowStatus {
                key: pending.key.clone(),
                is_following,
                origin: ChangeOrigin::Rollback,
            });

            for (user_id, counter, delta) in [
                (&pending.key.target_id, Counter::Followers, followers_delta),
                (&pending.key.follower_id, Counter::Following, following_delta),
            ] {
                if delta == 0 {
                    continue;
                }
                if let Some((_, stats)) = state.adjust(user_id, counter, -delta, now, ttl) {
                    changes.push(CacheChange::UserStats {
                        user_id: user_id.clone(),
                        stats,
                    });
                }
            }
            "applied"
        });

        metrics::record_rollback(disposition);
        match disposition {
            "applied" => tracing::debug!(key = %pending.key, "Rolled back optimistic write"),
            "handed_off" => tracing::debug!(
                key = %pending.key,
                "Deferred rollback to the newer in-flight write"
            ),
            _ => tracing::debug!(key = %pending.key, "Skipped rollback, a newer write owns this pair"),
        }
    }

    // ------------------------------------------------------------------
    // Reads

    /// Cached follow state, `None` when unknown or older than the follow TTL
    pub fn get_follow_status(&self, current_user_id: &str, target_user_id: &str) -> Option<bool> {
        let key = FollowKey::new(current_user_id, target_user_id);
        let now = self.now();
        let state = self.read_state();

        match state.follow_states.get(&key) {
            None => {
                metrics::record_read("follow_states", "miss");
                None
            }
            Some(fact) if is_expired(fact.last_updated, now, self.inner.settings.follow_ttl) => {
                metrics::record_read("follow_states", "expired");
                None
            }
            Some(fact) => {
                metrics::record_read("follow_states", "hit");
                Some(fact.is_following)
            }
        }
    }

    /// Cached counters, `None` when unknown or older than the stats TTL
    pub fn get_user_stats(&self, user_id: &str) -> Option<UserStats> {
        let now = self.now();
        let state = self.read_state();

        match state.user_stats.get(user_id) {
            None => {
                metrics::record_read("user_stats", "miss");
                None
            }
            Some(stats) if is_expired(stats.last_updated, now, self.inner.settings.stats_ttl) => {
                metrics::record_read("user_stats", "expired");
                None
            }
            Some(stats) => {
                metrics::record_read("user_stats", "hit");
                Some(*stats)
            }
        }
    }

    /// Cached follow state, asking the backend on a miss
    pub async fn resolve_follow_status(
        &self,
        current_user_id: &str,
        target_user_id: &str,
    ) -> Result<bool> {
        validate_user_id(current_user_id)?;
        validate_user_id(target_user_id)?;

        if let Some(cached) = self.get_follow_status(current_user_id, target_user_id) {
            return Ok(cached);
        }

        let issued_at = self.current_version();
        let is_following = self
            .inner
            .remote
            .is_following(current_user_id, target_user_id)
            .await?;

        let key = FollowKey::new(current_user_id, target_user_id);
        if !self.write_fetched(key, is_following, issued_at) {
            // A local write landed meanwhile; it is the better answer
            if let Some(newer) = self.get_follow_status(current_user_id, target_user_id) {
                return Ok(newer);
            }
        }
        Ok(is_following)
    }

    /// Seed follow facts for `target_ids` in one backend round trip
    ///
    /// Targets with a live fact, malformed ids and `current_user_id` itself
    /// are skipped. Returns how many facts were written.
    pub async fn prefetch_follow_statuses(
        &self,
        current_user_id: &str,
        target_ids: &[String],
    ) -> Result<usize> {
        validate_user_id(current_user_id)?;

        let wanted: Vec<String> = target_ids
            .iter()
            .filter(|id| id.as_str() != current_user_id && validate_user_id(id).is_ok())
            .filter(|id| self.get_follow_status(current_user_id, id).is_none())
            .cloned()
            .collect();

        if wanted.is_empty() {
            return Ok(0);
        }

        let issued_at = self.current_version();
        let statuses = self
            .inner
            .remote
            .follow_status_batch(current_user_id, &wanted)
            .await?;

        let mut written = 0;
        for status in statuses {
            if !wanted.contains(&status.user_id) {
                continue;
            }
            let key = FollowKey::new(current_user_id, status.user_id);
            if self.write_fetched(key, status.is_following, issued_at) {
                written += 1;
            }
        }

        tracing::debug!(follower = current_user_id, requested = wanted.len(), written, "Prefetched follow statuses");
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Direct writes

    /// Merge `patch` into the user's counters and refresh the timestamp
    ///
    /// Counters missing from the patch keep their live value, or 0 when the
    /// user has no live entry.
    pub fn update_user_stats(&self, user_id: &str, patch: StatsPatch) -> Result<()> {
        validate_user_id(user_id)?;
        let now = self.now();
        let ttl = self.inner.settings.stats_ttl;

        self.mutate(|state, changes| {
            let base = state
                .user_stats
                .get(user_id)
                .filter(|s| !is_expired(s.last_updated, now, ttl))
                .copied()
                .unwrap_or_default();

            let stats = UserStats {
                followers_count: patch.followers_count.unwrap_or(base.followers_count),
                following_count: patch.following_count.unwrap_or(base.following_count),
                last_updated: now,
            };
            Arc::make_mut(&mut state.user_stats).insert(user_id.to_string(), stats);
            changes.push(CacheChange::UserStats {
                user_id: user_id.to_string(),
                stats,
            });
        });
        Ok(())
    }

    /// Record an authoritative follow state obtained elsewhere
    pub fn set_follow_status(
        &self,
        current_user_id: &str,
        target_user_id: &str,
        is_following: bool,
    ) -> Result<()> {
        validate_user_id(current_user_id)?;
        validate_user_id(target_user_id)?;
        self.write_fact(
            FollowKey::new(current_user_id, target_user_id),
            is_following,
            ChangeOrigin::Manual,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Push subscriptions

    /// Start applying server-pushed follow events for `user_id`
    ///
    /// A second call for the same user is a no-op. `on_event` runs after the
    /// cache has applied each event.
    pub fn subscribe_to_user(&self, user_id: &str, on_event: Option<EventHandler>) -> Result<()> {
        validate_user_id(user_id)?;

        let mut subscriptions = self.subscriptions();
        if subscriptions.contains_key(user_id) {
            tracing::trace!(user = user_id, "Already subscribed");
            return Ok(());
        }

        let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let subscribed = user_id.to_string();
        let handler: EventHandler = Arc::new(move |event: &FollowEvent| {
            if let Some(inner) = cache.upgrade() {
                SocialGraphCache { inner }.apply_push_event(&subscribed, event);
            }
            if let Some(ref callback) = on_event {
                callback(event);
            }
        });

        let handle = self
            .inner
            .remote
            .subscribe_to_follow_events(user_id, handler)?;
        subscriptions.insert(user_id.to_string(), handle);

        tracing::debug!(user = user_id, "Subscribed to follow events");
        Ok(())
    }

    /// Apply one pushed event. Counters are left alone: the server has
    /// already counted this change.
    fn apply_push_event(&self, subscribed_user: &str, event: &FollowEvent) {
        metrics::record_push_event(event.stream.as_str(), event.event_type.as_str());

        let is_following = match event.event_type {
            ChangeType::Insert => true,
            ChangeType::Delete => false,
            ChangeType::Update => return,
        };

        let Some(row) = event.row() else {
            tracing::debug!(user = subscribed_user, "Push event without a row");
            return;
        };

        let pair = match event.stream {
            EventStream::Followers => row
                .follower_id
                .as_deref()
                .map(|follower| (follower, subscribed_user)),
            EventStream::Following => row
                .following_id
                .as_deref()
                .map(|following| (subscribed_user, following)),
        };

        let Some((follower, target)) = pair else {
            tracing::debug!(user = subscribed_user, stream = event.stream.as_str(), "Push event missing counterpart id");
            return;
        };

        if validate_user_id(follower).is_err() || validate_user_id(target).is_err() {
            tracing::warn!(follower, target, "Ignoring push event with malformed ids");
            return;
        }
        if follower == target {
            return;
        }

        self.write_fact(FollowKey::new(follower, target), is_following, ChangeOrigin::Push);
    }

    /// Stop the push subscription for `user_id`, if any
    pub fn unsubscribe_from_user(&self, user_id: &str) {
        let handle = self.subscriptions().remove(user_id);
        if let Some(handle) = handle {
            self.inner.remote.unsubscribe_from_follow_events(&handle);
            tracing::debug!(user = user_id, "Unsubscribed from follow events");
        }
    }

    /// Stop every push subscription
    pub fn unsubscribe_all(&self) {
        let handles: Vec<SubscriptionHandle> = self
            .subscriptions()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            self.inner.remote.unsubscribe_from_follow_events(handle);
        }
        if !handles.is_empty() {
            tracing::debug!(count = handles.len(), "Unsubscribed from all follow events");
        }
    }

    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscriptions().contains_key(user_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    // ------------------------------------------------------------------
    // Invalidation and expiry

    /// Forget the cached fact for this pair
    pub fn invalidate_follow_status(&self, current_user_id: &str, target_user_id: &str) {
        let key = FollowKey::new(current_user_id, target_user_id);
        self.mutate(|state, changes| {
            if state.follow_states.contains_key(&key) {
                Arc::make_mut(&mut state.follow_states).remove(&key);
                changes.push(CacheChange::FollowStatusInvalidated(key));
            }
        });
    }

    /// Forget the cached counters for `user_id`
    pub fn invalidate_user_stats(&self, user_id: &str) {
        self.mutate(|state, changes| {
            if state.user_stats.contains_key(user_id) {
                Arc::make_mut(&mut state.user_stats).remove(user_id);
                changes.push(CacheChange::UserStatsInvalidated(user_id.to_string()));
            }
        });
    }

    /// Drop every entry older than its TTL
    pub fn clear_expired_cache(&self) -> SweepReport {
        let now = self.now();
        let follow_ttl = self.inner.settings.follow_ttl;
        let stats_ttl = self.inner.settings.stats_ttl;

        let report = self.mutate(|state, changes| {
            let mut report = SweepReport::default();

            let stale_follows = state
                .follow_states
                .values()
                .filter(|f| is_expired(f.last_updated, now, follow_ttl))
                .count();
            if stale_follows > 0 {
                Arc::make_mut(&mut state.follow_states)
                    .retain(|_, f| !is_expired(f.last_updated, now, follow_ttl));
                report.follow_states_removed = stale_follows;
            }

            let stale_stats = state
                .user_stats
                .values()
                .filter(|s| is_expired(s.last_updated, now, stats_ttl))
                .count();
            if stale_stats > 0 {
                Arc::make_mut(&mut state.user_stats)
                    .retain(|_, s| !is_expired(s.last_updated, now, stats_ttl));
                report.user_stats_removed = stale_stats;
            }

            if report.total() > 0 {
                changes.push(CacheChange::Swept(report));
            }
            report
        });

        if report.total() > 0 {
            metrics::record_swept("follow_states", report.follow_states_removed);
            metrics::record_swept("user_stats", report.user_stats_removed);
            tracing::debug!(
                follow_states = report.follow_states_removed,
                user_stats = report.user_stats_removed,
                "Swept expired cache entries"
            );
        }
        report
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Sweep once now and every `sweep_interval` after; idempotent
    ///
    /// The periodic sweep needs a tokio runtime. Outside one, only the
    /// immediate sweep runs.
    pub fn initialize(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.initialized {
            return;
        }

        self.clear_expired_cache();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let cache = Arc::downgrade(&self.inner);
                let period = self.inner.settings.sweep_interval;
                lifecycle.sweeper = Some(runtime.spawn(async move {
                    let start = tokio::time::Instant::now() + period;
                    let mut ticker = tokio::time::interval_at(start, period);
                    loop {
                        ticker.tick().await;
                        let Some(inner) = cache.upgrade() else {
                            break;
                        };
                        SocialGraphCache { inner }.clear_expired_cache();
                    }
                }));
            }
            Err(_) => {
                tracing::warn!("No tokio runtime, periodic cache sweep disabled");
            }
        }

        lifecycle.initialized = true;
        tracing::info!(
            interval_secs = self.inner.settings.sweep_interval.as_secs(),
            "Follow cache initialized"
        );
    }

    /// Stop the sweep task and every push subscription
    pub fn cleanup(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if let Some(task) = lifecycle.sweeper.take() {
                task.abort();
            }
            lifecycle.initialized = false;
        }
        self.unsubscribe_all();
        tracing::info!("Follow cache cleaned up");
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle().initialized
    }

    // ------------------------------------------------------------------
    // Introspection

    /// Array-of-pairs view of the current maps
    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.read_state();
        CacheSnapshot::from_maps(&state.follow_states, &state.user_stats)
    }

    /// Physically stored facts, expired ones included
    pub fn follow_state_count(&self) -> usize {
        self.read_state().follow_states.len()
    }

    /// Physically stored stats entries, expired ones included
    pub fn user_stats_count(&self) -> usize {
        self.read_state().user_stats.len()
    }
}
