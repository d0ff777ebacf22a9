//! In-process follow backend
//!
//! Holds the authoritative edge set and delivers push events synchronously to
//! subscribers of both ends of an edge. Failures can be scripted, which is
//! what the cache tests use to drive rollbacks.

use super::{
    EventDeduplicator, EventHandler, EventStream, FollowEvent, FollowStatus, MutationOutcome,
    RemoteFollowService, SubscriptionHandle, CANNOT_FOLLOW_SELF,
};
use crate::{FollowGraphError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Scripted reply for the next mutation call
#[derive(Debug, Clone)]
enum ScriptedReply {
    Outcome(MutationOutcome),
    Error(String),
}

#[derive(Default)]
struct BackendState {
    edges: HashSet<(String, String)>,
    subscribers: HashMap<u64, (String, EventHandler)>,
    scripted: VecDeque<ScriptedReply>,
    unavailable: bool,
    next_handle: u64,
    next_event: u64,
    mutation_calls: usize,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
}

/// In-memory [`RemoteFollowService`]
#[derive(Default)]
pub struct InMemoryFollowService {
    state: Mutex<BackendState>,
    dedup: EventDeduplicator,
}

impl InMemoryFollowService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with `(follower, following)` edges
    pub fn with_edges<I, A, B>(edges: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let service = Self::default();
        {
            let mut state = service.lock();
            for (a, b) in edges {
                state.edges.insert((a.into(), b.into()));
            }
        }
        service
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next mutation returns `{success: false, error}` without touching edges
    pub fn fail_next(&self, error: impl Into<String>) {
        self.lock()
            .scripted
            .push_back(ScriptedReply::Outcome(MutationOutcome::failed(error)));
    }

    /// Next mutation returns a transport error
    pub fn error_next(&self, message: impl Into<String>) {
        self.lock()
            .scripted
            .push_back(ScriptedReply::Error(message.into()));
    }

    /// While unavailable every call fails with a network error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn follows(&self, follower: &str, following: &str) -> bool {
        self.lock()
            .edges
            .contains(&(follower.to_string(), following.to_string()))
    }

    pub fn followers_count(&self, user_id: &str) -> usize {
        self.lock().edges.iter().filter(|(_, b)| b == user_id).count()
    }

    pub fn following_count(&self, user_id: &str) -> usize {
        self.lock().edges.iter().filter(|(a, _)| a == user_id).count()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.lock().unsubscribe_calls
    }

    pub fn mutation_calls(&self) -> usize {
        self.lock().mutation_calls
    }

    /// Deliver `event` to every subscriber of `user_id`, as if the server
    /// pushed it. Events carrying an already-seen id are dropped.
    pub fn push_event(&self, user_id: &str, event: FollowEvent) {
        let handlers = self.handlers_for(user_id);
        self.deliver(&handlers, &event);
    }

    fn handlers_for(&self, user_id: &str) -> Vec<EventHandler> {
        self.lock()
            .subscribers
            .values()
            .filter(|(subscribed, _)| subscribed == user_id)
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    fn deliver(&self, handlers: &[EventHandler], event: &FollowEvent) {
        if let Some(ref id) = event.event_id {
            if self.dedup.is_duplicate(id) {
                tracing::debug!(event_id = %id, "Dropping duplicate push event");
                return;
            }
        }
        for handler in handlers {
            handler(event);
        }
    }

    /// Common entry for follow/unfollow: scripted replies and availability
    fn begin_mutation(&self) -> Result<Option<MutationOutcome>> {
        let mut state = self.lock();
        state.mutation_calls += 1;
        if state.unavailable {
            return Err(FollowGraphError::Network("follow backend unavailable".to_string()));
        }
        match state.scripted.pop_front() {
            Some(ScriptedReply::Outcome(outcome)) => Ok(Some(outcome)),
            Some(ScriptedReply::Error(message)) => Err(FollowGraphError::Network(message)),
            None => Ok(None),
        }
    }

    /// Apply an edge change and fan the resulting events out
    fn apply_edge(&self, follower: &str, following: &str, insert: bool) {
        let edge = (follower.to_string(), following.to_string());
        let seq = {
            let mut state = self.lock();
            let changed = if insert {
                state.edges.insert(edge)
            } else {
                state.edges.remove(&edge)
            };
            if !changed {
                return;
            }
            state.next_event += 1;
            state.next_event
        };

        let change = if insert { "INSERT" } else { "DELETE" };
        for (stream, owner) in [
            (EventStream::Followers, following),
            (EventStream::Following, follower),
        ] {
            let event = if insert {
                FollowEvent::inserted(stream, follower, following)
            } else {
                FollowEvent::deleted(stream, follower, following)
            }
            .with_event_id(format!("{}_{}_{}", change, seq, stream.as_str()));

            let handlers = self.handlers_for(owner);
            self.deliver(&handlers, &event);
        }
    }
}

#[async_trait]
impl RemoteFollowService for InMemoryFollowService {
    async fn follow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome> {
        if let Some(outcome) = self.begin_mutation()? {
            return Ok(outcome);
        }
        if follower_id == target_id {
            return Ok(MutationOutcome::failed(CANNOT_FOLLOW_SELF));
        }
        self.apply_edge(follower_id, target_id, true);
        Ok(MutationOutcome::ok())
    }

    async fn unfollow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome> {
        if let Some(outcome) = self.begin_mutation()? {
            return Ok(outcome);
        }
        self.apply_edge(follower_id, target_id, false);
        Ok(MutationOutcome::ok())
    }

    async fn is_following(&self, follower_id: &str, target_id: &str) -> Result<bool> {
        if self.lock().unavailable {
            return Err(FollowGraphError::Network("follow backend unavailable".to_string()));
        }
        Ok(self.follows(follower_id, target_id))
    }

    async fn follow_status_batch(
        &self,
        follower_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<FollowStatus>> {
        let state = self.lock();
        if state.unavailable {
            return Err(FollowGraphError::Network("follow backend unavailable".to_string()));
        }
        Ok(user_ids
            .iter()
            .map(|user_id| FollowStatus {
                user_id: user_id.clone(),
                is_following: state
                    .edges
                    .contains(&(follower_id.to_string(), user_id.clone())),
                is_followed_by: state
                    .edges
                    .contains(&(user_id.clone(), follower_id.to_string())),
            })
            .collect())
    }

    fn subscribe_to_follow_events(
        &self,
        user_id: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        state.subscribe_calls += 1;
        state.next_handle += 1;
        let id = state.next_handle;
        state.subscribers.insert(id, (user_id.to_string(), handler));
        Ok(SubscriptionHandle::new(id, user_id))
    }

    fn unsubscribe_from_follow_events(&self, handle: &SubscriptionHandle) {
        let mut state = self.lock();
        state.unsubscribe_calls += 1;
        state.subscribers.remove(&handle.id());
    }
}
