//! HTTP client for a PostgREST-style follow backend
//!
//! Mutations and reads are RPC calls under `/rest/v1/rpc/<name>`. Push
//! events are polled from `get_follow_events` by one tokio task per
//! subscription; each poll asks for events newer than the latest
//! `createdAt` seen so far.

use super::retry::{with_retry, RetryConfig};
use super::{
    EventDeduplicator, EventHandler, FollowEvent, FollowStatus, MutationOutcome,
    RemoteFollowService, SubscriptionHandle,
};
use crate::config::RemoteConfig;
use crate::{FollowGraphError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Error body returned by the backend
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Envelope of `get_follow_status_batch`
#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    data: Vec<FollowStatus>,
}

struct HttpInner {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryConfig,
    poll_interval: Duration,
    dedup: EventDeduplicator,
}

impl HttpInner {
    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, name)
    }

    async fn rpc<T: DeserializeOwned>(&self, name: &str, body: &Value) -> Result<T> {
        let mut request = self
            .client
            .post(self.rpc_url(name))
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(ref key) = self.api_key {
            request = request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                FollowGraphError::Network(e.to_string())
            } else {
                FollowGraphError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
                message: None,
                error: None,
            });
            let message = error
                .message
                .or(error.error)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(FollowGraphError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

/// [`RemoteFollowService`] over HTTP
pub struct HttpFollowService {
    inner: Arc<HttpInner>,
    next_handle: AtomicU64,
    pollers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl HttpFollowService {
    /// Create with an explicit base URL and optional API key
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::build(
            base_url.into(),
            api_key,
            reqwest::Client::new(),
            RetryConfig::default(),
            Duration::from_secs(5),
        )
    }

    /// Create from configuration
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| FollowGraphError::Config("remote.base_url is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self::build(
            base_url,
            config.api_key.clone(),
            client,
            config.retry_config(),
            Duration::from_secs(config.poll_interval_secs),
        ))
    }

    fn build(
        base_url: String,
        api_key: Option<String>,
        client: reqwest::Client,
        retry: RetryConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
                client,
                retry,
                poll_interval,
                dedup: EventDeduplicator::default(),
            }),
            next_handle: AtomicU64::new(1),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the push polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.rebuild_inner(|inner| inner.poll_interval = interval);
        self
    }

    /// Override the retry policy for reads
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.rebuild_inner(|inner| inner.retry = retry);
        self
    }

    fn rebuild_inner(&mut self, apply: impl FnOnce(&mut HttpInner)) {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            apply(inner);
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    async fn mutate(&self, rpc: &str, follower_id: &str, target_id: &str) -> Result<MutationOutcome> {
        let body = json!({
            "p_follower_id": follower_id,
            "p_following_id": target_id,
        });
        let outcome: MutationOutcome = self.inner.rpc(rpc, &body).await?;
        tracing::debug!(
            rpc,
            follower = follower_id,
            target = target_id,
            success = outcome.success,
            error = outcome.error.as_deref().unwrap_or(""),
            "Follow mutation answered"
        );
        Ok(outcome)
    }
}

impl Drop for HttpFollowService {
    fn drop(&mut self) {
        if let Ok(mut pollers) = self.pollers.lock() {
            for (_, task) in pollers.drain() {
                task.abort();
            }
        }
    }
}

/// Poll loop for one subscription
async fn poll_events(inner: Arc<HttpInner>, user_id: String, handler: EventHandler) {
    let mut since = Utc::now().timestamp_millis();
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let body = json!({ "p_user_id": user_id, "p_since": since });
        let events: Result<Vec<FollowEvent>> = with_retry(&inner.retry, "get_follow_events", || {
            inner.rpc("get_follow_events", &body)
        })
        .await;

        match events {
            Ok(events) => {
                for event in events {
                    if let Some(created_at) = event.created_at {
                        since = since.max(created_at);
                    }
                    if let Some(ref id) = event.event_id {
                        if inner.dedup.is_duplicate(id) {
                            continue;
                        }
                    }
                    handler(&event);
                }
            }
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Follow event poll failed");
            }
        }
    }
}

#[async_trait]
impl RemoteFollowService for HttpFollowService {
    async fn follow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome> {
        self.mutate("follow_user", follower_id, target_id).await
    }

    async fn unfollow_user(&self, follower_id: &str, target_id: &str) -> Result<MutationOutcome> {
        self.mutate("unfollow_user", follower_id, target_id).await
    }

    async fn is_following(&self, follower_id: &str, target_id: &str) -> Result<bool> {
        let body = json!({
            "p_follower_id": follower_id,
            "p_following_id": target_id,
        });
        with_retry(&self.inner.retry, "is_following", || {
            self.inner.rpc("is_following", &body)
        })
        .await
    }

    async fn follow_status_batch(
        &self,
        follower_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<FollowStatus>> {
        let body = json!({
            "p_follower_id": follower_id,
            "p_user_ids": user_ids,
        });
        let response: BatchResponse = with_retry(&self.inner.retry, "get_follow_status_batch", || {
            self.inner.rpc("get_follow_status_batch", &body)
        })
        .await?;
        Ok(response.data)
    }

    fn subscribe_to_follow_events(
        &self,
        user_id: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            FollowGraphError::Other("push subscriptions need a tokio runtime".to_string())
        })?;

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let task = runtime.spawn(poll_events(self.inner.clone(), user_id.to_string(), handler));

        self.pollers
            .lock()
            .map_err(|_| FollowGraphError::Other("poller registry poisoned".to_string()))?
            .insert(id, task);

        tracing::info!(user = user_id, subscription = id, "Polling follow events");
        Ok(SubscriptionHandle::new(id, user_id))
    }

    fn unsubscribe_from_follow_events(&self, handle: &SubscriptionHandle) {
        let task = self
            .pollers
            .lock()
            .ok()
            .and_then(|mut pollers| pollers.remove(&handle.id()));
        if let Some(task) = task {
            task.abort();
            tracing::info!(user = handle.user_id(), subscription = handle.id(), "Stopped polling follow events");
        }
    }
}
