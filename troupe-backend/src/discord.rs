//! REST collaborator for the messaging platform.
//!
//! All traffic goes through user-token REST calls: paged message fetches
//! with an `after` cursor, message sends (with reply references), typing
//! indicators, and identity resolution. `ChatClient` wraps either the real
//! HTTP client or a scripted mock used by the tests.

use crate::http;
use crate::models::DelayWindow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const API_BASE: &str = "https://discord.com/api/v9";

/// Refresh cadence for the typing indicator while simulated typing runs.
const TYPING_REFRESH_SECS: u64 = 5;

/// Failure modes of a single send attempt.
#[derive(Debug, Clone)]
pub enum SendError {
    /// The platform asked us to back off; retry after the given seconds.
    RateLimited { retry_after: f64 },
    /// Non-success, non-rate-limit status: this send is abandoned.
    Status { status: u16, body: String },
    Network(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {:.2}s", retry_after)
            }
            SendError::Status { status, body } => {
                write!(f, "send failed with status {}: {}", status, body)
            }
            SendError::Network(e) => write!(f, "network error: {}", e),
        }
    }
}

/// Message author as returned by the platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// Read-only snapshot of a channel message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    pub author: MessageAuthor,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub referenced_message: Option<Box<ChannelMessage>>,
    #[serde(default)]
    pub mentions: Vec<MessageAuthor>,
}

/// Identity behind an account credential.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedIdentity {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Serialize)]
struct MessageReference<'a> {
    message_id: &'a str,
}

#[derive(Serialize)]
struct SendPayload<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_reference: Option<MessageReference<'a>>,
}

#[derive(Deserialize)]
struct SentResponse {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitResponse {
    #[serde(default)]
    retry_after: Option<f64>,
}

/// HTTP client bound to one channel.
#[derive(Clone)]
pub struct DiscordApi {
    channel_id: String,
    client: reqwest::Client,
}

impl DiscordApi {
    pub fn new(channel_id: &str) -> Self {
        DiscordApi {
            channel_id: channel_id.to_string(),
            client: http::shared_client().clone(),
        }
    }

    /// Fetch up to `limit` messages after the cursor, oldest first. Without
    /// a cursor, the newest page is returned (used for cursor seeding).
    async fn fetch_after(
        &self,
        token: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, String> {
        let url = format!("{}/channels/{}/messages", API_BASE, self.channel_id);
        let mut request = self
            .client
            .get(&url)
            .header("Authorization", token)
            .query(&[("limit", limit.to_string())]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("fetch request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("fetch failed with status {}: {}", status, body));
        }

        let mut messages: Vec<ChannelMessage> = response
            .json()
            .await
            .map_err(|e| format!("failed to parse fetch response: {}", e))?;
        // The platform pages newest-first; normalize to chronological order
        // so decisions run in arrival order.
        messages.sort_by(|a, b| crate::coordination::cmp_ids(&a.id, &b.id));
        Ok(messages)
    }

    /// One send attempt. Rate limiting surfaces as `SendError::RateLimited`
    /// for the caller's retry loop.
    async fn send(
        &self,
        token: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, SendError> {
        let url = format!("{}/channels/{}/messages", API_BASE, self.channel_id);
        let payload = SendPayload {
            content: text,
            message_reference: reply_to.map(|id| MessageReference { message_id: id }),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .json::<RateLimitResponse>()
                .await
                .ok()
                .and_then(|r| r.retry_after)
                .unwrap_or(1.0);
            return Err(SendError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = if body.len() > 200 {
                format!("{}...", &body[..200])
            } else {
                body
            };
            return Err(SendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let sent: SentResponse = response
            .json()
            .await
            .map_err(|e| SendError::Network(format!("failed to parse send response: {}", e)))?;
        Ok(sent.id)
    }

    async fn send_typing(&self, token: &str) -> Result<(), String> {
        let url = format!("{}/channels/{}/typing", API_BASE, self.channel_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| format!("typing request failed: {}", e))?;
        let status = response.status();
        if !matches!(status.as_u16(), 200 | 204) {
            return Err(format!("typing request failed with status {}", status));
        }
        Ok(())
    }

    async fn resolve_identity(&self, token: &str) -> Result<ResolvedIdentity, String> {
        let url = format!("{}/users/@me", API_BASE);
        let response = self
            .client
            .get(&url)
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| format!("identity request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("credential rejected with status {}", status));
        }
        response
            .json()
            .await
            .map_err(|e| format!("failed to parse identity response: {}", e))
    }
}

/// Scripted stand-in for the platform, used by the tests. Fetch pages are
/// queued ahead of time; sends are recorded and assigned incrementing ids.
#[derive(Clone, Default)]
pub struct MockChatApi {
    inner: Arc<MockInner>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub token: String,
    pub text: String,
    pub reply_to: Option<String>,
    pub id: String,
}

struct MockInner {
    fetches: Mutex<VecDeque<Result<Vec<ChannelMessage>, String>>>,
    send_failures: Mutex<VecDeque<SendError>>,
    sent: Mutex<Vec<SentMessage>>,
    typing_calls: AtomicU64,
    next_id: AtomicU64,
    identities: Mutex<HashMap<String, ResolvedIdentity>>,
    latest_id: Mutex<Option<String>>,
}

impl Default for MockInner {
    fn default() -> Self {
        MockInner {
            fetches: Mutex::new(VecDeque::new()),
            send_failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            typing_calls: AtomicU64::new(0),
            next_id: AtomicU64::new(5000),
            identities: Mutex::new(HashMap::new()),
            latest_id: Mutex::new(None),
        }
    }
}

impl MockChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetch(&self, batch: Vec<ChannelMessage>) {
        self.inner.fetches.lock().unwrap().push_back(Ok(batch));
    }

    pub fn push_fetch_error(&self, error: &str) {
        self.inner
            .fetches
            .lock()
            .unwrap()
            .push_back(Err(error.to_string()));
    }

    pub fn queue_send_failure(&self, error: SendError) {
        self.inner.send_failures.lock().unwrap().push_back(error);
    }

    pub fn register_identity(&self, token: &str, id: &str, username: &str) {
        self.inner.identities.lock().unwrap().insert(
            token.to_string(),
            ResolvedIdentity {
                id: id.to_string(),
                username: username.to_string(),
            },
        );
    }

    pub fn set_latest_id(&self, id: &str) {
        *self.inner.latest_id.lock().unwrap() = Some(id.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn typing_calls(&self) -> u64 {
        self.inner.typing_calls.load(Ordering::SeqCst)
    }

    fn record_send(
        &self,
        token: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, SendError> {
        if let Some(failure) = self.inner.send_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.inner.sent.lock().unwrap().push(SentMessage {
            token: token.to_string(),
            text: text.to_string(),
            reply_to: reply_to.map(|s| s.to_string()),
            id: id.clone(),
        });
        Ok(id)
    }
}

/// Unified client handle: the HTTP collaborator or the test mock.
#[derive(Clone)]
pub enum ChatClient {
    Http(DiscordApi),
    Mock(MockChatApi),
}

impl ChatClient {
    pub fn http(channel_id: &str) -> Self {
        ChatClient::Http(DiscordApi::new(channel_id))
    }

    pub fn mock(mock: MockChatApi) -> Self {
        ChatClient::Mock(mock)
    }

    pub async fn fetch_after(
        &self,
        token: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, String> {
        match self {
            ChatClient::Http(api) => api.fetch_after(token, after, limit).await,
            ChatClient::Mock(mock) => mock
                .inner
                .fetches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new())),
        }
    }

    pub async fn send_message(
        &self,
        token: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, SendError> {
        match self {
            ChatClient::Http(api) => api.send(token, text, reply_to).await,
            ChatClient::Mock(mock) => mock.record_send(token, text, reply_to),
        }
    }

    pub async fn send_typing(&self, token: &str) -> Result<(), String> {
        match self {
            ChatClient::Http(api) => api.send_typing(token).await,
            ChatClient::Mock(mock) => {
                mock.inner.typing_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub async fn resolve_identity(&self, token: &str) -> Result<ResolvedIdentity, String> {
        match self {
            ChatClient::Http(api) => api.resolve_identity(token).await,
            ChatClient::Mock(mock) => mock
                .inner
                .identities
                .lock()
                .unwrap()
                .get(token)
                .cloned()
                .ok_or_else(|| "credential rejected with status 401".to_string()),
        }
    }

    /// Latest message id in the channel, used to seed the polling cursor.
    pub async fn latest_message_id(&self, token: &str) -> Result<Option<String>, String> {
        match self {
            ChatClient::Http(api) => {
                let page = api.fetch_after(token, None, 1).await?;
                Ok(page.last().map(|m| m.id.clone()))
            }
            ChatClient::Mock(mock) => Ok(mock.inner.latest_id.lock().unwrap().clone()),
        }
    }

    /// Send a message the way a human would: simulate typing for a duration
    /// drawn from the per-word window (refreshing the typing indicator
    /// underneath), then post, sleeping out rate limits until the platform
    /// accepts the message. Non-rate-limit failures are returned to the
    /// caller.
    pub async fn deliver(
        &self,
        account_name: &str,
        token: &str,
        text: &str,
        reply_to: Option<&str>,
        typing_per_word: &DelayWindow,
    ) -> Result<String, SendError> {
        let word_count = text.split_whitespace().count().max(1);
        let window = typing_per_word.scaled(word_count as f64);
        if !window.is_zero() {
            let typing_time = window.sample();
            log::info!(
                "[{}] Typing for {:.2} seconds...",
                account_name,
                typing_time.as_secs_f64()
            );
            let typing_client = self.clone();
            let typing_token = token.to_string();
            let indicator = tokio::spawn(async move {
                let mut remaining = typing_time;
                loop {
                    if let Err(e) = typing_client.send_typing(&typing_token).await {
                        log::warn!("Typing indicator failed: {}", e);
                        break;
                    }
                    if remaining.is_zero() {
                        break;
                    }
                    let step = remaining.min(Duration::from_secs(TYPING_REFRESH_SECS));
                    tokio::time::sleep(step).await;
                    remaining = remaining.saturating_sub(step);
                }
            });
            tokio::time::sleep(typing_time).await;
            indicator.abort();
        }

        loop {
            match self.send_message(token, text, reply_to).await {
                Ok(id) => {
                    log::info!(
                        "[{}] Message sent: '{}' (id {})",
                        account_name,
                        text,
                        id
                    );
                    return Ok(id);
                }
                Err(SendError::RateLimited { retry_after }) => {
                    log::warn!(
                        "[{}] Rate limited, retrying in {:.2} seconds...",
                        account_name,
                        retry_after
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after.max(0.0))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
