use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::config::ModerationConfig;
use super::dispatch::Channel;

const ERROR_BODY_SNIPPET_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation channel {name} not found")]
    ChannelNotFound { name: String },
    #[error("moderation channel key is empty")]
    EmptyKey,
    #[error("moderation channel lookup failed: {0}")]
    Directory(String),
    #[error("moderation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} moderation failed with status {status}: {body}")]
    Api {
        provider: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid moderation response: {0}")]
    Decode(String),
    #[error("moderation request cancelled")]
    Cancelled,
}

impl ModerationError {
    /// The provider has no usable credential channel (as opposed to a
    /// failed call).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ModerationError::ChannelNotFound { .. } | ModerationError::EmptyKey
        )
    }
}

/// Read access to the channel table that stores moderation credentials.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>, ModerationError>;

    async fn first_channel_by_name(&self, name: &str) -> Result<Option<Channel>, ModerationError>;
}

/// In-memory channel table, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticChannelDirectory {
    channels: std::sync::RwLock<Vec<Channel>>,
}

impl StaticChannelDirectory {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: std::sync::RwLock::new(channels),
        }
    }

    pub fn replace(&self, channels: Vec<Channel>) {
        let mut guard = self
            .channels
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *guard = channels;
    }
}

#[async_trait]
impl ChannelDirectory for StaticChannelDirectory {
    async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>, ModerationError> {
        let guard = self.channels.read().unwrap_or_else(|err| err.into_inner());
        Ok(guard.iter().find(|channel| channel.id == id).cloned())
    }

    async fn first_channel_by_name(&self, name: &str) -> Result<Option<Channel>, ModerationError> {
        let guard = self.channels.read().unwrap_or_else(|err| err.into_inner());
        Ok(guard.iter().find(|channel| channel.name == name).cloned())
    }
}

/// Remembers which channel id holds a provider's credential.
///
/// A cached id that stops resolving is forgotten and the channel is looked up
/// by name again, so renamed or recreated channels are picked up without a
/// restart.
#[derive(Debug)]
pub struct ChannelKeyCache {
    channel_name: String,
    cached_id: AtomicI64,
}

impl ChannelKeyCache {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            cached_id: AtomicI64::new(0),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn cached_id(&self) -> i64 {
        self.cached_id.load(Ordering::Acquire)
    }

    pub async fn resolve_key(
        &self,
        directory: &dyn ChannelDirectory,
    ) -> Result<String, ModerationError> {
        let id = self.cached_id();
        if id > 0 {
            match directory.channel_by_id(id).await {
                Ok(Some(channel)) => return key_of(&channel),
                Ok(None) | Err(_) => self.cached_id.store(0, Ordering::Release),
            }
        }

        let channel = directory
            .first_channel_by_name(&self.channel_name)
            .await?
            .ok_or_else(|| ModerationError::ChannelNotFound {
                name: self.channel_name.clone(),
            })?;
        self.cached_id.store(channel.id, Ordering::Release);
        key_of(&channel)
    }
}

fn key_of(channel: &Channel) -> Result<String, ModerationError> {
    channel
        .first_key()
        .map(str::to_string)
        .ok_or(ModerationError::EmptyKey)
}

/// A text moderation backend. Returns the labels that fired; an empty list
/// means the text passed.
#[async_trait]
pub trait ModerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn moderate(
        &self,
        api_key: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ModerationError>;
}

pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ModerationError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Eden AI text moderation, answered per upstream provider with
/// likelihood-scored labels.
#[derive(Clone, Debug)]
pub struct EdenModerationProvider {
    http: reqwest::Client,
    url: String,
    provider: String,
    likelihood_threshold: f64,
    score_threshold: f64,
    max_text_chars: usize,
}

impl EdenModerationProvider {
    pub fn from_config(http: reqwest::Client, config: &ModerationConfig) -> Self {
        Self {
            http,
            url: config.eden_url.clone(),
            provider: config.eden_provider.clone(),
            likelihood_threshold: config.eden_likelihood_threshold,
            score_threshold: config.eden_score_threshold,
            max_text_chars: config.max_text_chars,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn triggered_labels(&self, payload: &[u8]) -> Result<Vec<String>, ModerationError> {
        if payload.is_empty() {
            return Err(ModerationError::Decode(
                "eden moderation response is empty".to_string(),
            ));
        }
        let providers: HashMap<String, Value> = serde_json::from_slice(payload)
            .map_err(|err| ModerationError::Decode(err.to_string()))?;

        let mut labels = BTreeSet::new();
        for (provider, raw) in providers {
            let parsed = match serde_json::from_value::<EdenProviderResponse>(raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(provider = %provider, error = %err, "skipping eden provider entry");
                    continue;
                }
            };
            for item in parsed.items {
                if !self.is_flagged(&item) {
                    continue;
                }
                let label = item.label.trim();
                if !label.is_empty() {
                    labels.insert(label.to_string());
                }
            }
        }
        Ok(labels.into_iter().collect())
    }

    fn is_flagged(&self, item: &EdenItem) -> bool {
        parse_likelihood(&item.likelihood) >= self.likelihood_threshold
            || item.likelihood_score >= self.score_threshold
    }
}

#[derive(Debug, Deserialize)]
struct EdenProviderResponse {
    #[serde(default)]
    items: Vec<EdenItem>,
}

#[derive(Debug, Deserialize)]
struct EdenItem {
    #[serde(default)]
    label: String,
    #[serde(default)]
    likelihood: Value,
    #[serde(default)]
    likelihood_score: f64,
}

/// Numbers, numeric strings and the `VERY_UNLIKELY`..`VERY_LIKELY` scale
/// (1..5). Anything else is 0.
fn parse_likelihood(raw: &Value) -> f64 {
    match raw {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(value) = text.parse::<f64>() {
                return value;
            }
            match text.to_ascii_uppercase().as_str() {
                "VERY_UNLIKELY" => 1.0,
                "UNLIKELY" => 2.0,
                "POSSIBLE" | "POSSIBLY" => 3.0,
                "LIKELY" => 4.0,
                "VERY_LIKELY" => 5.0,
                _ => 0.0,
            }
        }
        _ => 0.0,
    }
}

#[async_trait]
impl ModerationProvider for EdenModerationProvider {
    fn name(&self) -> &str {
        "eden"
    }

    async fn moderate(
        &self,
        api_key: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ModerationError> {
        let body = json!({
            "response_as_dict": true,
            "attributes_as_list": false,
            "show_original_response": false,
            "providers": self.provider,
            "language": "auto-detect",
            "text": prepare_text(text, self.max_text_chars),
        });
        let payload = post_json(&self.http, self.name(), &self.url, api_key, &body, cancel).await?;
        self.triggered_labels(&payload)
    }
}

/// OpenAI-shaped `/v1/moderations` endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiModerationProvider {
    http: reqwest::Client,
    url: String,
    model: String,
    max_text_chars: usize,
}

impl OpenAiModerationProvider {
    pub fn from_config(http: reqwest::Client, config: &ModerationConfig) -> Self {
        Self {
            http,
            url: config.openai_url.clone(),
            model: config.openai_model.clone(),
            max_text_chars: config.max_text_chars,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiModerationResponse {
    #[serde(default)]
    results: Vec<OpenAiModerationResult>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModerationResult {
    #[serde(default)]
    categories: BTreeMap<String, bool>,
}

#[async_trait]
impl ModerationProvider for OpenAiModerationProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn moderate(
        &self,
        api_key: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ModerationError> {
        let body = json!({
            "input": prepare_text(text, self.max_text_chars),
            "model": self.model,
        });
        let payload = post_json(&self.http, self.name(), &self.url, api_key, &body, cancel).await?;
        let parsed: OpenAiModerationResponse = serde_json::from_slice(&payload)
            .map_err(|err| ModerationError::Decode(err.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .next()
            .map(|result| {
                result
                    .categories
                    .into_iter()
                    .filter_map(|(category, flagged)| flagged.then_some(category))
                    .collect()
            })
            .unwrap_or_default())
    }
}

async fn post_json(
    http: &reqwest::Client,
    provider: &str,
    url: &str,
    api_key: &str,
    body: &Value,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ModerationError> {
    let call = async {
        let response = http
            .post(url)
            .bearer_auth(api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if status.as_u16() >= 400 {
            return Err(ModerationError::Api {
                provider: provider.to_string(),
                status,
                body: snip(&String::from_utf8_lossy(&bytes), ERROR_BODY_SNIPPET_BYTES),
            });
        }
        Ok(bytes.to_vec())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ModerationError::Cancelled),
        result = call => result,
    }
}

/// Trims surrounding whitespace (keeping the raw text if nothing is left)
/// and caps the length at `max_chars` characters.
pub fn prepare_text(text: &str, max_chars: usize) -> &str {
    let trimmed = text.trim();
    let text = if trimmed.is_empty() { text } else { trimmed };
    truncate_chars(text, max_chars)
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn snip(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn channel(id: i64, name: &str, key: &str) -> Channel {
        Channel {
            id,
            name: name.to_string(),
            key: key.to_string(),
            ..Channel::default()
        }
    }

    fn http() -> reqwest::Client {
        build_http_client(Duration::from_secs(5)).expect("http client")
    }

    #[test]
    fn truncation_counts_characters() {
        let text = "héllo wörld";
        assert_eq!(truncate_chars(text, 4), "héll");
        assert_eq!(truncate_chars(text, 100), text);
        let long = "界".repeat(9000);
        assert_eq!(truncate_chars(&long, 8000).chars().count(), 8000);
    }

    #[test]
    fn prepare_text_keeps_whitespace_only_input() {
        assert_eq!(prepare_text("  hi  ", 10), "hi");
        assert_eq!(prepare_text("   ", 10), "   ");
    }

    #[test]
    fn snip_respects_char_boundaries() {
        let body = "é".repeat(400);
        let out = snip(&body, 513);
        assert_eq!(out.len(), 512);
        assert_eq!(snip("short", 512), "short");
    }

    #[test]
    fn likelihood_accepts_numbers_strings_and_scale_names() {
        assert_eq!(parse_likelihood(&json!(4)), 4.0);
        assert_eq!(parse_likelihood(&json!("3.5")), 3.5);
        assert_eq!(parse_likelihood(&json!("very_likely")), 5.0);
        assert_eq!(parse_likelihood(&json!("POSSIBLY")), 3.0);
        assert_eq!(parse_likelihood(&json!("unknown")), 0.0);
        assert_eq!(parse_likelihood(&Value::Null), 0.0);
    }

    #[test]
    fn eden_labels_are_thresholded_and_deduplicated() {
        let provider = EdenModerationProvider::from_config(http(), &ModerationConfig::default());
        let payload = json!({
            "openai": {
                "items": [
                    {"label": "Violence ", "likelihood": "LIKELY", "likelihood_score": 0.1},
                    {"label": "Hate", "likelihood": 2, "likelihood_score": 0.7},
                    {"label": "Sexual", "likelihood": "UNLIKELY", "likelihood_score": 0.2},
                    {"label": "", "likelihood": 5, "likelihood_score": 0.9}
                ]
            },
            "other": {
                "items": [{"label": "Violence", "likelihood": 5}]
            },
            "broken": "not an object"
        })
        .to_string();

        let labels = provider
            .triggered_labels(payload.as_bytes())
            .expect("labels");
        assert_eq!(labels, vec!["Hate".to_string(), "Violence".to_string()]);
        assert!(provider.triggered_labels(b"").is_err());
    }

    #[tokio::test]
    async fn key_cache_resolves_by_name_then_by_id() {
        let directory = StaticChannelDirectory::new(vec![channel(7, "moderation-key", "\n sk-a \nsk-b")]);
        let cache = ChannelKeyCache::new("moderation-key");

        assert_eq!(cache.resolve_key(&directory).await.expect("key"), "sk-a");
        assert_eq!(cache.cached_id(), 7);

        directory.replace(vec![channel(7, "moderation-key", "sk-rotated")]);
        assert_eq!(cache.resolve_key(&directory).await.expect("key"), "sk-rotated");
    }

    #[tokio::test]
    async fn key_cache_forgets_stale_id() {
        let directory = StaticChannelDirectory::new(vec![channel(7, "moderation-key", "sk-a")]);
        let cache = ChannelKeyCache::new("moderation-key");
        cache.resolve_key(&directory).await.expect("key");

        directory.replace(vec![channel(9, "moderation-key", "sk-new")]);
        assert_eq!(cache.resolve_key(&directory).await.expect("key"), "sk-new");
        assert_eq!(cache.cached_id(), 9);

        directory.replace(Vec::new());
        let err = cache.resolve_key(&directory).await.expect_err("missing");
        assert!(matches!(err, ModerationError::ChannelNotFound { .. }));
        assert!(err.is_unavailable());
        assert_eq!(cache.cached_id(), 0);
    }

    #[tokio::test]
    async fn key_cache_reports_empty_key() {
        let directory = StaticChannelDirectory::new(vec![channel(3, "moderation-key", "  \n ")]);
        let cache = ChannelKeyCache::new("moderation-key");
        let err = cache.resolve_key(&directory).await.expect_err("empty");
        assert!(matches!(err, ModerationError::EmptyKey));
        assert_eq!(err.to_string(), "moderation channel key is empty");
    }

    #[tokio::test]
    async fn openai_provider_posts_and_collects_true_categories() {
        if crate::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/moderations")
                    .header("authorization", "Bearer sk-mod")
                    .header("accept", "application/json")
                    .body_includes("\"model\":\"omni-moderation-latest\"")
                    .body_includes("\"input\":\"bad words\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({
                            "results": [{
                                "flagged": true,
                                "categories": {"violence": true, "hate": false, "harassment": true}
                            }]
                        })
                        .to_string(),
                    );
            })
            .await;

        let provider = OpenAiModerationProvider::from_config(http(), &ModerationConfig::default())
            .with_url(server.url("/v1/moderations"));
        let categories = provider
            .moderate("sk-mod", "  bad words \n", &CancellationToken::new())
            .await
            .expect("moderate");

        mock.assert_async().await;
        assert_eq!(categories, vec!["harassment".to_string(), "violence".to_string()]);
    }

    #[tokio::test]
    async fn error_status_carries_snipped_body() {
        if crate::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/eden");
                then.status(429).body("x".repeat(2000));
            })
            .await;

        let provider = EdenModerationProvider::from_config(http(), &ModerationConfig::default())
            .with_url(server.url("/eden"));
        let err = provider
            .moderate("sk-eden", "hello", &CancellationToken::new())
            .await
            .expect_err("status error");
        let ModerationError::Api { status, body, .. } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(status.as_u16(), 429);
        assert_eq!(body.len(), 512);
    }

    #[tokio::test]
    async fn cancelled_request_fails_fast() {
        let provider = OpenAiModerationProvider::from_config(http(), &ModerationConfig::default())
            .with_url("http://127.0.0.1:9/v1/moderations");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider
            .moderate("sk", "hello", &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ModerationError::Cancelled));
    }
}
