//! Prompt moderation in front of dispatch.
//!
//! The gate decides whether a request is in scope, derives the text to
//! inspect and runs it through the primary provider, falling back to the
//! secondary one on any primary failure. A block is answered with a policy
//! violation and reported to the operator webhook in the background.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::config::ModerationConfig;
use super::error::RelayError;
use super::moderation_providers::{
    ChannelDirectory, ChannelKeyCache, EdenModerationProvider, ModerationError,
    ModerationProvider, OpenAiModerationProvider, build_http_client,
};
use super::moderation_webhook::ModerationWebhook;
use super::observability::AdmissionCounters;
use super::probe::{DEFAULT_PROBE_STRING, request_contains_probe, should_reject_probe};
use super::redaction::ReportRedactor;
use super::relay_request::{RelayRequest, TokenCountMeta};
use super::tasks::TaskPool;
use super::{RelayFormat, RelayMode};

/// Groups whose traffic is moderated. Replaceable at runtime.
#[derive(Debug, Default)]
pub struct ModerationGroups {
    inner: RwLock<GroupSet>,
}

#[derive(Debug, Default)]
struct GroupSet {
    members: HashSet<String>,
    ordered: Vec<String>,
}

impl GroupSet {
    fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for group in raw.split(',').map(str::trim) {
            if group.is_empty() || !out.members.insert(group.to_string()) {
                continue;
            }
            out.ordered.push(group.to_string());
        }
        out
    }
}

impl ModerationGroups {
    /// Parses a comma separated list; blanks and duplicates are dropped.
    pub fn parse(raw: &str) -> Self {
        Self {
            inner: RwLock::new(GroupSet::parse(raw)),
        }
    }

    pub fn replace(&self, raw: &str) {
        let parsed = GroupSet::parse(raw);
        let mut guard = self.inner.write().unwrap_or_else(|err| err.into_inner());
        *guard = parsed;
    }

    pub fn contains(&self, group: &str) -> bool {
        let group = group.trim();
        if group.is_empty() {
            return false;
        }
        let guard = self.inner.read().unwrap_or_else(|err| err.into_inner());
        guard.members.contains(group)
    }

    /// Configured groups in first-seen order.
    pub fn groups(&self) -> Vec<String> {
        let guard = self.inner.read().unwrap_or_else(|err| err.into_inner());
        guard.ordered.clone()
    }
}

/// HTTP-level view of the inbound request, included in violation reports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl RequestSnapshot {
    fn dump(&self, request_id: &str) -> Value {
        let mut out = Map::new();
        out.insert("method".to_string(), Value::String(self.method.clone()));
        out.insert("url".to_string(), Value::String(self.url.clone()));
        out.insert("path".to_string(), Value::String(self.path.clone()));
        out.insert("query".to_string(), Value::String(self.query.clone()));
        out.insert(
            "headers".to_string(),
            serde_json::to_value(&self.headers).unwrap_or(Value::Null),
        );
        out.insert("client_ip".to_string(), Value::String(self.client_ip.clone()));
        out.insert(
            "remote_addr".to_string(),
            Value::String(self.remote_addr.clone()),
        );
        if let Some(host) = self.host.as_deref().filter(|host| !host.is_empty()) {
            out.insert("host".to_string(), Value::String(host.to_string()));
        }
        if !request_id.is_empty() {
            out.insert(
                "request_id".to_string(),
                Value::String(request_id.to_string()),
            );
        }
        Value::Object(out)
    }
}

/// Caller identity and transport details the relay pipeline hands to the
/// gate alongside the parsed request.
#[derive(Clone, Debug, Default)]
pub struct InboundRequest {
    pub username: String,
    pub user_id: i64,
    /// Group the request is routed through.
    pub group: String,
    /// Model as requested by the client, before any mapping.
    pub model: String,
    pub request_id: String,
    pub snapshot: RequestSnapshot,
    /// Raw request body.
    pub body: String,
    /// Cancelled when the client goes away.
    pub cancel: CancellationToken,
}

/// Everything the gate knows about a request once it has been inspected.
#[derive(Clone, Debug, Default)]
pub struct ModerationDetails {
    pub combined_text: String,
    pub messages: Value,
    pub last_user_message: String,
    pub model: String,
    pub request_body: String,
    pub request_dump: Value,
    pub username: String,
    pub group: String,
    pub user_id: i64,
    pub request_id: String,
}

impl ModerationDetails {
    /// Inspection text: token-accounting text, else the last user turn, else
    /// the raw body.
    pub fn collect(
        request: &dyn RelayRequest,
        meta: Option<&TokenCountMeta>,
        inbound: &InboundRequest,
    ) -> Self {
        let last_user_message = request.last_user_text().unwrap_or_default();
        let model = if inbound.model.is_empty() {
            request.model_name().to_string()
        } else {
            inbound.model.clone()
        };

        let combined_text = [
            meta.map(|meta| meta.combine_text.as_str()).unwrap_or_default(),
            last_user_message.as_str(),
            inbound.body.as_str(),
        ]
        .into_iter()
        .find(|text| !text.trim().is_empty())
        .unwrap_or_default()
        .to_string();

        Self {
            combined_text,
            messages: request.messages_snapshot(),
            last_user_message,
            model,
            request_body: inbound.body.clone(),
            request_dump: inbound.snapshot.dump(&inbound.request_id),
            username: inbound.username.clone(),
            group: inbound.group.clone(),
            user_id: inbound.user_id,
            request_id: inbound.request_id.clone(),
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn ModerationProvider>,
    keys: ChannelKeyCache,
}

impl ProviderSlot {
    async fn key(&self, directory: &dyn ChannelDirectory) -> Result<String, ModerationError> {
        self.keys.resolve_key(directory).await
    }
}

pub struct ModerationGate {
    exempt_user_ids: HashSet<i64>,
    probe_string: String,
    groups: Arc<ModerationGroups>,
    directory: Arc<dyn ChannelDirectory>,
    primary: ProviderSlot,
    fallback: ProviderSlot,
    webhook: ModerationWebhook,
    counters: Arc<AdmissionCounters>,
}

impl std::fmt::Debug for ModerationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationGate")
            .field("groups", &self.groups.groups())
            .field("primary", &self.primary.provider.name())
            .field("fallback", &self.fallback.provider.name())
            .field("webhook", &self.webhook.url())
            .finish_non_exhaustive()
    }
}

impl ModerationGate {
    pub fn new(
        config: &ModerationConfig,
        directory: Arc<dyn ChannelDirectory>,
        redactor: Arc<ReportRedactor>,
        tasks: TaskPool,
        counters: Arc<AdmissionCounters>,
    ) -> Result<Self, ModerationError> {
        let http = build_http_client(Duration::from_secs(config.request_timeout_secs.max(1)))?;
        let primary = ProviderSlot {
            provider: Arc::new(EdenModerationProvider::from_config(http.clone(), config)),
            keys: ChannelKeyCache::new(config.eden_channel_name.clone()),
        };
        let fallback = ProviderSlot {
            provider: Arc::new(OpenAiModerationProvider::from_config(http.clone(), config)),
            keys: ChannelKeyCache::new(config.openai_channel_name.clone()),
        };
        let webhook = ModerationWebhook::new(http, config, redactor, tasks, counters.clone());

        Ok(Self {
            exempt_user_ids: config.exempt_user_ids.iter().copied().collect(),
            probe_string: config
                .probe_string
                .clone()
                .unwrap_or_else(|| DEFAULT_PROBE_STRING.to_string()),
            groups: Arc::new(ModerationGroups::parse(&config.enabled_groups)),
            directory,
            primary,
            fallback,
            webhook,
            counters,
        })
    }

    /// Replaces the built-in Eden/OpenAI pair, keeping their credential
    /// channel names from `config`.
    pub fn with_providers(
        mut self,
        config: &ModerationConfig,
        primary: Arc<dyn ModerationProvider>,
        fallback: Arc<dyn ModerationProvider>,
    ) -> Self {
        self.primary = ProviderSlot {
            provider: primary,
            keys: ChannelKeyCache::new(config.eden_channel_name.clone()),
        };
        self.fallback = ProviderSlot {
            provider: fallback,
            keys: ChannelKeyCache::new(config.openai_channel_name.clone()),
        };
        self
    }

    /// Shared handle for runtime reconfiguration of the moderated groups.
    pub fn groups(&self) -> Arc<ModerationGroups> {
        self.groups.clone()
    }

    pub fn webhook(&self) -> &ModerationWebhook {
        &self.webhook
    }

    pub async fn enforce(
        &self,
        mode: RelayMode,
        format: RelayFormat,
        request: &dyn RelayRequest,
        meta: Option<&TokenCountMeta>,
        inbound: &InboundRequest,
    ) -> Result<(), RelayError> {
        if should_reject_probe(format) && request_contains_probe(&self.probe_string, request, meta)
        {
            self.counters.record_probe_rejected();
            tracing::info!(
                request_id = %inbound.request_id,
                user_id = inbound.user_id,
                "rejected probe request"
            );
            return Err(RelayError::ProbeRejected);
        }

        let details = ModerationDetails::collect(request, meta, inbound);
        if !self.should_run(&details, mode, format) {
            return Ok(());
        }
        self.counters.record_moderation_checked();

        let mut categories = self.classify(&details.combined_text, inbound).await?;
        if categories.is_empty() {
            return Ok(());
        }
        categories.sort();
        categories.dedup();

        self.counters.record_moderation_blocked();
        self.webhook.report(&details, &categories);
        tracing::info!(
            request_id = %details.request_id,
            user_id = details.user_id,
            group = %details.group,
            model = %details.model,
            categories = %categories.join(","),
            "prompt blocked by moderation"
        );
        Err(RelayError::PolicyViolation { categories })
    }

    pub fn should_run(&self, details: &ModerationDetails, mode: RelayMode, format: RelayFormat) -> bool {
        if self.exempt_user_ids.contains(&details.user_id) {
            return false;
        }
        if !self.groups.contains(&details.group) {
            return false;
        }
        if details.combined_text.trim().is_empty() {
            return false;
        }
        mode.is_chat() || (mode == RelayMode::Unknown && format == RelayFormat::Claude)
    }

    async fn classify(
        &self,
        text: &str,
        inbound: &InboundRequest,
    ) -> Result<Vec<String>, RelayError> {
        match self.try_primary(text, &inbound.cancel).await {
            Ok(categories) => return Ok(categories),
            Err(err) if err.is_unavailable() => {
                tracing::debug!(
                    request_id = %inbound.request_id,
                    provider = self.primary.provider.name(),
                    error = %err,
                    "primary moderation provider unavailable"
                );
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %inbound.request_id,
                    provider = self.primary.provider.name(),
                    error = %err,
                    "primary moderation request failed"
                );
            }
        }

        let provider = self.fallback.provider.name();
        let key = match self.fallback.key(self.directory.as_ref()).await {
            Ok(key) => key,
            Err(err) => {
                self.counters.record_moderation_provider_failure();
                tracing::error!(
                    request_id = %inbound.request_id,
                    provider,
                    error = %err,
                    "failed to load moderation key"
                );
                let status = match err {
                    ModerationError::ChannelNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                return Err(RelayError::ModerationUnavailable {
                    status,
                    message: err.to_string(),
                });
            }
        };

        self.fallback
            .provider
            .moderate(&key, text, &inbound.cancel)
            .await
            .map_err(|err| {
                self.counters.record_moderation_provider_failure();
                tracing::error!(
                    request_id = %inbound.request_id,
                    provider,
                    error = %err,
                    "fallback moderation request failed"
                );
                RelayError::ModerationUnavailable {
                    status: StatusCode::BAD_GATEWAY,
                    message: err.to_string(),
                }
            })
    }

    async fn try_primary(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ModerationError> {
        let key = self.primary.key(self.directory.as_ref()).await?;
        self.primary.provider.moderate(&key, text, cancel).await
    }
}
