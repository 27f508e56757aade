use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::env::Env;
use super::redaction::ReportRedactor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub channel_disable: ChannelDisableConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub tasks: TaskPoolConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Operator environment overrides for the settings that are usually
    /// deployed as secrets or toggled without editing the file.
    pub fn apply_env(&mut self, env: &Env) {
        if let Some(url) = env.get("MODERATION_WEBHOOK_URL") {
            self.moderation.webhook_url = Some(url.trim().to_string());
        }
        if let Some(groups) = env.get("MODERATION_ENABLED_GROUPS") {
            self.moderation.enabled_groups = groups;
        }
        if let Some(trust_quota) = env.get_i64("TRUST_QUOTA") {
            self.quota.trust_quota = trust_quota;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota.subscription_group.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "quota.subscription_group must not be empty".to_string(),
            ));
        }
        if self.tasks.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "tasks.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.moderation.max_text_chars == 0 {
            return Err(ConfigError::Invalid(
                "moderation.max_text_chars must be > 0".to_string(),
            ));
        }
        ReportRedactor::validate_config(&self.observability.redaction)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Groups tried in order when a request is routed through `auto`.
    #[serde(default)]
    pub auto_groups: Vec<String>,
    /// Per user group, the subset of `auto_groups` it may fall back to.
    /// User groups without an entry may use every auto group.
    #[serde(default)]
    pub group_auto_groups: BTreeMap<String, Vec<String>>,
}

impl DispatchConfig {
    pub fn auto_groups_for(&self, user_group: &str) -> Vec<String> {
        let Some(permitted) = self.group_auto_groups.get(user_group.trim()) else {
            return self.auto_groups.clone();
        };
        self.auto_groups
            .iter()
            .filter(|group| permitted.iter().any(|allowed| allowed.trim() == group.trim()))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Wallet balance above which trusted tokens skip the reservation write.
    #[serde(default = "default_trust_quota")]
    pub trust_quota: i64,
    #[serde(default = "default_subscription_group")]
    pub subscription_group: String,
    #[serde(default = "default_subscription_reset_interval_secs")]
    pub subscription_reset_interval_secs: u64,
}

fn default_trust_quota() -> i64 {
    5_000_000
}

fn default_subscription_group() -> String {
    "subscription".to_string()
}

fn default_subscription_reset_interval_secs() -> u64 {
    300
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            trust_quota: default_trust_quota(),
            subscription_group: default_subscription_group(),
            subscription_reset_interval_secs: default_subscription_reset_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelDisableConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ChannelDisableConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Comma separated list of groups whose chat traffic is moderated.
    #[serde(default)]
    pub enabled_groups: String,
    #[serde(default = "default_exempt_user_ids")]
    pub exempt_user_ids: Vec<i64>,
    #[serde(default = "default_eden_url")]
    pub eden_url: String,
    #[serde(default = "default_eden_provider")]
    pub eden_provider: String,
    #[serde(default = "default_eden_channel_name")]
    pub eden_channel_name: String,
    #[serde(default = "default_eden_likelihood_threshold")]
    pub eden_likelihood_threshold: f64,
    #[serde(default = "default_eden_score_threshold")]
    pub eden_score_threshold: f64,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_openai_channel_name")]
    pub openai_channel_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_string: Option<String>,
}

fn default_exempt_user_ids() -> Vec<i64> {
    vec![1, 206]
}

fn default_eden_url() -> String {
    "https://api.edenai.run/v2/text/moderation/".to_string()
}

fn default_eden_provider() -> String {
    "openai".to_string()
}

fn default_eden_channel_name() -> String {
    "moderation-key--eden".to_string()
}

fn default_eden_likelihood_threshold() -> f64 {
    4.0
}

fn default_eden_score_threshold() -> f64 {
    0.5
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1/moderations".to_string()
}

fn default_openai_model() -> String {
    "omni-moderation-latest".to_string()
}

fn default_openai_channel_name() -> String {
    "moderation-key".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_webhook_timeout_secs() -> u64 {
    5
}

fn default_max_text_chars() -> usize {
    8_000
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled_groups: String::new(),
            exempt_user_ids: default_exempt_user_ids(),
            eden_url: default_eden_url(),
            eden_provider: default_eden_provider(),
            eden_channel_name: default_eden_channel_name(),
            eden_likelihood_threshold: default_eden_likelihood_threshold(),
            eden_score_threshold: default_eden_score_threshold(),
            openai_url: default_openai_url(),
            openai_model: default_openai_model(),
            openai_channel_name: default_openai_channel_name(),
            request_timeout_secs: default_request_timeout_secs(),
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout_secs(),
            max_text_chars: default_max_text_chars(),
            probe_string: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskPoolConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    64
}

fn default_task_timeout_secs() -> u64 {
    30
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default = "default_redact_key_names")]
    pub redact_key_names: Vec<String>,
    #[serde(default = "default_redact_query_params")]
    pub redact_query_params: Vec<String>,
    #[serde(default = "default_sanitize_query_in_keys")]
    pub sanitize_query_in_keys: Vec<String>,
    #[serde(default = "default_redact_regexes")]
    pub redact_regexes: Vec<String>,
}

fn default_replacement() -> String {
    "<redacted>".to_string()
}

fn default_redact_key_names() -> Vec<String> {
    [
        "authorization",
        "proxy-authorization",
        "x-api-key",
        "api-key",
        "api_key",
        "cookie",
        "set-cookie",
        "token",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_redact_query_params() -> Vec<String> {
    ["api_key", "key", "token", "access_token"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_sanitize_query_in_keys() -> Vec<String> {
    ["url", "path", "query"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_redact_regexes() -> Vec<String> {
    vec![
        r"(?i)bearer\s+[A-Za-z0-9._\-]+".to_string(),
        r"sk-[A-Za-z0-9]{8,}".to_string(),
    ]
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            replacement: default_replacement(),
            redact_key_names: default_redact_key_names(),
            redact_query_params: default_redact_query_params(),
            sanitize_query_in_keys: default_sanitize_query_in_keys(),
            redact_regexes: default_redact_regexes(),
        }
    }
}
