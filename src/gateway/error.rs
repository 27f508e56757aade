use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

use super::RelayFormat;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("token {token_id} quota insufficient: remain={remain} required={required}")]
    InsufficientTokenQuota {
        token_id: i64,
        remain: i64,
        required: i64,
    },
    #[error("user {user_id} quota insufficient: balance={balance} required={required}")]
    InsufficientWallet {
        user_id: i64,
        balance: i64,
        required: i64,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("subscription quota exhausted")]
    Exhausted,
    #[error("subscription item not found for selection token")]
    ItemNotFound,
    #[error("invalid selection token: {0}")]
    InvalidToken(String),
    #[error("invalid ledger argument: {0}")]
    InvalidArgument(String),
    #[error("invalid subscription data: {0}")]
    Decode(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every candidate channel is temporarily disabled, or the selection loop
    /// ran out of attempts skipping disabled channels.
    #[error("all candidate channels for group {group} model {model} are temporarily disabled")]
    AllCandidatesDisabled { group: String, model: String },
    #[error("auto groups is not enabled")]
    AutoGroupsDisabled,
    #[error("channel satisfier failed: {0}")]
    Satisfier(String),
}

/// API-facing failure of the admission core.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("prompt blocked by moderation: categories={}", categories.join(", "))]
    PolicyViolation { categories: Vec<String> },
    #[error("request rejected: probe string detected")]
    ProbeRejected,
    #[error("moderation unavailable: {message}")]
    ModerationUnavailable { status: StatusCode, message: String },
    #[error("user quota is not enough, remaining quota: {balance}, required quota: {required}")]
    WalletQuotaExhausted { balance: i64, required: i64 },
    #[error("subscription quota exhausted")]
    SubscriptionQuotaExhausted,
    #[error("pre-consume token quota failed: {message}")]
    TokenQuotaFailed { message: String },
    #[error("update data failed: {message}")]
    DataUpdate { message: String },
    #[error("query data failed: {message}")]
    QueryData { message: String },
    #[error("no upstream channel is currently available for group {group} model {model}")]
    ChannelPoolExhausted { group: String, model: String },
    #[error("no channel is configured for group {group} model {model}")]
    NoAvailableChannel { group: String, model: String },
    #[error("auto groups is not enabled")]
    AutoGroupsDisabled,
    #[error("channel selection failed: {message}")]
    ChannelSelect { message: String },
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::PolicyViolation { .. } | RelayError::ProbeRejected => {
                StatusCode::BAD_REQUEST
            }
            RelayError::ModerationUnavailable { status, .. } => *status,
            RelayError::WalletQuotaExhausted { .. }
            | RelayError::SubscriptionQuotaExhausted
            | RelayError::TokenQuotaFailed { .. } => StatusCode::FORBIDDEN,
            RelayError::DataUpdate { .. }
            | RelayError::QueryData { .. }
            | RelayError::ChannelSelect { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ChannelPoolExhausted { .. } | RelayError::NoAvailableChannel { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::AutoGroupsDisabled => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::PolicyViolation { .. } | RelayError::ModerationUnavailable { .. } => {
                "prompt_blocked"
            }
            RelayError::ProbeRejected => "probe_rejected",
            RelayError::WalletQuotaExhausted { .. } => "insufficient_user_quota",
            RelayError::SubscriptionQuotaExhausted => "subscription_quota_exhausted",
            RelayError::TokenQuotaFailed { .. } => "pre_consume_token_quota_failed",
            RelayError::DataUpdate { .. } => "update_data_error",
            RelayError::QueryData { .. } => "query_data_error",
            RelayError::ChannelPoolExhausted { .. } => "channel_pool_exhausted",
            RelayError::NoAvailableChannel { .. } => "no_available_channel",
            RelayError::AutoGroupsDisabled => "auto_groups_disabled",
            RelayError::ChannelSelect { .. } => "channel_select_failed",
        }
    }

    /// Whether the relay pipeline must not retry on another channel.
    pub fn skip_retry(&self) -> bool {
        !matches!(self, RelayError::ChannelPoolExhausted { .. })
    }

    /// Expected business outcomes are kept out of the error log.
    pub fn record_error_log(&self) -> bool {
        !matches!(
            self,
            RelayError::PolicyViolation { .. }
                | RelayError::ProbeRejected
                | RelayError::WalletQuotaExhausted { .. }
                | RelayError::SubscriptionQuotaExhausted
                | RelayError::TokenQuotaFailed { .. }
        )
    }

    fn openai_type(&self) -> &'static str {
        match self {
            RelayError::PolicyViolation { .. } | RelayError::ProbeRejected => {
                "invalid_request_error"
            }
            RelayError::WalletQuotaExhausted { .. }
            | RelayError::SubscriptionQuotaExhausted
            | RelayError::TokenQuotaFailed { .. } => "insufficient_quota",
            RelayError::ChannelPoolExhausted { .. }
            | RelayError::NoAvailableChannel { .. }
            | RelayError::ModerationUnavailable { .. } => "upstream_error",
            RelayError::AutoGroupsDisabled => "permission_error",
            RelayError::DataUpdate { .. }
            | RelayError::QueryData { .. }
            | RelayError::ChannelSelect { .. } => "server_error",
        }
    }

    fn claude_type(&self) -> &'static str {
        match self.status().as_u16() {
            400 => "invalid_request_error",
            403 => "permission_error",
            503 => "overloaded_error",
            _ => "api_error",
        }
    }

    /// Error body in the wire shape of the inbound request.
    pub fn render(&self, format: RelayFormat) -> Value {
        let message = self.to_string();
        match format {
            RelayFormat::Claude => json!({
                "type": "error",
                "error": {
                    "type": self.claude_type(),
                    "message": message,
                }
            }),
            _ => json!({
                "error": {
                    "message": message,
                    "type": self.openai_type(),
                    "code": self.code(),
                }
            }),
        }
    }
}

impl From<DispatchError> for RelayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::AllCandidatesDisabled { group, model } => {
                RelayError::ChannelPoolExhausted { group, model }
            }
            DispatchError::AutoGroupsDisabled => RelayError::AutoGroupsDisabled,
            DispatchError::Satisfier(message) => RelayError::ChannelSelect { message },
        }
    }
}
