//! Admission and dispatch core of the relay gateway.
//!
//! A relay request passes the moderation gate, gets a channel from the
//! dispatcher and reserves quota before it is forwarded upstream. After the
//! upstream call the reservation is either returned or reconciled.

pub mod channel_disable;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod moderation;
pub mod moderation_providers;
pub mod moderation_webhook;
pub mod observability;
pub mod pipeline;
pub mod probe;
pub mod quota;
pub mod redaction;
pub mod relay_request;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod subscription;
pub mod subscription_ledger;
pub mod tasks;
pub mod user_store;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use channel_disable::{ChannelDisableRegistry, DisabledChannelInfo};
pub use config::{
    ChannelDisableConfig, DispatchConfig, ModerationConfig, ObservabilityConfig, QuotaConfig,
    RedactionConfig, RelayConfig, TaskPoolConfig,
};
pub use dispatch::{
    Channel, ChannelDispatcher, ChannelSatisfier, SatisfyError, Selection, StaticChannelSatisfier,
};
pub use env::Env;
pub use error::{DispatchError, LedgerError, RelayError, StoreError};
pub use moderation::{
    InboundRequest, ModerationDetails, ModerationGate, ModerationGroups, RequestSnapshot,
};
pub use moderation_providers::{
    ChannelDirectory, ChannelKeyCache, EdenModerationProvider, ModerationError,
    ModerationProvider, OpenAiModerationProvider, StaticChannelDirectory,
};
pub use moderation_webhook::{ModerationWebhook, ViolationReport};
pub use observability::{AdmissionCounters, AdmissionCountersSnapshot};
pub use pipeline::{Admission, AdmissionPipeline, UpstreamOutcome};
pub use quota::QuotaAdmissionController;
pub use redaction::ReportRedactor;
pub use relay_request::{
    ChatMessage, ClaudeMessagesRequest, GeminiChatRequest, OpenAiChatRequest, RelayRequest,
    ResponsesRequest, TokenCountMeta,
};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteUserStore;
pub use subscription::{
    SelectionToken, SubscriptionData, SubscriptionDuration, SubscriptionItem, SubscriptionLimit,
};
pub use subscription_ledger::{ResetSummary, SubscriptionLedger};
pub use tasks::{PeriodicTask, TaskPool};
pub use user_store::{MemoryUserStore, RowCommit, RowUpdate, UserStore};

/// Which relay endpoint family a request targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// No mode metadata, e.g. native Claude messages.
    #[default]
    Unknown,
    ChatCompletions,
    Completions,
    Responses,
    Embeddings,
    Moderations,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    Rerank,
    Realtime,
}

impl RelayMode {
    pub fn is_chat(self) -> bool {
        matches!(
            self,
            RelayMode::ChatCompletions | RelayMode::Completions | RelayMode::Responses
        )
    }
}

/// Wire format of the inbound request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    #[default]
    OpenAi,
    OpenAiResponses,
    Claude,
    Gemini,
    Embedding,
    Rerank,
    OpenAiAudio,
    OpenAiImage,
    OpenAiRealtime,
}

impl RelayFormat {
    /// Formats that carry conversational text.
    pub fn is_chat_capable(self) -> bool {
        matches!(
            self,
            RelayFormat::OpenAi
                | RelayFormat::OpenAiResponses
                | RelayFormat::Claude
                | RelayFormat::Gemini
        )
    }
}

/// Request-scoped state shared with the relay pipeline.
///
/// The pipeline fills in identity fields before admission; the admission core
/// records its reservation here so that the settle step can reconcile it.
#[derive(Clone, Debug, Default)]
pub struct RelayContext {
    pub request_id: String,
    pub user_id: i64,
    pub username: String,
    /// Group the user belongs to (decides the quota universe).
    pub user_group: String,
    /// Group the request is routed through (token override or user group).
    pub using_group: String,
    pub token_id: i64,
    pub token_unlimited: bool,
    pub token_quota: i64,
    pub relay_mode: RelayMode,
    pub relay_format: RelayFormat,
    /// `POST /v1/messages?beta=true`.
    pub is_claude_beta_query: bool,
    pub original_model: String,
    /// Amount actually reserved by pre-consume, reset to zero once returned.
    pub final_pre_consumed_quota: i64,
    /// Wallet balance observed at pre-consume time.
    pub user_quota: i64,
    pub subscription_selection: Option<SelectionToken>,
    /// Group picked when the request was routed through `auto`.
    pub auto_group: Option<String>,
    /// Set by the first settle; later settles leave the ledger alone.
    pub settled: bool,
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(epoch_millis),
        }
    }

    pub fn set_millis(&self, epoch_millis: u64) {
        self.millis.store(epoch_millis, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_capable_formats() {
        assert!(RelayFormat::OpenAi.is_chat_capable());
        assert!(RelayFormat::Gemini.is_chat_capable());
        assert!(!RelayFormat::Embedding.is_chat_capable());
        assert!(!RelayFormat::OpenAiRealtime.is_chat_capable());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_500);
        assert_eq!(clock.now_epoch_seconds(), 1);
        clock.advance_millis(2_000);
        assert_eq!(clock.now_epoch_millis(), 3_500);
        assert_eq!(clock.now_epoch_seconds(), 3);
    }
}
