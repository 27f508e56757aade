use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel_disable::ChannelDisableRegistry;
use super::config::DispatchConfig;
use super::error::DispatchError;
use super::RelayContext;

const MAX_DISABLED_SKIP_ATTEMPTS: usize = 8;
pub const AUTO_GROUP: &str = "auto";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub models: Vec<String>,
    /// One or more newline-separated credentials.
    #[serde(default, skip_serializing)]
    pub key: String,
}

impl Channel {
    pub fn first_key(&self) -> Option<&str> {
        self.key
            .lines()
            .map(str::trim)
            .find(|key| !key.is_empty())
    }

    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.group
            .split(',')
            .any(|candidate| candidate.trim() == group)
            && self.models.iter().any(|candidate| candidate == model)
    }
}

#[derive(Debug, Error)]
pub enum SatisfyError {
    /// Candidates exist but every one of them is in the exclusion set.
    #[error("all candidate channels were filtered")]
    AllFiltered,
    #[error("{0}")]
    Other(String),
}

/// External channel picker (weighted random in production).
#[async_trait]
pub trait ChannelSatisfier: Send + Sync {
    async fn satisfy(
        &self,
        group: &str,
        model: &str,
        retry: u32,
        excluded: &HashSet<i64>,
    ) -> Result<Option<Channel>, SatisfyError>;
}

/// Picks the first configured channel that serves the group and model and is
/// not excluded.
#[derive(Clone, Debug, Default)]
pub struct StaticChannelSatisfier {
    channels: Vec<Channel>,
}

impl StaticChannelSatisfier {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChannelSatisfier for StaticChannelSatisfier {
    async fn satisfy(
        &self,
        group: &str,
        model: &str,
        _retry: u32,
        excluded: &HashSet<i64>,
    ) -> Result<Option<Channel>, SatisfyError> {
        let mut candidates = self
            .channels
            .iter()
            .filter(|channel| channel.serves(group, model))
            .peekable();
        if candidates.peek().is_none() {
            return Ok(None);
        }
        candidates
            .find(|channel| !excluded.contains(&channel.id))
            .cloned()
            .map(Some)
            .ok_or(SatisfyError::AllFiltered)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// `None` means no channel is configured for the group and model at all.
    pub channel: Option<Channel>,
    /// Group actually used; differs from the requested one under `auto`.
    pub group: String,
}

/// Selects upstream channels, skipping temporarily disabled ones.
#[derive(Clone)]
pub struct ChannelDispatcher {
    satisfier: Arc<dyn ChannelSatisfier>,
    registry: Arc<ChannelDisableRegistry>,
    config: DispatchConfig,
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelDispatcher {
    pub fn new(
        satisfier: Arc<dyn ChannelSatisfier>,
        registry: Arc<ChannelDisableRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            satisfier,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelDisableRegistry> {
        &self.registry
    }

    pub async fn select_channel(
        &self,
        ctx: &mut RelayContext,
        group: &str,
        model: &str,
        retry: u32,
    ) -> Result<Selection, DispatchError> {
        if group != AUTO_GROUP {
            let channel = self.select_with_skip(ctx, group, model, retry).await?;
            return Ok(Selection {
                channel,
                group: group.to_string(),
            });
        }

        if self.config.auto_groups.is_empty() {
            return Err(DispatchError::AutoGroupsDisabled);
        }

        let mut last_disabled = None;
        for auto_group in self.config.auto_groups_for(&ctx.user_group) {
            tracing::debug!(request_id = %ctx.request_id, group = %auto_group, "auto selecting group");
            match self.select_with_skip(ctx, &auto_group, model, retry).await {
                Ok(Some(channel)) => {
                    tracing::debug!(request_id = %ctx.request_id, group = %auto_group, "auto selected group");
                    ctx.auto_group = Some(auto_group.clone());
                    return Ok(Selection {
                        channel: Some(channel),
                        group: auto_group,
                    });
                }
                Ok(None) => continue,
                Err(err @ DispatchError::AllCandidatesDisabled { .. }) => {
                    last_disabled = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        match last_disabled {
            Some(err) => Err(err),
            None => Ok(Selection {
                channel: None,
                group: group.to_string(),
            }),
        }
    }

    async fn select_with_skip(
        &self,
        ctx: &RelayContext,
        group: &str,
        model: &str,
        retry: u32,
    ) -> Result<Option<Channel>, DispatchError> {
        let exhausted = || DispatchError::AllCandidatesDisabled {
            group: group.to_string(),
            model: model.to_string(),
        };

        let mut excluded = HashSet::new();
        for _ in 0..MAX_DISABLED_SKIP_ATTEMPTS {
            let channel = match self.satisfier.satisfy(group, model, retry, &excluded).await {
                Ok(Some(channel)) => channel,
                Ok(None) => return Ok(None),
                Err(SatisfyError::AllFiltered) => return Err(exhausted()),
                Err(SatisfyError::Other(message)) => return Err(DispatchError::Satisfier(message)),
            };
            let Some(info) = self.registry.info(channel.id) else {
                return Ok(Some(channel));
            };
            tracing::warn!(
                request_id = %ctx.request_id,
                channel_id = channel.id,
                expire_at = %info.expire_at_rfc3339(),
                reason = %info.reason,
                "channel is temporarily disabled; skipping"
            );
            excluded.insert(channel.id);
        }
        Err(exhausted())
    }
}
