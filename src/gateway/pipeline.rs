use std::sync::Arc;

use tokio::task::JoinHandle;

use super::RelayContext;
use super::dispatch::{Channel, ChannelDispatcher};
use super::error::RelayError;
use super::moderation::{InboundRequest, ModerationGate};
use super::observability::AdmissionCounters;
use super::quota::QuotaAdmissionController;
use super::relay_request::{RelayRequest, TokenCountMeta};

/// Channel a request was admitted to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    pub channel: Channel,
    /// Effective group, which differs from the requested one under `auto`.
    pub group: String,
}

/// What happened upstream once the request was forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// No usage was incurred; the reservation goes back.
    Failed,
    Succeeded { actual_quota: i64 },
}

/// Moderation, then dispatch, then quota reservation.
#[derive(Clone)]
pub struct AdmissionPipeline {
    gate: Arc<ModerationGate>,
    dispatcher: ChannelDispatcher,
    quota: QuotaAdmissionController,
    counters: Arc<AdmissionCounters>,
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("gate", &self.gate)
            .field("dispatcher", &self.dispatcher)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl AdmissionPipeline {
    pub fn new(
        gate: Arc<ModerationGate>,
        dispatcher: ChannelDispatcher,
        quota: QuotaAdmissionController,
        counters: Arc<AdmissionCounters>,
    ) -> Self {
        Self {
            gate,
            dispatcher,
            quota,
            counters,
        }
    }

    pub fn gate(&self) -> &ModerationGate {
        &self.gate
    }

    pub fn dispatcher(&self) -> &ChannelDispatcher {
        &self.dispatcher
    }

    pub fn quota(&self) -> &QuotaAdmissionController {
        &self.quota
    }

    pub fn counters(&self) -> &Arc<AdmissionCounters> {
        &self.counters
    }

    /// Nothing is reserved unless every step passes; a failed dispatch never
    /// touches quota.
    pub async fn admit(
        &self,
        ctx: &mut RelayContext,
        request: &dyn RelayRequest,
        meta: Option<&TokenCountMeta>,
        inbound: &InboundRequest,
        estimated_quota: i64,
        retry: u32,
    ) -> Result<Admission, RelayError> {
        let result = self
            .admit_inner(ctx, request, meta, inbound, estimated_quota, retry)
            .await;
        if let Err(err) = &result {
            if err.record_error_log() {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    status = err.status().as_u16(),
                    code = err.code(),
                    error = %err,
                    "admission failed"
                );
            } else {
                tracing::info!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    code = err.code(),
                    "admission rejected"
                );
            }
        }
        result
    }

    async fn admit_inner(
        &self,
        ctx: &mut RelayContext,
        request: &dyn RelayRequest,
        meta: Option<&TokenCountMeta>,
        inbound: &InboundRequest,
        estimated_quota: i64,
        retry: u32,
    ) -> Result<Admission, RelayError> {
        self.gate
            .enforce(ctx.relay_mode, ctx.relay_format, request, meta, inbound)
            .await?;

        let model = if ctx.original_model.is_empty() {
            request.model_name().to_string()
        } else {
            ctx.original_model.clone()
        };
        let group = ctx.using_group.clone();
        let selection = self
            .dispatcher
            .select_channel(ctx, &group, &model, retry)
            .await
            .map_err(|err| {
                let err = RelayError::from(err);
                if matches!(err, RelayError::ChannelPoolExhausted { .. }) {
                    self.counters.record_channel_pool_exhausted();
                }
                err
            })?;
        let Some(channel) = selection.channel else {
            return Err(RelayError::NoAvailableChannel {
                group: selection.group,
                model,
            });
        };
        self.counters.record_channel_selected();
        tracing::debug!(
            request_id = %ctx.request_id,
            channel_id = channel.id,
            group = %selection.group,
            model = %model,
            "channel selected"
        );

        self.quota.pre_consume(estimated_quota, ctx).await?;
        Ok(Admission {
            channel,
            group: selection.group,
        })
    }

    /// Returns the reservation on failure (in the background, handle
    /// returned) or charges the measured difference on success.
    ///
    /// Only the first call per context touches the ledger; any later call,
    /// whatever its outcome, is a no-op.
    pub async fn settle(
        &self,
        ctx: &mut RelayContext,
        outcome: UpstreamOutcome,
    ) -> Result<Option<JoinHandle<()>>, RelayError> {
        if ctx.settled {
            tracing::debug!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                ?outcome,
                "reservation already settled"
            );
            return Ok(None);
        }
        ctx.settled = true;
        match outcome {
            UpstreamOutcome::Failed => Ok(self.quota.return_pre_consumed(ctx)),
            UpstreamOutcome::Succeeded { actual_quota } => {
                let delta = actual_quota - ctx.final_pre_consumed_quota;
                let result = self.quota.post_consume(ctx, delta).await;
                ctx.final_pre_consumed_quota = 0;
                ctx.subscription_selection = None;
                if let Err(err) = result {
                    self.counters.record_reconcile_failure();
                    tracing::error!(
                        request_id = %ctx.request_id,
                        user_id = ctx.user_id,
                        delta,
                        error = %err,
                        "post-consume reconciliation failed"
                    );
                    return Err(err);
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::super::channel_disable::ChannelDisableRegistry;
    use super::super::config::{ChannelDisableConfig, DispatchConfig, ModerationConfig, QuotaConfig};
    use super::super::dispatch::StaticChannelSatisfier;
    use super::super::moderation_providers::StaticChannelDirectory;
    use super::super::probe::DEFAULT_PROBE_STRING;
    use super::super::redaction::ReportRedactor;
    use super::super::relay_request::OpenAiChatRequest;
    use super::super::subscription::SubscriptionData;
    use super::super::subscription_ledger::SubscriptionLedger;
    use super::super::tasks::TaskPool;
    use super::super::user_store::{MemoryUserStore, UserStore};
    use super::super::{ManualClock, RelayFormat, RelayMode};
    use super::*;

    const NOW_MS: u64 = 1_700_000_000_000;

    struct Fixture {
        pipeline: AdmissionPipeline,
        store: Arc<MemoryUserStore>,
        registry: Arc<ChannelDisableRegistry>,
        tasks: TaskPool,
    }

    fn fixture(channels: Vec<Channel>) -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let store = Arc::new(MemoryUserStore::new());
        store.insert_user(7, "default", 10_000, "");
        store.insert_token(70, 10_000);
        store.insert_user(8, "subscription", 0, &subscription_doc().to_string());

        let tasks = TaskPool::default();
        let counters = Arc::new(AdmissionCounters::default());
        let registry = Arc::new(ChannelDisableRegistry::new(
            clock.clone(),
            &ChannelDisableConfig::default(),
        ));
        let dispatcher = ChannelDispatcher::new(
            Arc::new(StaticChannelSatisfier::new(channels)),
            registry.clone(),
            DispatchConfig::default(),
        );
        let ledger = SubscriptionLedger::new(store.clone(), clock, "subscription");
        let quota = QuotaAdmissionController::new(
            store.clone(),
            ledger,
            tasks.clone(),
            QuotaConfig::default(),
            counters.clone(),
        );
        let gate = ModerationGate::new(
            &ModerationConfig::default(),
            Arc::new(StaticChannelDirectory::default()),
            Arc::new(ReportRedactor::default()),
            tasks.clone(),
            counters.clone(),
        )
        .expect("gate");

        Fixture {
            pipeline: AdmissionPipeline::new(Arc::new(gate), dispatcher, quota, counters),
            store,
            registry,
            tasks,
        }
    }

    fn channel(id: i64) -> Channel {
        Channel {
            id,
            name: format!("channel-{id}"),
            group: "default".to_string(),
            models: vec!["gpt-4o-mini".to_string()],
            key: "sk-upstream".to_string(),
        }
    }

    fn ctx() -> RelayContext {
        RelayContext {
            request_id: "req-1".to_string(),
            user_id: 7,
            user_group: "default".to_string(),
            using_group: "default".to_string(),
            token_id: 70,
            token_quota: 10_000,
            relay_mode: RelayMode::ChatCompletions,
            relay_format: RelayFormat::OpenAi,
            ..RelayContext::default()
        }
    }

    fn subscription_doc() -> serde_json::Value {
        let now = (NOW_MS / 1000) as i64;
        json!({"items": [{
            "plan_name": "pro",
            "plan_id": "plan-pro",
            "subscription_id": "sub-1",
            "owner": 8,
            "status": "deployed",
            "5h_limit": {"total": 1_000, "available": 1_000, "reset_at": now + 3_600},
            "7d_limit": {"total": 5_000, "available": 5_000, "reset_at": now + 86_400},
            "duration": {"start_at": now - 60, "end_at": now + 86_400}
        }]})
    }

    fn subscriber_ctx() -> RelayContext {
        RelayContext {
            request_id: "req-sub".to_string(),
            user_id: 8,
            user_group: "subscription".to_string(),
            using_group: "default".to_string(),
            token_id: 80,
            token_unlimited: true,
            relay_mode: RelayMode::Responses,
            relay_format: RelayFormat::OpenAiResponses,
            ..RelayContext::default()
        }
    }

    async fn subscription_windows(store: &MemoryUserStore) -> (i64, i64) {
        let raw = store.subscription_data(8).await.expect("user");
        let (data, _) = SubscriptionData::parse(&raw).expect("parse");
        (data.items[0].limit_5h.available, data.items[0].limit_7d.available)
    }

    fn request(text: &str) -> OpenAiChatRequest {
        serde_json::from_value(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": text}]
        }))
        .expect("request")
    }

    #[tokio::test]
    async fn admits_then_charges_measured_difference() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");

        let admission = fx
            .pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect("admitted");
        assert_eq!(admission.channel.id, 1);
        assert_eq!(admission.group, "default");
        assert_eq!(ctx.final_pre_consumed_quota, 300);
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 9_700);

        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("settled");
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 9_550);
        assert_eq!(fx.store.token_remain_quota(70), Some(9_550));
    }

    #[tokio::test]
    async fn failed_upstream_returns_reservation() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");
        fx.pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect("admitted");

        let handle = fx
            .pipeline
            .settle(&mut ctx, UpstreamOutcome::Failed)
            .await
            .expect("settled")
            .expect("return task");
        handle.await.expect("join");
        fx.tasks.drain().await;

        assert_eq!(ctx.final_pre_consumed_quota, 0);
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 10_000);
        assert_eq!(fx.pipeline.counters().snapshot().quota_returned, 1);
    }

    #[tokio::test]
    async fn disabled_pool_rejects_without_reserving() {
        let fx = fixture(vec![channel(1), channel(2)]);
        fx.registry.disable(1, Duration::from_secs(60), "upstream 429");
        fx.registry.disable(2, Duration::from_secs(60), "upstream 429");

        let mut ctx = ctx();
        let request = request("hello");
        let err = fx
            .pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect_err("exhausted");
        assert!(matches!(err, RelayError::ChannelPoolExhausted { .. }));
        assert!(!err.skip_retry());
        assert_eq!(ctx.final_pre_consumed_quota, 0);
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 10_000);
        assert_eq!(fx.pipeline.counters().snapshot().channel_pool_exhausted, 1);
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_model_has_no_channel() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        ctx.original_model = "unknown-model".to_string();
        let request = request("hello");
        let err = fx
            .pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect_err("no channel");
        assert!(matches!(err, RelayError::NoAvailableChannel { ref model, .. } if model == "unknown-model"));
    }

    #[tokio::test]
    async fn probe_request_never_reaches_dispatch() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request(&format!("hi {DEFAULT_PROBE_STRING}"));
        let err = fx
            .pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect_err("probe");
        assert!(matches!(err, RelayError::ProbeRejected));
        let snapshot = fx.pipeline.counters().snapshot();
        assert_eq!(snapshot.probe_rejected, 1);
        assert_eq!(snapshot.channels_selected, 0);
    }

    #[tokio::test]
    async fn wallet_shortfall_is_reported_with_amounts() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");
        let err = fx
            .pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 20_000, 0)
            .await
            .expect_err("insufficient");
        assert!(matches!(
            err,
            RelayError::WalletQuotaExhausted {
                balance: 10_000,
                required: 20_000
            }
        ));
        assert!(!err.record_error_log());
    }

    #[tokio::test]
    async fn wallet_settle_after_success_is_a_no_op() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");
        fx.pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect("admitted");

        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("settled");
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 9_550);
        assert!(ctx.settled);
        assert_eq!(ctx.final_pre_consumed_quota, 0);

        let handle = fx
            .pipeline
            .settle(&mut ctx, UpstreamOutcome::Failed)
            .await
            .expect("failed after success");
        assert!(handle.is_none());
        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("succeeded again");
        fx.tasks.drain().await;

        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 9_550);
        assert_eq!(fx.store.token_remain_quota(70), Some(9_550));
        assert_eq!(fx.pipeline.counters().snapshot().quota_returned, 0);
    }

    #[tokio::test]
    async fn wallet_success_after_failure_does_not_charge() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");
        fx.pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect("admitted");

        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Failed)
            .await
            .expect("settled");
        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("no-op");
        fx.tasks.drain().await;

        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 10_000);
        assert_eq!(fx.store.token_remain_quota(70), Some(10_000));
    }

    #[tokio::test]
    async fn subscription_settle_after_success_is_a_no_op() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = subscriber_ctx();
        let request = request("hello");
        fx.pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 300, 0)
            .await
            .expect("admitted");
        assert_eq!(subscription_windows(&fx.store).await, (700, 4_700));

        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("settled");
        assert_eq!(subscription_windows(&fx.store).await, (550, 4_550));
        assert!(ctx.subscription_selection.is_none());

        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Failed)
            .await
            .expect("failed after success");
        fx.pipeline
            .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 450 })
            .await
            .expect("succeeded again");
        fx.tasks.drain().await;

        assert_eq!(subscription_windows(&fx.store).await, (550, 4_550));
    }

    #[tokio::test]
    async fn zero_reservation_success_still_charges_once() {
        let fx = fixture(vec![channel(1)]);
        let mut ctx = ctx();
        let request = request("hello");
        fx.pipeline
            .admit(&mut ctx, &request, None, &InboundRequest::default(), 0, 0)
            .await
            .expect("admitted");

        for _ in 0..2 {
            fx.pipeline
                .settle(&mut ctx, UpstreamOutcome::Succeeded { actual_quota: 120 })
                .await
                .expect("settled");
        }
        assert_eq!(fx.store.wallet_balance(7).await.expect("balance"), 9_880);
    }
}
