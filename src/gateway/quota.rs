use std::sync::Arc;

use tokio::task::JoinHandle;

use super::config::QuotaConfig;
use super::error::{LedgerError, RelayError, StoreError};
use super::observability::AdmissionCounters;
use super::subscription_ledger::SubscriptionLedger;
use super::tasks::TaskPool;
use super::user_store::UserStore;
use super::{RelayContext, RelayMode};

/// Reserves quota before the upstream call and reconciles it afterwards.
///
/// Subscription users on the Claude beta messages or Responses endpoints are
/// charged against their subscription entitlements; every other request is
/// charged against the wallet balance.
#[derive(Clone)]
pub struct QuotaAdmissionController {
    store: Arc<dyn UserStore>,
    ledger: SubscriptionLedger,
    tasks: TaskPool,
    config: QuotaConfig,
    counters: Arc<AdmissionCounters>,
}

impl std::fmt::Debug for QuotaAdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaAdmissionController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QuotaAdmissionController {
    pub fn new(
        store: Arc<dyn UserStore>,
        ledger: SubscriptionLedger,
        tasks: TaskPool,
        config: QuotaConfig,
        counters: Arc<AdmissionCounters>,
    ) -> Self {
        Self {
            store,
            ledger,
            tasks,
            config,
            counters,
        }
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    pub fn uses_subscription(&self, ctx: &RelayContext) -> bool {
        ctx.user_group == self.config.subscription_group
            && (ctx.is_claude_beta_query || ctx.relay_mode == RelayMode::Responses)
    }

    pub async fn pre_consume(&self, amount: i64, ctx: &mut RelayContext) -> Result<(), RelayError> {
        let amount = amount.max(0);
        if self.uses_subscription(ctx) {
            return self.pre_consume_subscription(amount, ctx).await;
        }
        self.pre_consume_wallet(amount, ctx).await
    }

    async fn pre_consume_subscription(
        &self,
        amount: i64,
        ctx: &mut RelayContext,
    ) -> Result<(), RelayError> {
        let now_sec = self.ledger.now_sec();
        match self.ledger.pre_consume(ctx.user_id, now_sec, amount).await {
            Ok(selection) => {
                ctx.subscription_selection = Some(selection);
                ctx.final_pre_consumed_quota = amount;
                self.counters.record_quota_reserved();
                Ok(())
            }
            Err(LedgerError::Exhausted) => {
                self.counters.record_quota_rejected();
                Err(RelayError::SubscriptionQuotaExhausted)
            }
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    error = %err,
                    "subscription pre-consume failed"
                );
                Err(RelayError::DataUpdate {
                    message: err.to_string(),
                })
            }
        }
    }

    async fn pre_consume_wallet(&self, amount: i64, ctx: &mut RelayContext) -> Result<(), RelayError> {
        let balance = self
            .store
            .wallet_balance(ctx.user_id)
            .await
            .map_err(|err| RelayError::QueryData {
                message: err.to_string(),
            })?;
        if balance <= 0 || balance - amount < 0 {
            self.counters.record_quota_rejected();
            return Err(RelayError::WalletQuotaExhausted {
                balance,
                required: amount,
            });
        }

        ctx.user_quota = balance;
        let trust_quota = self.config.trust_quota;
        let mut amount = amount;
        if balance > trust_quota && (ctx.token_unlimited || ctx.token_quota > trust_quota) {
            tracing::info!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                token_id = ctx.token_id,
                balance,
                "quota is ample; trusting token and skipping pre-consume"
            );
            self.counters.record_quota_trusted();
            amount = 0;
        }

        if amount > 0 {
            match self
                .store
                .pre_debit(ctx.user_id, ctx.token_id, ctx.token_unlimited, amount)
                .await
            {
                Ok(()) => {}
                Err(err @ StoreError::InsufficientTokenQuota { .. }) => {
                    self.counters.record_quota_rejected();
                    return Err(RelayError::TokenQuotaFailed {
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::error!(
                        request_id = %ctx.request_id,
                        user_id = ctx.user_id,
                        error = %err,
                        "wallet pre-consume failed"
                    );
                    return Err(RelayError::DataUpdate {
                        message: err.to_string(),
                    });
                }
            }
            tracing::info!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                amount,
                remaining = balance - amount,
                "pre-consumed quota"
            );
            self.counters.record_quota_reserved();
        }
        ctx.final_pre_consumed_quota = amount;
        Ok(())
    }

    /// Gives back the reservation in the background. The reservation is taken
    /// out of `ctx`, so a second call is a no-op.
    pub fn return_pre_consumed(&self, ctx: &mut RelayContext) -> Option<JoinHandle<()>> {
        let amount = std::mem::take(&mut ctx.final_pre_consumed_quota);
        if amount == 0 {
            return None;
        }
        tracing::info!(
            request_id = %ctx.request_id,
            user_id = ctx.user_id,
            amount,
            "request failed; returning pre-consumed quota"
        );

        let counters = self.counters.clone();
        let user_id = ctx.user_id;
        if self.uses_subscription(ctx) {
            let Some(selection) = ctx.subscription_selection.take() else {
                tracing::error!(user_id, "no subscription selection to return quota to");
                counters.record_reconcile_failure();
                return None;
            };
            let ledger = self.ledger.clone();
            return Some(self.tasks.submit("return_subscription_quota", async move {
                match ledger
                    .adjust_by_selection_token(user_id, &selection, -amount)
                    .await
                {
                    Ok(()) => counters.record_quota_returned(),
                    Err(err) => {
                        counters.record_reconcile_failure();
                        tracing::error!(user_id, error = %err, "error returning pre-consumed subscription quota");
                    }
                }
            }));
        }

        let store = self.store.clone();
        let token_id = ctx.token_id;
        let token_unlimited = ctx.token_unlimited;
        Some(self.tasks.submit("return_wallet_quota", async move {
            match store
                .post_consume(user_id, token_id, token_unlimited, -amount)
                .await
            {
                Ok(()) => counters.record_quota_returned(),
                Err(err) => {
                    counters.record_reconcile_failure();
                    tracing::error!(user_id, error = %err, "error returning pre-consumed quota");
                }
            }
        }))
    }

    /// Settles the difference between measured usage and the reservation.
    /// Positive `delta` charges more, negative returns the excess.
    pub async fn post_consume(&self, ctx: &RelayContext, delta: i64) -> Result<(), RelayError> {
        if delta == 0 {
            return Ok(());
        }
        if self.uses_subscription(ctx) {
            let Some(selection) = ctx.subscription_selection.as_ref() else {
                return Err(RelayError::DataUpdate {
                    message: "missing subscription selection".to_string(),
                });
            };
            return match self
                .ledger
                .adjust_by_selection_token(ctx.user_id, selection, delta)
                .await
            {
                Ok(()) => Ok(()),
                Err(LedgerError::Exhausted) => Err(RelayError::SubscriptionQuotaExhausted),
                Err(err) => Err(RelayError::DataUpdate {
                    message: err.to_string(),
                }),
            };
        }

        self.store
            .post_consume(ctx.user_id, ctx.token_id, ctx.token_unlimited, delta)
            .await
            .map_err(|err| RelayError::DataUpdate {
                message: err.to_string(),
            })
    }
}
