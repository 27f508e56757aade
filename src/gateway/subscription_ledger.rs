use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::error::{LedgerError, StoreError};
use super::subscription::{SelectionToken, SubscriptionData};
use super::tasks::PeriodicTask;
use super::user_store::{RowCommit, UserStore};
use super::Clock;

/// Counts from one pass over the subscription group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub visited: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Per-user subscription entitlements, mutated one locked row at a time.
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
    subscription_group: String,
}

impl std::fmt::Debug for SubscriptionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLedger")
            .field("subscription_group", &self.subscription_group)
            .finish_non_exhaustive()
    }
}

impl SubscriptionLedger {
    pub fn new(
        store: Arc<dyn UserStore>,
        clock: Arc<dyn Clock>,
        subscription_group: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            subscription_group: subscription_group.into(),
        }
    }

    pub fn subscription_group(&self) -> &str {
        &self.subscription_group
    }

    pub fn now_sec(&self) -> i64 {
        i64::try_from(self.clock.now_epoch_seconds()).unwrap_or(i64::MAX)
    }

    /// Debits `amount` from the first eligible item and returns the token
    /// that identifies it for later reconciliation.
    pub async fn pre_consume(
        &self,
        user_id: i64,
        now_sec: i64,
        amount: i64,
    ) -> Result<SelectionToken, LedgerError> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "invalid user id: {user_id}"
            )));
        }
        if amount < 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "invalid amount: {amount}"
            )));
        }

        let commit = self
            .store
            .update_subscription_data(
                user_id,
                Box::new(move |raw: &str| {
                    let (mut data, legacy) =
                        SubscriptionData::parse(raw).map_err(LedgerError::Decode)?;
                    let changed = data.reset_and_prune(now_sec);
                    let selection = data
                        .consume_first_usable(now_sec, amount)
                        .ok_or(LedgerError::Exhausted)?;
                    let raw = if legacy || changed || amount > 0 {
                        Some(data.to_json_string().map_err(LedgerError::Decode)?)
                    } else {
                        None
                    };
                    Ok(RowCommit {
                        raw,
                        selection: Some(selection),
                    })
                }),
            )
            .await?;

        commit.selection.ok_or(LedgerError::Exhausted)
    }

    /// Applies extra consumption (`delta > 0`) or a refund (`delta < 0`) to
    /// the item a previous pre-consume selected.
    pub async fn adjust_by_selection_token(
        &self,
        user_id: i64,
        token: &SelectionToken,
        delta: i64,
    ) -> Result<(), LedgerError> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "invalid user id: {user_id}"
            )));
        }
        if !token.is_well_formed() {
            return Err(LedgerError::InvalidToken(token.to_string()));
        }
        if delta == 0 {
            return Ok(());
        }

        let token = token.clone();
        self.store
            .update_subscription_data(
                user_id,
                Box::new(move |raw: &str| {
                    let (mut data, _) =
                        SubscriptionData::parse(raw).map_err(LedgerError::Decode)?;
                    let index = data.find_by_token(&token).ok_or(LedgerError::ItemNotFound)?;
                    data.items[index].apply_delta(delta)?;
                    Ok(RowCommit {
                        raw: Some(data.to_json_string().map_err(LedgerError::Decode)?),
                        selection: Some(token),
                    })
                }),
            )
            .await?;
        Ok(())
    }

    /// Resets and prunes one user's document. Returns whether it was
    /// rewritten.
    pub async fn reset_user(&self, user_id: i64, now_sec: i64) -> Result<bool, LedgerError> {
        let commit = self
            .store
            .update_subscription_data(
                user_id,
                Box::new(move |raw: &str| {
                    let (mut data, legacy) =
                        SubscriptionData::parse(raw).map_err(LedgerError::Decode)?;
                    let changed = data.reset_and_prune(now_sec);
                    if !legacy && !changed {
                        return Ok(RowCommit::default());
                    }
                    Ok(RowCommit {
                        raw: Some(data.to_json_string().map_err(LedgerError::Decode)?),
                        selection: None,
                    })
                }),
            )
            .await?;
        Ok(commit.raw.is_some())
    }

    /// Visits every user in the subscription group, each in its own row
    /// transaction. Per-user failures are logged and counted, never fatal.
    pub async fn reset_all_users(&self, now_sec: i64) -> Result<ResetSummary, StoreError> {
        let user_ids = self
            .store
            .subscription_user_ids(&self.subscription_group)
            .await?;

        let mut summary = ResetSummary::default();
        for user_id in user_ids {
            summary.visited += 1;
            match self.reset_user(user_id, now_sec).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => {}
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(user_id, error = %err, "failed to reset subscription data");
                }
            }
        }
        Ok(summary)
    }

    /// Runs [`Self::reset_all_users`] every `period`, starting immediately.
    pub fn spawn_reset_sweep(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let ledger = self.clone();
        PeriodicTask::spawn("subscription_reset_sweep", period, true, move || {
            let ledger = ledger.clone();
            async move {
                let now_sec = ledger.now_sec();
                match ledger.reset_all_users(now_sec).await {
                    Ok(summary) => tracing::info!(
                        visited = summary.visited,
                        updated = summary.updated,
                        failed = summary.failed,
                        "subscription reset sweep finished"
                    ),
                    Err(err) => {
                        tracing::error!(error = %err, "subscription reset sweep failed")
                    }
                }
            }
        })
    }
}
