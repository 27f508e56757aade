use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::error::{LedgerError, StoreError};
use super::subscription::SelectionToken;

/// Result of a row update: the replacement `subscription_data` text to
/// persist (if any) and the selection the update made.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowCommit {
    pub raw: Option<String>,
    pub selection: Option<SelectionToken>,
}

/// Read-modify-write step run against the stored `subscription_data` text
/// while the row is locked. Returning an error rolls the row back.
pub type RowUpdate = Box<dyn FnOnce(&str) -> Result<RowCommit, LedgerError> + Send>;

/// Transactional user-row store.
///
/// Implementations serialize `update_subscription_data` per user and apply
/// debits atomically: a failed `pre_debit` leaves both counters untouched.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn update_subscription_data(
        &self,
        user_id: i64,
        update: RowUpdate,
    ) -> Result<RowCommit, LedgerError>;

    async fn subscription_user_ids(&self, group: &str) -> Result<Vec<i64>, StoreError>;

    async fn wallet_balance(&self, user_id: i64) -> Result<i64, StoreError>;

    /// Debits the token counter (skipped for unlimited tokens) and the wallet
    /// by `amount` in one transaction.
    async fn pre_debit(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> Result<(), StoreError>;

    /// Signed reconciliation: positive `delta` charges, negative returns.
    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        delta: i64,
    ) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, Default)]
struct UserRow {
    group: String,
    quota: i64,
    subscription_data: String,
}

#[derive(Clone, Copy, Debug, Default)]
struct TokenRow {
    remain_quota: i64,
}

/// In-process store. Each user row has its own async mutex so requests for
/// different users never contend.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<i64, Arc<tokio::sync::Mutex<UserRow>>>>,
    tokens: Mutex<HashMap<i64, TokenRow>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user_id: i64, group: &str, quota: i64, subscription_data: &str) {
        let row = UserRow {
            group: group.to_string(),
            quota,
            subscription_data: subscription_data.to_string(),
        };
        self.users
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(user_id, Arc::new(tokio::sync::Mutex::new(row)));
    }

    pub fn insert_token(&self, token_id: i64, remain_quota: i64) {
        self.tokens
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(token_id, TokenRow { remain_quota });
    }

    pub fn token_remain_quota(&self, token_id: i64) -> Option<i64> {
        self.tokens
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(&token_id)
            .map(|token| token.remain_quota)
    }

    pub async fn subscription_data(&self, user_id: i64) -> Option<String> {
        let row = self.row(user_id).ok()?;
        let row = row.lock().await;
        Some(row.subscription_data.clone())
    }

    fn row(&self, user_id: i64) -> Result<Arc<tokio::sync::Mutex<UserRow>>, StoreError> {
        self.users
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::UserNotFound(user_id))
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn update_subscription_data(
        &self,
        user_id: i64,
        update: RowUpdate,
    ) -> Result<RowCommit, LedgerError> {
        let row = self.row(user_id)?;
        let mut row = row.lock().await;
        let commit = update(&row.subscription_data)?;
        if let Some(raw) = commit.raw.as_ref() {
            row.subscription_data = raw.clone();
        }
        Ok(commit)
    }

    async fn subscription_user_ids(&self, group: &str) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64, Arc<tokio::sync::Mutex<UserRow>>)> = self
            .users
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .map(|(id, row)| (*id, row.clone()))
            .collect();

        let mut ids = Vec::new();
        for (id, row) in rows {
            if row.lock().await.group == group {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn wallet_balance(&self, user_id: i64) -> Result<i64, StoreError> {
        let row = self.row(user_id)?;
        let row = row.lock().await;
        Ok(row.quota)
    }

    async fn pre_debit(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> Result<(), StoreError> {
        let row = self.row(user_id)?;
        let mut row = row.lock().await;
        let mut tokens = self.tokens.lock().unwrap_or_else(|err| err.into_inner());

        if !token_unlimited {
            let remain = tokens.get(&token_id).map(|token| token.remain_quota).unwrap_or(0);
            if remain < amount {
                return Err(StoreError::InsufficientTokenQuota {
                    token_id,
                    remain,
                    required: amount,
                });
            }
        }
        if row.quota < amount {
            return Err(StoreError::InsufficientWallet {
                user_id,
                balance: row.quota,
                required: amount,
            });
        }

        if !token_unlimited {
            if let Some(token) = tokens.get_mut(&token_id) {
                token.remain_quota -= amount;
            }
        }
        row.quota -= amount;
        Ok(())
    }

    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        delta: i64,
    ) -> Result<(), StoreError> {
        let row = self.row(user_id)?;
        let mut row = row.lock().await;
        if !token_unlimited {
            let mut tokens = self.tokens.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(token) = tokens.get_mut(&token_id) {
                token.remain_quota = token.remain_quota.saturating_sub(delta);
            }
        }
        row.quota = row.quota.saturating_sub(delta);
        Ok(())
    }
}
