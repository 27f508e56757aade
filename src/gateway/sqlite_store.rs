use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::error::{LedgerError, StoreError};
use super::user_store::{RowCommit, RowUpdate, UserStore};

/// User rows in a SQLite file.
///
/// Every mutation runs in a `BEGIN IMMEDIATE` transaction, which takes the
/// database write lock up front; that stands in for a per-row
/// `SELECT ... FOR UPDATE`.
#[derive(Clone, Debug)]
pub struct SqliteUserStore {
    path: PathBuf,
}

impl SqliteUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_user(
        &self,
        user_id: i64,
        group: &str,
        quota: i64,
        subscription_data: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let group = group.to_string();
        let subscription_data = subscription_data.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO users (id, user_group, quota, subscription_data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    user_group=excluded.user_group,
                    quota=excluded.quota,
                    subscription_data=excluded.subscription_data",
                rusqlite::params![user_id, group, quota, subscription_data],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_token(
        &self,
        token_id: i64,
        user_id: i64,
        remain_quota: i64,
        unlimited: bool,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO tokens (id, user_id, remain_quota, unlimited)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id=excluded.user_id,
                    remain_quota=excluded.remain_quota,
                    unlimited=excluded.unlimited",
                rusqlite::params![token_id, user_id, remain_quota, unlimited],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn load_subscription_data(&self, user_id: i64) -> Result<String, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<String, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            select_subscription_data(&conn, user_id)
        })
        .await?
    }

    pub async fn token_remain_quota(&self, token_id: i64) -> Result<Option<i64>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let remain = conn
                .query_row(
                    "SELECT remain_quota FROM tokens WHERE id=?1",
                    rusqlite::params![token_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(remain)
        })
        .await?
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn update_subscription_data(
        &self,
        user_id: i64,
        update: RowUpdate,
    ) -> Result<RowCommit, LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<RowCommit, LedgerError> {
            let mut conn = open_connection(path).map_err(StoreError::from)?;
            init_schema(&conn).map_err(StoreError::from)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::from)?;

            let raw = select_subscription_data(&tx, user_id)?;
            let commit = update(&raw)?;
            if let Some(next) = commit.raw.as_deref() {
                tx.execute(
                    "UPDATE users SET subscription_data=?1 WHERE id=?2",
                    rusqlite::params![next, user_id],
                )
                .map_err(StoreError::from)?;
            }
            tx.commit().map_err(StoreError::from)?;
            Ok(commit)
        })
        .await
        .map_err(StoreError::from)?
    }

    async fn subscription_user_ids(&self, group: &str) -> Result<Vec<i64>, StoreError> {
        let path = self.path.clone();
        let group = group.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<i64>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare("SELECT id FROM users WHERE user_group=?1 ORDER BY id")?;
            let rows = stmt.query_map(rusqlite::params![group], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
        .await?
    }

    async fn wallet_balance(&self, user_id: i64) -> Result<i64, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            select_quota(&conn, user_id)
        })
        .await?
    }

    async fn pre_debit(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        amount: i64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if !token_unlimited {
                let updated = tx.execute(
                    "UPDATE tokens SET remain_quota = remain_quota - ?1
                     WHERE id=?2 AND remain_quota >= ?1",
                    rusqlite::params![amount, token_id],
                )?;
                if updated == 0 {
                    let remain = tx
                        .query_row(
                            "SELECT remain_quota FROM tokens WHERE id=?1",
                            rusqlite::params![token_id],
                            |row| row.get::<_, i64>(0),
                        )
                        .optional()?
                        .unwrap_or(0);
                    return Err(StoreError::InsufficientTokenQuota {
                        token_id,
                        remain,
                        required: amount,
                    });
                }
            }

            let updated = tx.execute(
                "UPDATE users SET quota = quota - ?1 WHERE id=?2 AND quota >= ?1",
                rusqlite::params![amount, user_id],
            )?;
            if updated == 0 {
                let balance = select_quota(&tx, user_id)?;
                return Err(StoreError::InsufficientWallet {
                    user_id,
                    balance,
                    required: amount,
                });
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        token_unlimited: bool,
        delta: i64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !token_unlimited {
                tx.execute(
                    "UPDATE tokens SET remain_quota = remain_quota - ?1 WHERE id=?2",
                    rusqlite::params![delta, token_id],
                )?;
            }
            let updated = tx.execute(
                "UPDATE users SET quota = quota - ?1 WHERE id=?2",
                rusqlite::params![delta, user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::UserNotFound(user_id));
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }
}

fn select_subscription_data(conn: &rusqlite::Connection, user_id: i64) -> Result<String, StoreError> {
    let raw = conn
        .query_row(
            "SELECT subscription_data FROM users WHERE id=?1",
            rusqlite::params![user_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .ok_or(StoreError::UserNotFound(user_id))?;
    Ok(raw.unwrap_or_default())
}

fn select_quota(conn: &rusqlite::Connection, user_id: i64) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT quota FROM users WHERE id=?1",
        rusqlite::params![user_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()?
    .ok_or(StoreError::UserNotFound(user_id))
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY NOT NULL,
            user_group TEXT NOT NULL DEFAULT 'default',
            quota INTEGER NOT NULL DEFAULT 0,
            subscription_data TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_users_user_group ON users(user_group);

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            remain_quota INTEGER NOT NULL DEFAULT 0,
            unlimited INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}
