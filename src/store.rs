use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::records::{
    CreditAccountRecord, CreditLedgerRecord, LedgerEntryKind, UsageBreakdown, UsageLogRecord,
};

/// Sqlite-backed persistence for credit accounts, the append-only credit
/// ledger, the usage log, and encrypted BYOK key rows. Connections are
/// opened per call on the blocking pool; the schema is initialised
/// idempotently on every open.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown ledger entry kind: {0}")]
    UnknownLedgerKind(String),
    #[error("amount must be positive: {amount}")]
    InvalidAmount { amount: i64 },
}

/// Everything the atomic charge needs to persist, computed by the caller
/// before the transaction starts.
#[derive(Clone, Debug)]
pub struct ChargeCommand {
    pub user_id: String,
    pub credits: i64,
    pub description: String,
    pub metadata: serde_json::Value,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub was_free: bool,
}

/// Tagged result of the authoritative charge. "No money" is an outcome,
/// not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged { balance_after: i64 },
    InsufficientCredits { balance: i64 },
}

impl ChargeOutcome {
    pub fn is_charged(&self) -> bool {
        matches!(self, ChargeOutcome::Charged { .. })
    }

    /// The balance after the operation, whichever way it went.
    pub fn balance(&self) -> i64 {
        match self {
            ChargeOutcome::Charged { balance_after } => *balance_after,
            ChargeOutcome::InsufficientCredits { balance } => *balance,
        }
    }
}

impl SqliteStore {
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

    /// Create the account with its free-tier bootstrap grant if it does not
    /// exist, then return it. Creation writes a `grant` ledger row; an
    /// existing account is returned untouched.
    pub async fn ensure_account(
        &self,
        user_id: &str,
        bootstrap_credits: i64,
        monthly_allowance: i64,
        now_ms: i64,
    ) -> Result<CreditAccountRecord, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<CreditAccountRecord, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO credit_accounts
                     (user_id, messages_remaining, monthly_allowance, total_granted,
                      total_used, last_reset_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?2, 0, NULL, ?4, ?4)",
                rusqlite::params![user_id, bootstrap_credits, monthly_allowance, now_ms],
            )?;
            if inserted > 0 {
                insert_ledger_row(
                    &tx,
                    &user_id,
                    LedgerEntryKind::Grant,
                    bootstrap_credits,
                    0,
                    bootstrap_credits,
                    "free tier bootstrap grant",
                    "{}",
                    now_ms,
                )?;
            }

            let account = read_account(&tx, &user_id)?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok(account)
        })
        .await?
    }

    /// Plain unlocked read. Advisory only.
    pub async fn account(&self, user_id: &str) -> Result<Option<CreditAccountRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CreditAccountRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(read_account(&conn, &user_id)?)
        })
        .await?
    }

    /// The authoritative charge. One write transaction covering: the lazy
    /// 30-day reset, the balance check, the guarded decrement, and both
    /// audit rows.
    ///
    /// The reset is committed even when the subsequent charge fails for
    /// insufficient balance; the returned balance reflects it.
    ///
    /// `credits` must be positive: a non-positive charge would turn the
    /// guarded decrement into a mint and drive `total_used` backwards.
    pub async fn charge_atomic(
        &self,
        command: ChargeCommand,
        now_ms: i64,
        reset_window_ms: i64,
    ) -> Result<ChargeOutcome, StoreError> {
        if command.credits < 1 {
            return Err(StoreError::InvalidAmount {
                amount: command.credits,
            });
        }
        let path = self.path.clone();
        let metadata_json = serde_json::to_string(&command.metadata)?;

        tokio::task::spawn_blocking(move || -> Result<ChargeOutcome, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(i64, i64, Option<i64>)> = tx
                .query_row(
                    "SELECT messages_remaining, monthly_allowance, last_reset_at_ms
                     FROM credit_accounts WHERE user_id=?1",
                    rusqlite::params![command.user_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((mut remaining, allowance, last_reset_at_ms)) = row else {
                tx.commit()?;
                return Ok(ChargeOutcome::InsufficientCredits { balance: 0 });
            };

            let needs_reset = match last_reset_at_ms {
                None => true,
                Some(ts) => now_ms.saturating_sub(ts) >= reset_window_ms,
            };
            if needs_reset {
                tx.execute(
                    "UPDATE credit_accounts
                     SET messages_remaining=?2, last_reset_at_ms=?3, updated_at_ms=?3
                     WHERE user_id=?1",
                    rusqlite::params![command.user_id, allowance, now_ms],
                )?;
                insert_ledger_row(
                    &tx,
                    &command.user_id,
                    LedgerEntryKind::Reset,
                    allowance - remaining,
                    remaining,
                    allowance,
                    "monthly allowance reset",
                    "{}",
                    now_ms,
                )?;
                remaining = allowance;
            }

            if remaining < command.credits {
                // Keep the reset, if one happened.
                tx.commit()?;
                return Ok(ChargeOutcome::InsufficientCredits { balance: remaining });
            }

            // Guarded decrement, in addition to the write transaction.
            let affected = tx.execute(
                "UPDATE credit_accounts
                 SET messages_remaining = messages_remaining - ?2,
                     total_used = total_used + ?2,
                     updated_at_ms = ?3
                 WHERE user_id = ?1 AND messages_remaining >= ?2",
                rusqlite::params![command.user_id, command.credits, now_ms],
            )?;
            if affected == 0 {
                tx.commit()?;
                return Ok(ChargeOutcome::InsufficientCredits { balance: remaining });
            }

            let balance_after = remaining - command.credits;
            insert_ledger_row(
                &tx,
                &command.user_id,
                LedgerEntryKind::Usage,
                -command.credits,
                remaining,
                balance_after,
                &command.description,
                &metadata_json,
                now_ms,
            )?;
            tx.execute(
                "INSERT INTO usage_log
                     (user_id, model, input_tokens, output_tokens, message_count,
                      was_free, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    command.user_id,
                    command.model,
                    command.input_tokens,
                    command.output_tokens,
                    command.credits,
                    command.was_free,
                    now_ms
                ],
            )?;

            tx.commit()?;
            Ok(ChargeOutcome::Charged { balance_after })
        })
        .await?
    }

    /// Additive grant. No balance precondition: concurrent grants commute.
    /// The account row must already exist (see `ensure_account`).
    /// `amount` must be positive; a grant never removes credits.
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        kind: LedgerEntryKind,
        description: &str,
        now_ms: i64,
    ) -> Result<i64, StoreError> {
        if amount < 1 {
            return Err(StoreError::InvalidAmount { amount });
        }
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let description = description.to_string();

        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let balance_before: i64 = tx.query_row(
                "SELECT messages_remaining FROM credit_accounts WHERE user_id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE credit_accounts
                 SET messages_remaining = messages_remaining + ?2,
                     total_granted = total_granted + ?2,
                     updated_at_ms = ?3
                 WHERE user_id = ?1",
                rusqlite::params![user_id, amount, now_ms],
            )?;
            let balance_after = balance_before + amount;
            insert_ledger_row(
                &tx,
                &user_id,
                kind,
                amount,
                balance_before,
                balance_after,
                &description,
                "{}",
                now_ms,
            )?;

            tx.commit()?;
            Ok(balance_after)
        })
        .await?
    }

    /// Most recent ledger rows for a user, newest first.
    pub async fn ledger_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditLedgerRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<CreditLedgerRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, kind, messages_change, balance_before, balance_after,
                        description, metadata_json, created_at_ms
                 FROM credit_ledger
                 WHERE user_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, kind, change, before, after, description, metadata_json, created) = row?;
                let kind = LedgerEntryKind::parse(&kind)
                    .ok_or_else(|| StoreError::UnknownLedgerKind(kind.clone()))?;
                out.push(CreditLedgerRecord {
                    id,
                    user_id: user_id.clone(),
                    kind,
                    messages_change: change,
                    balance_before: before,
                    balance_after: after,
                    description,
                    metadata: serde_json::from_str(&metadata_json)?,
                    created_at_ms: created,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Usage aggregated by model key, for reporting.
    pub async fn usage_breakdown(&self, user_id: &str) -> Result<Vec<UsageBreakdown>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageBreakdown>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT model, COUNT(*), COALESCE(SUM(message_count), 0),
                        COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
                 FROM usage_log
                 WHERE user_id=?1
                 GROUP BY model
                 ORDER BY model",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                Ok(UsageBreakdown {
                    model: row.get(0)?,
                    operations: row.get(1)?,
                    credits: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Raw usage-log rows for a user, newest first.
    pub async fn usage_log_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageLogRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageLogRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, model, input_tokens, output_tokens, message_count,
                        was_free, created_at_ms
                 FROM usage_log
                 WHERE user_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok(UsageLogRecord {
                    id: row.get(0)?,
                    user_id: user_id.clone(),
                    model: row.get(1)?,
                    input_tokens: row.get(2)?,
                    output_tokens: row.get(3)?,
                    message_count: row.get(4)?,
                    was_free: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn put_user_key(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_key: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        let encrypted_key = encrypted_key.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO user_provider_keys (user_id, provider, encrypted_key, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, provider)
                 DO UPDATE SET encrypted_key=excluded.encrypted_key,
                               updated_at_ms=excluded.updated_at_ms",
                rusqlite::params![user_id, provider, encrypted_key, now_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn user_key(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<String>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let key = conn
                .query_row(
                    "SELECT encrypted_key FROM user_provider_keys
                     WHERE user_id=?1 AND provider=?2",
                    rusqlite::params![user_id, provider],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(key)
        })
        .await?
    }

    pub async fn delete_user_key(&self, user_id: &str, provider: &str) -> Result<(), StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "DELETE FROM user_provider_keys WHERE user_id=?1 AND provider=?2",
                rusqlite::params![user_id, provider],
            )?;
            Ok(())
        })
        .await?
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_ledger_row(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    kind: LedgerEntryKind,
    messages_change: i64,
    balance_before: i64,
    balance_after: i64,
    description: &str,
    metadata_json: &str,
    now_ms: i64,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO credit_ledger
             (user_id, kind, messages_change, balance_before, balance_after,
              description, metadata_json, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            user_id,
            kind.as_str(),
            messages_change,
            balance_before,
            balance_after,
            description,
            metadata_json,
            now_ms
        ],
    )?;
    Ok(())
}

fn read_account(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<CreditAccountRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT user_id, messages_remaining, monthly_allowance, total_granted,
                total_used, last_reset_at_ms, created_at_ms, updated_at_ms
         FROM credit_accounts WHERE user_id=?1",
        rusqlite::params![user_id],
        |row| {
            Ok(CreditAccountRecord {
                user_id: row.get(0)?,
                messages_remaining: row.get(1)?,
                monthly_allowance: row.get(2)?,
                total_granted: row.get(3)?,
                total_used: row.get(4)?,
                last_reset_at_ms: row.get(5)?,
                created_at_ms: row.get(6)?,
                updated_at_ms: row.get(7)?,
            })
        },
    )
    .optional()
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_accounts (
            user_id TEXT PRIMARY KEY NOT NULL,
            messages_remaining INTEGER NOT NULL DEFAULT 0,
            monthly_allowance INTEGER NOT NULL DEFAULT 0,
            total_granted INTEGER NOT NULL DEFAULT 0,
            total_used INTEGER NOT NULL DEFAULT 0,
            last_reset_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            messages_change INTEGER NOT NULL,
            balance_before INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            description TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_ledger_user_id
            ON credit_ledger(user_id, id);

        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            was_free INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_log_user_id
            ON usage_log(user_id, model);

        CREATE TABLE IF NOT EXISTS user_provider_keys (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            encrypted_key TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (user_id, provider)
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}
