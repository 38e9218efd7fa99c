use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Operation, PricingCatalog, Provider};
use crate::clock::{Clock, SystemClock};
use crate::config::MeterConfig;
use crate::cost::{CostCalculator, Usage};
use crate::error::{BillingError, Result};
use crate::records::{CreditAccountRecord, CreditLedgerRecord, LedgerEntryKind, UsageBreakdown};
use crate::store::{ChargeCommand, ChargeOutcome, SqliteStore};

/// Lazy reset window: an account's allowance is restored on the first
/// charge attempt at least this long after the previous reset.
pub const RESET_WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub remaining: i64,
    pub granted: i64,
    pub used: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_operations: i64,
    pub total_credits: i64,
    pub breakdown: Vec<UsageBreakdown>,
}

/// The authoritative credit accounting API. Owns the per-user account rows
/// and the two append-only audit logs; all mutation goes through here.
#[derive(Clone)]
pub struct CreditLedger {
    store: SqliteStore,
    calculator: CostCalculator,
    clock: Arc<dyn Clock>,
    bootstrap_credits: i64,
    monthly_allowance: i64,
}

impl CreditLedger {
    pub fn new(store: SqliteStore, catalog: PricingCatalog, config: &MeterConfig) -> Self {
        Self::with_clock(store, catalog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: SqliteStore,
        catalog: PricingCatalog,
        config: &MeterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            calculator: CostCalculator::new(catalog),
            clock,
            bootstrap_credits: config.bootstrap_credits,
            monthly_allowance: config.monthly_allowance,
        }
    }

    pub fn calculator(&self) -> &CostCalculator {
        &self.calculator
    }

    /// Create the account with its free-tier bootstrap if missing, then
    /// return it. Used by the resolver's advisory check.
    pub async fn ensure_account(&self, user_id: &str) -> Result<CreditAccountRecord> {
        let now_ms = self.clock.now_epoch_millis();
        let account = self
            .store
            .ensure_account(user_id, self.bootstrap_credits, self.monthly_allowance, now_ms)
            .await?;
        Ok(account)
    }

    /// The authoritative charge. Performs the lazy reset, the guarded
    /// decrement, and both audit rows in one transaction; returns a tagged
    /// outcome rather than an error for the expected insufficient-funds
    /// case.
    pub async fn charge_atomic(
        &self,
        user_id: &str,
        credits: i64,
        operation: Operation,
        provider: Provider,
        usage: &Usage,
        was_free: bool,
    ) -> Result<ChargeOutcome> {
        let now_ms = self.clock.now_epoch_millis();
        let command = ChargeCommand {
            user_id: user_id.to_string(),
            credits,
            description: format!("{operation} via {provider}"),
            metadata: serde_json::json!({
                "operation": operation,
                "provider": provider,
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
            }),
            model: format!("{provider}:{operation}"),
            input_tokens: i64::from(usage.input_tokens),
            output_tokens: i64::from(usage.output_tokens),
            was_free,
        };
        let outcome = self
            .store
            .charge_atomic(command, now_ms, RESET_WINDOW_MS)
            .await?;
        tracing::debug!(
            user_id,
            operation = operation.as_str(),
            credits,
            charged = outcome.is_charged(),
            balance = outcome.balance(),
            "charge outcome"
        );
        Ok(outcome)
    }

    /// Convenience wrapper for exception-style call sites: computes the
    /// credit cost from reported usage, charges it, and converts a failed
    /// outcome into `BillingError::InsufficientCredits`. Returns the
    /// balance after the charge.
    pub async fn charge_credits(
        &self,
        user_id: &str,
        operation: Operation,
        provider: Provider,
        usage: &Usage,
        was_free: bool,
    ) -> Result<i64> {
        let cost = self.calculator.cost(operation, provider, usage);
        match self
            .charge_atomic(user_id, cost.credits, operation, provider, usage, was_free)
            .await?
        {
            ChargeOutcome::Charged { balance_after } => Ok(balance_after),
            ChargeOutcome::InsufficientCredits { balance } => {
                Err(BillingError::InsufficientCredits { balance })
            }
        }
    }

    /// Additive grant; cannot cause overspend, so concurrent grants simply
    /// commute. Creates the account (with its bootstrap) if needed.
    pub async fn grant_credits(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64> {
        self.add_credits(user_id, amount, LedgerEntryKind::Grant, reason)
            .await
    }

    /// Purchase variant of a grant; same semantics, distinct ledger kind.
    pub async fn record_purchase(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<i64> {
        self.add_credits(user_id, amount, LedgerEntryKind::Purchase, description)
            .await
    }

    async fn add_credits(
        &self,
        user_id: &str,
        amount: i64,
        kind: LedgerEntryKind,
        description: &str,
    ) -> Result<i64> {
        self.ensure_account(user_id).await?;
        let now_ms = self.clock.now_epoch_millis();
        let balance = self
            .store
            .grant(user_id, amount, kind, description, now_ms)
            .await?;
        Ok(balance)
    }

    /// Plain read; a missing account reads as all zeroes.
    pub async fn balance(&self, user_id: &str) -> Result<BalanceSummary> {
        let account = self.store.account(user_id).await?;
        Ok(match account {
            Some(account) => BalanceSummary {
                remaining: account.messages_remaining,
                granted: account.total_granted,
                used: account.total_used,
            },
            None => BalanceSummary {
                remaining: 0,
                granted: 0,
                used: 0,
            },
        })
    }

    pub async fn usage_stats(&self, user_id: &str) -> Result<UsageStats> {
        let breakdown = self.store.usage_breakdown(user_id).await?;
        let total_operations = breakdown.iter().map(|row| row.operations).sum();
        let total_credits = breakdown.iter().map(|row| row.credits).sum();
        Ok(UsageStats {
            total_operations,
            total_credits,
            breakdown,
        })
    }

    /// Recent audit rows, newest first.
    pub async fn ledger_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditLedgerRecord>> {
        Ok(self.store.ledger_entries(user_id, limit).await?)
    }

    pub(crate) fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub(crate) fn now_epoch_millis(&self) -> i64 {
        self.clock.now_epoch_millis()
    }

    pub(crate) fn bootstrap_credits(&self) -> i64 {
        self.bootstrap_credits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now_epoch_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config() -> MeterConfig {
        MeterConfig {
            system_keys: Default::default(),
            bootstrap_credits: 10,
            monthly_allowance: 50,
        }
    }

    async fn ledger(clock: Arc<FixedClock>) -> (tempfile::TempDir, CreditLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credits.sqlite"));
        store.init().await.expect("init");
        let ledger = CreditLedger::with_clock(store, PricingCatalog::default(), &config(), clock);
        (dir, ledger)
    }

    #[tokio::test]
    async fn charge_credits_returns_balance_after() {
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let (_dir, ledger) = ledger(clock).await;
        ledger.ensure_account("u1").await.expect("account");

        let balance = ledger
            .charge_credits(
                "u1",
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1_000, 500),
                false,
            )
            .await
            .expect("charge");
        // Fresh account resets to the monthly allowance, then charges the
        // 1-credit floor cost.
        assert_eq!(balance, 49);
    }

    #[tokio::test]
    async fn charge_credits_throws_on_empty_account() {
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let (_dir, ledger) = ledger(clock.clone()).await;
        ledger.ensure_account("u1").await.expect("account");
        // Drain the account.
        ledger
            .charge_atomic(
                "u1",
                50,
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1, 1),
                false,
            )
            .await
            .expect("drain");

        let err = ledger
            .charge_credits(
                "u1",
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1, 1),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits { balance: 0 }
        ));
    }

    #[tokio::test]
    async fn reset_fires_once_per_window() {
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let (_dir, ledger) = ledger(clock.clone()).await;
        ledger.ensure_account("u1").await.expect("account");

        // First charge: null last_reset_at, reset to 50 then charge.
        let outcome = ledger
            .charge_atomic(
                "u1",
                1,
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1, 1),
                false,
            )
            .await
            .expect("charge");
        assert_eq!(outcome, ChargeOutcome::Charged { balance_after: 49 });

        // Second charge in the same window: no reset.
        clock.0.store(1_000 + RESET_WINDOW_MS / 2, Ordering::SeqCst);
        let outcome = ledger
            .charge_atomic(
                "u1",
                1,
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1, 1),
                false,
            )
            .await
            .expect("charge");
        assert_eq!(outcome, ChargeOutcome::Charged { balance_after: 48 });

        // Past the window: reset fires again, exactly once.
        clock.0.store(1_000 + RESET_WINDOW_MS + 1, Ordering::SeqCst);
        let outcome = ledger
            .charge_atomic(
                "u1",
                1,
                Operation::Chat,
                Provider::OpenAi,
                &Usage::tokens(1, 1),
                false,
            )
            .await
            .expect("charge");
        assert_eq!(outcome, ChargeOutcome::Charged { balance_after: 49 });
    }

    #[tokio::test]
    async fn balance_and_stats_reflect_activity() {
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let (_dir, ledger) = ledger(clock).await;

        let summary = ledger.balance("nobody").await.expect("balance");
        assert_eq!(summary.remaining, 0);

        ledger.ensure_account("u1").await.expect("account");
        ledger
            .charge_atomic(
                "u1",
                3,
                Operation::ReceiptOcr,
                Provider::Gemini,
                &Usage::tokens(500, 100),
                false,
            )
            .await
            .expect("charge");
        ledger
            .record_purchase("u1", 100, "credit pack")
            .await
            .expect("purchase");

        let summary = ledger.balance("u1").await.expect("balance");
        assert_eq!(summary.remaining, 50 - 3 + 100);
        assert_eq!(summary.used, 3);
        assert_eq!(summary.granted, 110);

        let stats = ledger.usage_stats("u1").await.expect("stats");
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.total_credits, 3);
        assert_eq!(stats.breakdown[0].model, "gemini:receipt_ocr");
    }
}
