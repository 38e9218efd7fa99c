//! AI credit metering and provider-key routing core.
//!
//! Decides, for every AI-backed feature, which provider key to use (BYOK,
//! free-tier bootstrap, or metered system key) and whether/how much to
//! charge the user, with an atomic no-overspend credit ledger, a lazy
//! monthly allowance reset, and a durable audit trail.
//!
//! The intended flow is two-phase: call [`KeyResolver::resolve`] for a fast
//! advisory balance check and the key, invoke the AI provider yourself,
//! then report actual usage through [`CreditLedger::charge_credits`] (or
//! [`CreditLedger::charge_atomic`] for a tagged result). The window between
//! the advisory check and the authoritative charge is deliberate: holding a
//! lock across an external network call would serialize all AI usage per
//! user. A request that loses the race is charged nothing and fails with
//! `InsufficientCredits` after the provider call; the caller decides
//! whether to still deliver the result.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod cost;
mod error;
pub mod ledger;
pub mod records;
pub mod resolver;
pub mod secrets;
pub mod store;

pub use catalog::{Operation, PricingCatalog, Provider, TokenPricing};
pub use clock::{Clock, SystemClock};
pub use config::MeterConfig;
pub use cost::{CostCalculator, CreditCost, Usage};
pub use error::{BillingError, Result};
pub use ledger::{BalanceSummary, CreditLedger, RESET_WINDOW_MS, UsageStats};
pub use records::{
    CreditAccountRecord, CreditLedgerRecord, LedgerEntryKind, UsageBreakdown, UsageLogRecord,
};
pub use resolver::{ApiKeyResult, BillingMode, KeyResolver};
pub use secrets::{SecretError, SecretStore};
pub use store::{ChargeCommand, ChargeOutcome, SqliteStore, StoreError};
