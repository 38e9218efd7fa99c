use serde::{Deserialize, Serialize};

/// Per-user credit account. Mutated only inside store transactions;
/// `messages_remaining` is always the result of the last committed charge,
/// grant, or reset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditAccountRecord {
    pub user_id: String,
    pub messages_remaining: i64,
    pub monthly_allowance: i64,
    pub total_granted: i64,
    pub total_used: i64,
    /// `None` means the account has never been reset; the first charge
    /// restores the monthly allowance before applying itself.
    pub last_reset_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Usage,
    Grant,
    Purchase,
    Reset,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Usage => "usage",
            LedgerEntryKind::Grant => "grant",
            LedgerEntryKind::Purchase => "purchase",
            LedgerEntryKind::Reset => "reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "usage" => Some(LedgerEntryKind::Usage),
            "grant" => Some(LedgerEntryKind::Grant),
            "purchase" => Some(LedgerEntryKind::Purchase),
            "reset" => Some(LedgerEntryKind::Reset),
            _ => None,
        }
    }
}

/// One immutable audit row per balance change.
/// Invariant: `balance_after = balance_before + messages_change`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditLedgerRecord {
    pub id: i64,
    pub user_id: String,
    pub kind: LedgerEntryKind,
    pub messages_change: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at_ms: i64,
}

/// One row per AI call that was actually charged. Reporting only; never
/// authoritative for balance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    pub user_id: String,
    /// "provider:operation" composite.
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Credits charged for this call.
    pub message_count: i64,
    pub was_free: bool,
    pub created_at_ms: i64,
}

/// Aggregated usage for one model key, from `usage_log`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub model: String,
    pub operations: i64,
    pub credits: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}
