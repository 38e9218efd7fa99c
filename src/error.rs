use thiserror::Error;

use crate::catalog::Provider;
use crate::secrets::SecretError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Expected, user-recoverable outcome. Always carries the balance the
    /// failing operation observed.
    #[error("insufficient credits: balance={balance}")]
    InsufficientCredits { balance: i64 },
    /// Operator-facing configuration error: an operation routed to a
    /// provider with no system key configured.
    #[error("no system api key configured for provider {provider}")]
    MissingSystemKey { provider: Provider },
    #[error("provider {provider} does not accept user-supplied keys")]
    ByokUnsupported { provider: Provider },
    #[error("secret store: {0}")]
    Secret(#[from] SecretError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BillingError>;
