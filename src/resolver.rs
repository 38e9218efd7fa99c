use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Operation, PricingCatalog, Provider};
use crate::config::MeterConfig;
use crate::error::{BillingError, Result};
use crate::ledger::CreditLedger;
use crate::secrets::SecretStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// BYOK: the user's own key; usage is unmetered.
    User,
    /// Metered against the user's credit balance.
    System,
    /// System key, but the account is still in its untouched free-tier
    /// bootstrap state.
    Free,
}

/// The capability a caller uses to invoke the AI provider. Ephemeral,
/// never persisted; the plaintext key lives only in memory.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyResult {
    pub provider: Provider,
    pub key: String,
    pub billing_mode: BillingMode,
    /// Whether the caller must report usage back through the ledger's
    /// charge path once the provider call returns.
    pub should_charge: bool,
    pub user_id: String,
}

impl fmt::Debug for ApiKeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyResult")
            .field("provider", &self.provider)
            .field("key", &"<redacted>")
            .field("billing_mode", &self.billing_mode)
            .field("should_charge", &self.should_charge)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Decides, per operation, between BYOK, the free-tier bootstrap, and the
/// metered system key.
///
/// The balance check here is advisory: it is an unlocked read taken before
/// the caller pays for the external provider call. Two concurrent requests
/// can both pass it and race at the authoritative charge afterwards; the
/// loser receives `InsufficientCredits` after the provider has already been
/// invoked, and the caller decides what to do with the result.
#[derive(Clone)]
pub struct KeyResolver {
    catalog: PricingCatalog,
    system_keys: BTreeMap<Provider, String>,
    secrets: Arc<dyn SecretStore>,
    ledger: CreditLedger,
}

impl KeyResolver {
    pub fn new(
        catalog: PricingCatalog,
        config: &MeterConfig,
        secrets: Arc<dyn SecretStore>,
        ledger: CreditLedger,
    ) -> Self {
        Self {
            catalog,
            system_keys: config.system_keys.clone(),
            secrets,
            ledger,
        }
    }

    /// Resolve the key to use for one operation. BYOK short-circuits the
    /// ledger entirely; otherwise the account is bootstrapped if missing
    /// and its balance advisory-checked.
    pub async fn resolve(&self, user_id: &str, operation: Operation) -> Result<ApiKeyResult> {
        let provider = self.catalog.route(operation);

        if provider.supports_byok() {
            if let Some(key) = self.user_key_plaintext(user_id, provider).await? {
                return Ok(ApiKeyResult {
                    provider,
                    key,
                    billing_mode: BillingMode::User,
                    should_charge: false,
                    user_id: user_id.to_string(),
                });
            }
        }

        let account = self.ledger.ensure_account(user_id).await?;
        if account.messages_remaining <= 0 {
            return Err(BillingError::InsufficientCredits {
                balance: account.messages_remaining,
            });
        }

        let key = self
            .system_keys
            .get(&provider)
            .cloned()
            .ok_or(BillingError::MissingSystemKey { provider })?;
        let billing_mode = if account.total_used == 0
            && account.messages_remaining == self.ledger.bootstrap_credits()
        {
            BillingMode::Free
        } else {
            BillingMode::System
        };

        Ok(ApiKeyResult {
            provider,
            key,
            billing_mode,
            should_charge: true,
            user_id: user_id.to_string(),
        })
    }

    /// Store a user-supplied key for a BYOK-capable provider, encrypted at
    /// rest through the secret store.
    pub async fn store_user_key(
        &self,
        user_id: &str,
        provider: Provider,
        plaintext: &str,
    ) -> Result<()> {
        if !provider.supports_byok() {
            return Err(BillingError::ByokUnsupported { provider });
        }
        let encrypted = self.secrets.encrypt(plaintext)?;
        self.ledger
            .store()
            .put_user_key(user_id, provider.as_str(), &encrypted, self.ledger.now_epoch_millis())
            .await?;
        Ok(())
    }

    pub async fn remove_user_key(&self, user_id: &str, provider: Provider) -> Result<()> {
        self.ledger
            .store()
            .delete_user_key(user_id, provider.as_str())
            .await?;
        Ok(())
    }

    /// Fetch and decrypt the stored BYOK key. A decrypt failure downgrades
    /// to "key absent": logged, never surfaced, so the request falls
    /// through to the metered path.
    async fn user_key_plaintext(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<String>> {
        let Some(stored) = self
            .ledger
            .store()
            .user_key(user_id, provider.as_str())
            .await?
        else {
            return Ok(None);
        };

        if !self.secrets.is_encrypted(&stored) {
            // Legacy plaintext row.
            return Ok(Some(stored));
        }
        match self.secrets.decrypt(&stored) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(err) => {
                tracing::warn!(
                    user_id,
                    provider = provider.as_str(),
                    error = %err,
                    "failed to decrypt stored provider key; falling back to metered path"
                );
                Ok(None)
            }
        }
    }
}
