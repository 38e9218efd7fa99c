use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::{Operation, PricingCatalog, Provider};
use crate::error::{BillingError, Result};

pub const DEFAULT_BOOTSTRAP_CREDITS: i64 = 50;
pub const DEFAULT_MONTHLY_ALLOWANCE: i64 = 50;

/// Process-level configuration: one system API key per provider plus the
/// free-tier amounts. Built once at startup from an explicit env map and
/// passed down; never read ambiently.
#[derive(Clone)]
pub struct MeterConfig {
    pub system_keys: BTreeMap<Provider, String>,
    pub bootstrap_credits: i64,
    pub monthly_allowance: i64,
}

impl MeterConfig {
    pub fn from_env(vars: &BTreeMap<String, String>) -> Self {
        let mut system_keys = BTreeMap::new();
        for provider in Provider::ALL {
            if let Some(value) = vars.get(provider.env_key()) {
                let value = value.trim();
                if !value.is_empty() {
                    system_keys.insert(provider, value.to_string());
                }
            }
        }
        Self {
            system_keys,
            bootstrap_credits: DEFAULT_BOOTSTRAP_CREDITS,
            monthly_allowance: DEFAULT_MONTHLY_ALLOWANCE,
        }
    }

    /// Fail fast if any routed provider lacks a system key. A missing key
    /// is a startup-class error, not a runtime billing error.
    pub fn validate(&self, catalog: &PricingCatalog) -> Result<()> {
        for operation in Operation::ALL {
            let provider = catalog.route(operation);
            if !self.system_keys.contains_key(&provider) {
                return Err(BillingError::MissingSystemKey { provider });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MeterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterConfig")
            .field("system_keys", &self.system_keys.keys().collect::<Vec<_>>())
            .field("bootstrap_credits", &self.bootstrap_credits)
            .field("monthly_allowance", &self.monthly_allowance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn from_env_picks_up_configured_keys() {
        let config = MeterConfig::from_env(&env(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("GEMINI_API_KEY", "  "),
            ("UNRELATED", "x"),
        ]));
        assert_eq!(
            config.system_keys.get(&Provider::OpenAi).map(String::as_str),
            Some("sk-1")
        );
        assert!(!config.system_keys.contains_key(&Provider::Gemini));
    }

    #[test]
    fn validate_requires_a_key_per_routed_provider() {
        let catalog = PricingCatalog::default();
        let config = MeterConfig::from_env(&env(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("GEMINI_API_KEY", "sk-2"),
            ("DEEPGRAM_API_KEY", "sk-3"),
        ]));
        let err = config.validate(&catalog).unwrap_err();
        assert!(matches!(
            err,
            BillingError::MissingSystemKey {
                provider: Provider::Groq
            }
        ));

        let complete = MeterConfig::from_env(&env(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("GEMINI_API_KEY", "sk-2"),
            ("DEEPGRAM_API_KEY", "sk-3"),
            ("GROQ_API_KEY", "sk-4"),
        ]));
        complete.validate(&catalog).expect("complete config");
    }

    #[test]
    fn debug_redacts_key_values() {
        let config = MeterConfig::from_env(&env(&[("OPENAI_API_KEY", "sk-secret")]));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
    }
}
