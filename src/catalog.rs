use std::fmt;

use serde::{Deserialize, Serialize};

/// AI-backed features that consume credits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    VoiceTranscription,
    ReceiptOcr,
    Chat,
    Categorization,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::VoiceTranscription,
        Operation::ReceiptOcr,
        Operation::Chat,
        Operation::Categorization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::VoiceTranscription => "voice_transcription",
            Operation::ReceiptOcr => "receipt_ocr",
            Operation::Chat => "chat",
            Operation::Categorization => "categorization",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Gemini,
    Deepgram,
    Groq,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Gemini,
        Provider::Deepgram,
        Provider::Groq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Deepgram => "deepgram",
            Provider::Groq => "groq",
        }
    }

    /// Whether users may bring their own key for this provider. The
    /// transcription and categorization backends are system-only.
    pub fn supports_byok(&self) -> bool {
        matches!(self, Provider::OpenAi | Provider::Gemini)
    }

    /// Environment variable holding the system key for this provider.
    pub fn env_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Deepgram => "DEEPGRAM_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider token pricing in micro-USD per million tokens.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_usd_micros_per_mtok: u64,
    pub output_usd_micros_per_mtok: u64,
}

/// Static routing and pricing tables. Built once at startup and passed
/// explicitly to the calculator and resolver; never mutated at runtime.
#[derive(Clone, Debug)]
pub struct PricingCatalog {
    /// Multiplier applied on top of raw provider cost.
    pub margin_multiplier: u64,
    /// Micro-USD value of one credit.
    pub credit_usd_micros: u64,
    /// Flat per-minute price for duration-based transcription.
    pub voice_usd_micros_per_minute: u64,
    /// Assumed audio bitrate used to derive a duration from a byte count.
    pub voice_bytes_per_second: u64,
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self {
            margin_multiplier: 2,
            // One credit is one cent.
            credit_usd_micros: 10_000,
            // Deepgram nova-class streaming price.
            voice_usd_micros_per_minute: 4_300,
            // 32 kbps voice audio.
            voice_bytes_per_second: 4_000,
        }
    }
}

impl PricingCatalog {
    /// Fixed operation-to-provider routing. No runtime mutation.
    pub fn route(&self, operation: Operation) -> Provider {
        match operation {
            Operation::VoiceTranscription => Provider::Deepgram,
            Operation::ReceiptOcr => Provider::Gemini,
            Operation::Chat => Provider::OpenAi,
            Operation::Categorization => Provider::Groq,
        }
    }

    pub fn token_pricing(&self, provider: Provider) -> TokenPricing {
        match provider {
            Provider::OpenAi => TokenPricing {
                input_usd_micros_per_mtok: 150_000,
                output_usd_micros_per_mtok: 600_000,
            },
            Provider::Gemini => TokenPricing {
                input_usd_micros_per_mtok: 100_000,
                output_usd_micros_per_mtok: 400_000,
            },
            Provider::Groq => TokenPricing {
                input_usd_micros_per_mtok: 50_000,
                output_usd_micros_per_mtok: 80_000,
            },
            // Transcription is priced per minute, not per token.
            Provider::Deepgram => TokenPricing {
                input_usd_micros_per_mtok: 0,
                output_usd_micros_per_mtok: 0,
            },
        }
    }

    /// Fixed "typical" credit cost per operation, for UI display before the
    /// real token count is known. Never used for charging.
    pub fn display_estimate(&self, operation: Operation) -> i64 {
        match operation {
            Operation::VoiceTranscription => 2,
            Operation::ReceiptOcr => 2,
            Operation::Chat => 1,
            Operation::Categorization => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_deterministic() {
        let catalog = PricingCatalog::default();
        for operation in Operation::ALL {
            let first = catalog.route(operation);
            for _ in 0..3 {
                assert_eq!(catalog.route(operation), first);
            }
        }
    }

    #[test]
    fn exactly_two_providers_accept_user_keys() {
        let byok: Vec<Provider> = Provider::ALL
            .into_iter()
            .filter(Provider::supports_byok)
            .collect();
        assert_eq!(byok, vec![Provider::OpenAi, Provider::Gemini]);
    }

    #[test]
    fn display_estimates_are_positive() {
        let catalog = PricingCatalog::default();
        for operation in Operation::ALL {
            assert!(catalog.display_estimate(operation) >= 1);
        }
    }
}
