use serde::{Deserialize, Serialize};

use crate::catalog::{Operation, PricingCatalog, Provider};

/// Reported usage for a single AI call. Token counts come from the provider
/// response; `audio_bytes` is the caller-supplied duration proxy for
/// transcription (the payload size, converted via an assumed bitrate).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub audio_bytes: u64,
}

impl Usage {
    pub fn tokens(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            audio_bytes: 0,
        }
    }

    pub fn audio(audio_bytes: u64) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            audio_bytes,
        }
    }
}

/// Computed cost of one call: the credits to charge and the raw provider
/// cost in micro-USD (before margin).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCost {
    pub credits: i64,
    pub cost_usd_micros: u64,
}

/// Pure cost mapping from (operation, provider, usage) to credits.
#[derive(Clone, Debug)]
pub struct CostCalculator {
    catalog: PricingCatalog,
}

impl CostCalculator {
    pub fn new(catalog: PricingCatalog) -> Self {
        Self { catalog }
    }

    /// Credit cost of a completed call. Applies the margin multiplier,
    /// converts at the fixed micro-USD-per-credit rate, rounds up, and
    /// floors at one credit: an operation never costs zero.
    pub fn cost(&self, operation: Operation, provider: Provider, usage: &Usage) -> CreditCost {
        let cost_usd_micros = match operation {
            Operation::VoiceTranscription => self.duration_usd_micros(usage.audio_bytes),
            _ => self.token_usd_micros(provider, usage),
        };

        let with_margin = cost_usd_micros.saturating_mul(self.catalog.margin_multiplier);
        let credits = with_margin.div_ceil(self.catalog.credit_usd_micros).max(1);
        CreditCost {
            credits: i64::try_from(credits).unwrap_or(i64::MAX),
            cost_usd_micros,
        }
    }

    /// Fixed display estimate for UI, before the real usage is known. Must
    /// not be used for charging.
    pub fn estimate(&self, operation: Operation) -> i64 {
        self.catalog.display_estimate(operation)
    }

    fn token_usd_micros(&self, provider: Provider, usage: &Usage) -> u64 {
        let pricing = self.catalog.token_pricing(provider);
        let input = u64::from(usage.input_tokens)
            .saturating_mul(pricing.input_usd_micros_per_mtok)
            / 1_000_000;
        let output = u64::from(usage.output_tokens)
            .saturating_mul(pricing.output_usd_micros_per_mtok)
            / 1_000_000;
        input.saturating_add(output)
    }

    /// Approximate duration pricing: bytes -> seconds at the assumed
    /// bitrate, then the flat per-minute price. Intentionally approximate;
    /// only monotonicity and the one-credit floor matter.
    fn duration_usd_micros(&self, audio_bytes: u64) -> u64 {
        let bytes_per_minute = self.catalog.voice_bytes_per_second.saturating_mul(60);
        audio_bytes.saturating_mul(self.catalog.voice_usd_micros_per_minute) / bytes_per_minute
    }
}
