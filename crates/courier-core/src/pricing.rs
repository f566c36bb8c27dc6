//! Model pricing table and context limits. Single source of truth for
//! cost calculation; prices are USD per million tokens.

use rust_decimal::Decimal;

use crate::error::CourierError;
use crate::money::Usd;
use crate::usage::TokenUsage;

/// Per-million-token prices for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
    /// Prompt-cache write surcharge rate (1.25x input).
    pub cache_write_per_mtok: Decimal,
    /// Prompt-cache read discount rate (0.1x input).
    pub cache_read_per_mtok: Decimal,
}

/// Known model entry: pricing plus context limits.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub pricing: ModelPricing,
    pub context_window: u32,
    pub max_output: u32,
}

const fn mtok(units_e2: i64) -> Decimal {
    Decimal::from_parts(units_e2 as u32, 0, 0, false, 2)
}

/// Supported models. Lookup is by exact id or by dated-alias prefix
/// (`claude-sonnet-4-5` matches `claude-sonnet-4-5-20250929`).
pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-opus-4-1",
        pricing: ModelPricing {
            input_per_mtok: mtok(1500),
            output_per_mtok: mtok(7500),
            cache_write_per_mtok: mtok(1875),
            cache_read_per_mtok: mtok(150),
        },
        context_window: 200_000,
        max_output: 32_000,
    },
    ModelSpec {
        id: "claude-sonnet-4-5",
        pricing: ModelPricing {
            input_per_mtok: mtok(300),
            output_per_mtok: mtok(1500),
            cache_write_per_mtok: mtok(375),
            cache_read_per_mtok: mtok(30),
        },
        context_window: 200_000,
        max_output: 64_000,
    },
    ModelSpec {
        id: "claude-haiku-4-5",
        pricing: ModelPricing {
            input_per_mtok: mtok(100),
            output_per_mtok: mtok(500),
            cache_write_per_mtok: mtok(125),
            cache_read_per_mtok: mtok(10),
        },
        context_window: 200_000,
        max_output: 64_000,
    },
];

pub fn lookup_model(model_id: &str) -> Result<&'static ModelSpec, CourierError> {
    MODELS
        .iter()
        .find(|m| model_id == m.id || model_id.starts_with(&format!("{}-", m.id)))
        .ok_or_else(|| CourierError::InvalidModel(model_id.to_string()))
}

/// Speech-to-text price: USD per minute of audio, billed proportionally.
pub const TRANSCRIPTION_PER_MINUTE: Decimal = Decimal::from_parts(6, 0, 0, false, 3);

/// Cost of a transcription by audio duration.
pub fn transcription_cost(duration_secs: f64) -> Usd {
    use rust_decimal::prelude::FromPrimitive;
    let secs = Decimal::from_f64(duration_secs.max(0.0)).unwrap_or_default();
    Usd::new(secs / Decimal::from(60) * TRANSCRIPTION_PER_MINUTE)
}

/// Cost of one usage record under the given model's pricing.
///
/// Thinking tokens bill at the output rate; cache reads and writes bill at
/// their discounted/surcharged input rates.
pub fn cost_for_usage(model_id: &str, usage: &TokenUsage) -> Result<Usd, CourierError> {
    let spec = lookup_model(model_id)?;
    let p = &spec.pricing;
    let million = Decimal::from(1_000_000u32);

    let cost = Decimal::from(usage.input) * p.input_per_mtok / million
        + Decimal::from(usage.output + usage.thinking) * p.output_per_mtok / million
        + Decimal::from(usage.cache_read) * p.cache_read_per_mtok / million
        + Decimal::from(usage.cache_write) * p.cache_write_per_mtok / million;

    Ok(Usd::new(cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lookup_exact_and_dated_alias() {
        assert!(lookup_model("claude-sonnet-4-5").is_ok());
        assert!(lookup_model("claude-sonnet-4-5-20250929").is_ok());
        assert!(lookup_model("gpt-4o").is_err());
    }

    #[test]
    fn sonnet_cost_plain_tokens() {
        // 1M input at $3 + 1M output at $15 = $18
        let usage = TokenUsage {
            input: 1_000_000,
            output: 1_000_000,
            ..Default::default()
        };
        let cost = cost_for_usage("claude-sonnet-4-5", &usage).unwrap();
        assert_eq!(cost, Usd::from_str("18").unwrap());
    }

    #[test]
    fn cache_read_is_discounted() {
        let cached = TokenUsage {
            cache_read: 100_000,
            ..Default::default()
        };
        let fresh = TokenUsage {
            input: 100_000,
            ..Default::default()
        };
        let c = cost_for_usage("claude-sonnet-4-5", &cached).unwrap();
        let f = cost_for_usage("claude-sonnet-4-5", &fresh).unwrap();
        assert!(c < f, "cache read {c} should undercut fresh input {f}");
    }

    #[test]
    fn thinking_bills_at_output_rate() {
        let thinking = TokenUsage {
            thinking: 10_000,
            ..Default::default()
        };
        let output = TokenUsage {
            output: 10_000,
            ..Default::default()
        };
        assert_eq!(
            cost_for_usage("claude-haiku-4-5", &thinking).unwrap(),
            cost_for_usage("claude-haiku-4-5", &output).unwrap()
        );
    }

    #[test]
    fn transcription_cost_is_proportional() {
        // 15 s voice message at $0.006/min → $0.0015.
        assert_eq!(transcription_cost(15.0), Usd::from_str("0.0015").unwrap());
        // One hour podcast → $0.36.
        assert_eq!(transcription_cost(3_600.0), Usd::from_str("0.36").unwrap());
        assert_eq!(transcription_cost(0.0), Usd::ZERO);
        assert_eq!(transcription_cost(-5.0), Usd::ZERO);
    }

    #[test]
    fn invalid_model_is_config_error() {
        let usage = TokenUsage::default();
        match cost_for_usage("no-such-model", &usage) {
            Err(CourierError::InvalidModel(id)) => assert_eq!(id, "no-such-model"),
            other => panic!("expected InvalidModel, got {other:?}"),
        }
    }
}
