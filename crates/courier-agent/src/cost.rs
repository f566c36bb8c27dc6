//! Per-turn cost accounting: token totals across iterations plus tool
//! costs, charged exactly once at finalization.

use tracing::info;

use courier_core::pricing::cost_for_usage;
use courier_core::{Result, TokenUsage, Usd};
use courier_store::BalanceService;

#[derive(Debug)]
pub struct CostTracker {
    model_id: String,
    user_id: i64,
    usage: TokenUsage,
    tool_costs: Vec<(String, Usd)>,
}

impl CostTracker {
    pub fn new(model_id: impl Into<String>, user_id: i64) -> Self {
        Self {
            model_id: model_id.into(),
            user_id,
            usage: TokenUsage::default(),
            tool_costs: Vec::new(),
        }
    }

    pub fn add_api_usage(&mut self, usage: &TokenUsage) {
        self.usage.add(usage);
    }

    pub fn add_tool_cost(&mut self, tool_name: &str, cost: Usd) {
        self.tool_costs.push((tool_name.to_string(), cost));
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn tool_cost_total(&self) -> Usd {
        self.tool_costs.iter().map(|(_, c)| *c).sum()
    }

    pub fn total_cost(&self) -> Result<Usd> {
        let token_cost = cost_for_usage(&self.model_id, &self.usage)?;
        Ok(token_cost + self.tool_cost_total())
    }

    /// Human-readable charge description for the ledger row.
    fn description(&self, source: &str) -> String {
        format!(
            "{source} ({}): {} in, {} out, {} thinking, tools: ${}",
            self.model_id,
            self.usage.input + self.usage.cache_read + self.usage.cache_write,
            self.usage.output,
            self.usage.thinking,
            self.tool_cost_total()
        )
    }

    /// Compute the total and charge it in one balance operation. A zero
    /// total writes nothing (no empty ledger rows).
    pub async fn finalize_and_charge(
        &self,
        balance: &BalanceService,
        source: &str,
        related_message_id: Option<i64>,
    ) -> Result<Usd> {
        let total = self.total_cost()?;
        if total == Usd::ZERO {
            return Ok(total);
        }

        balance
            .charge(
                self.user_id,
                total,
                self.description(source),
                related_message_id,
            )
            .await?;

        info!(
            user_id = self.user_id,
            total = %total,
            input = self.usage.input,
            output = self.usage.output,
            thinking = self.usage.thinking,
            tools = self.tool_costs.len(),
            source,
            "turn cost charged"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn accumulates_usage_and_tools() {
        let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
        tracker.add_api_usage(&TokenUsage {
            input: 1_000_000,
            output: 0,
            ..Default::default()
        });
        tracker.add_api_usage(&TokenUsage {
            input: 0,
            output: 1_000_000,
            ..Default::default()
        });
        tracker.add_tool_cost("execute_python", Usd::from_str("0.0100").unwrap());

        // $3 input + $15 output + $0.01 tool
        assert_eq!(
            tracker.total_cost().unwrap(),
            Usd::from_str("18.0100").unwrap()
        );
    }

    #[test]
    fn description_mentions_tokens_and_tools() {
        let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
        tracker.add_api_usage(&TokenUsage {
            input: 1200,
            output: 300,
            thinking: 50,
            ..Default::default()
        });
        tracker.add_tool_cost("analyze_pdf", Usd::from_str("0.0020").unwrap());
        let desc = tracker.description("turn");
        assert!(desc.contains("claude-sonnet-4-5"));
        assert!(desc.contains("1200 in"));
        assert!(desc.contains("300 out"));
        assert!(desc.contains("50 thinking"));
        assert!(desc.contains("0.0020"));
    }

    #[test]
    fn unknown_model_fails_total() {
        let tracker = CostTracker::new("mystery-model", 1);
        assert!(tracker.total_cost().is_err());
    }
}
