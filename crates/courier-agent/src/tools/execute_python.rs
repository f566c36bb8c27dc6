//! Paid sandbox execution. Reuses a warm per-thread sandbox when the cache
//! still has one; execution time is billed per started second.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_cache::sandbox as sandbox_cache;
use courier_core::Usd;

use super::{ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome};

static DESCRIPTOR: ToolDescriptor = ToolDescriptor {
    name: "execute_python",
    emoji: "🐍",
    description: "Execute Python code in an isolated sandbox. Returns stdout, stderr, and \
                  the exit code. State persists between calls in the same conversation \
                  while the sandbox stays warm.",
    paid: true,
    allowed_mime_prefixes: &[],
};

/// Billed per started second of sandbox wall-clock.
fn exec_cost(duration_ms: u64) -> Usd {
    let seconds = duration_ms.div_ceil(1000).max(1);
    // $0.0002 per started second
    Usd::from_micros_e4(2 * seconds as i64)
}

pub struct ExecutePython;

#[async_trait]
impl ToolExecutor for ExecutePython {
    fn descriptor(&self) -> &'static ToolDescriptor {
        &DESCRIPTOR
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(code) = input["code"].as_str() else {
            return ToolOutcome::error("missing required parameter: code");
        };
        let Some(sandbox) = ctx.sandbox.as_ref() else {
            return ToolOutcome::error("code execution is not configured on this bot");
        };

        let warm = sandbox_cache::get_sandbox(&ctx.cache, ctx.thread_id).await;
        let warm_id = warm.as_ref().map(|m| m.sandbox_id.clone());
        debug!(
            thread_id = ctx.thread_id,
            warm = warm_id.is_some(),
            "sandbox execution starting"
        );

        match sandbox.run(warm_id.as_deref(), code).await {
            Ok(result) => {
                // Remember the effective sandbox for the next call.
                if warm_id.as_deref() == Some(result.sandbox_id.as_str()) {
                    sandbox_cache::refresh_sandbox(&ctx.cache, ctx.thread_id).await;
                } else {
                    sandbox_cache::store_sandbox(&ctx.cache, ctx.thread_id, &result.sandbox_id)
                        .await;
                }

                let cost = exec_cost(result.duration_ms);
                let payload = json!({
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "exit_code": result.exit_code,
                })
                .to_string();

                if result.exit_code == 0 {
                    ToolOutcome::success_with_cost(payload, cost)
                } else {
                    // Non-zero exit is still billed: the sandbox ran.
                    ToolOutcome {
                        content: payload,
                        is_error: true,
                        cost,
                    }
                }
            }
            Err(e) => {
                sandbox_cache::clear_sandbox(&ctx.cache, ctx.thread_id).await;
                ToolOutcome::error(format!("sandbox execution failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn cost_is_per_started_second() {
        assert_eq!(exec_cost(1), Usd::from_str("0.0002").unwrap());
        assert_eq!(exec_cost(999), Usd::from_str("0.0002").unwrap());
        assert_eq!(exec_cost(1000), Usd::from_str("0.0002").unwrap());
        assert_eq!(exec_cost(1001), Usd::from_str("0.0004").unwrap());
        assert_eq!(exec_cost(10_000), Usd::from_str("0.0020").unwrap());
    }

    #[test]
    fn zero_duration_bills_one_second() {
        assert_eq!(exec_cost(0), Usd::from_str("0.0002").unwrap());
    }
}
