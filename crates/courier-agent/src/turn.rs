//! The streaming tool-use turn loop.
//!
//! One turn: stream a response, push every delta to the sink, collect tool
//! calls, pre-check paid tools against the balance, execute all calls in
//! parallel, feed results back in a continuation request (thinking blocks
//! verbatim), repeat until the model stops or the user cancels.
//!
//! Cancellation is polled before every stream event and before tool
//! dispatch. Tools already dispatched run to completion and their cost is
//! charged; cancellation only suppresses further dispatch.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::metrics::Metrics;
use courier_core::{CourierError, Result, Usd};
use courier_store::BalancePolicy;

use crate::cost::CostTracker;
use crate::provider::{ChatRequest, LlmProvider, StreamEvent};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

/// Hard ceiling on model↔tools roundtrips per turn.
const MAX_ITERATIONS: u32 = 25;

/// Observer for streaming progress. The Telegram display layer implements
/// this with throttled message edits; tests record calls.
#[async_trait]
pub trait TurnSink: Send {
    async fn text_delta(&mut self, text: &str);
    async fn thinking_delta(&mut self, text: &str);
    /// A tool started; `marker` is the display form, e.g. `[🐍 execute_python]`.
    async fn tool_started(&mut self, marker: &str);
    async fn tool_finished(&mut self, name: &str, success: bool);
}

/// Sink that ignores everything (sub-calls, tests).
pub struct NullSink;

#[async_trait]
impl TurnSink for NullSink {
    async fn text_delta(&mut self, _text: &str) {}
    async fn thinking_delta(&mut self, _text: &str) {}
    async fn tool_started(&mut self, _marker: &str) {}
    async fn tool_finished(&mut self, _name: &str, _success: bool) {}
}

/// One executed (or rejected) tool call.
#[derive(Debug)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

/// Final state of one turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub text: String,
    /// Thinking blocks exactly as streamed, for persistence alongside the
    /// assistant message.
    pub thinking_blocks: Vec<Value>,
    pub stop_reason: String,
    pub cancelled: bool,
    pub iterations: u32,
    pub tool_executions: Vec<ToolExecution>,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    provider: Arc<dyn LlmProvider>,
    registry: &ToolRegistry,
    policy: &BalancePolicy,
    metrics: &Metrics,
    tool_ctx: &ToolContext,
    mut request: ChatRequest,
    tracker: &mut CostTracker,
    sink: &mut dyn TurnSink,
    cancel: &CancellationToken,
    precheck_enabled: bool,
) -> Result<TurnOutcome> {
    let mut text = String::new();
    let mut thinking_blocks: Vec<Value> = Vec::new();
    let mut tool_executions: Vec<ToolExecution> = Vec::new();
    let mut stop_reason = String::new();
    let mut cancelled = false;
    let mut iterations = 0u32;

    for iteration in 0..MAX_ITERATIONS {
        iterations = iteration + 1;
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(128);
        let stream_provider = Arc::clone(&provider);
        let stream_request = request.clone();
        let stream_task =
            tokio::spawn(async move { stream_provider.stream(&stream_request, tx).await });

        let mut iter_text = String::new();
        let mut iter_thinking: Vec<Value> = Vec::new();
        let mut pending_tools: Vec<(String, String, Value)> = Vec::new();
        let mut iter_stop = String::new();
        let mut stream_error: Option<String> = None;
        let mut output_usage_reported = false;

        while let Some(event) = rx.recv().await {
            // Poll the cancellation signal before touching each event.
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match event {
                StreamEvent::TextDelta { text: delta } => {
                    iter_text.push_str(&delta);
                    sink.text_delta(&delta).await;
                }
                StreamEvent::ThinkingDelta { text: delta } => {
                    sink.thinking_delta(&delta).await;
                }
                StreamEvent::ThinkingComplete { block } => {
                    iter_thinking.push(block);
                }
                StreamEvent::ToolUseStart { name, .. } => {
                    let marker = registry
                        .descriptor(&name)
                        .map(|d| d.marker())
                        .unwrap_or_else(|| format!("[🔧 {name}]"));
                    sink.tool_started(&marker).await;
                }
                StreamEvent::ToolInputDelta { .. } => {}
                StreamEvent::ToolUse { id, name, input } => {
                    pending_tools.push((id, name, input));
                }
                StreamEvent::Usage { usage } => {
                    // Applied as it arrives, not at stream end: a cancelled
                    // stream still bills the tokens it consumed.
                    if usage.output > 0 {
                        output_usage_reported = true;
                    }
                    tracker.add_api_usage(&usage);
                }
                StreamEvent::Done {
                    stop_reason: reason,
                } => {
                    iter_stop = reason;
                }
                StreamEvent::Error { message } => {
                    stream_error = Some(message);
                }
            }
        }

        if cancelled {
            // Abort the in-flight stream; keep what already arrived so the
            // final display shows the partial answer. The provider only
            // reports output counts at message_delta, which an aborted
            // stream never reaches — estimate them from the streamed text
            // so the partial turn is still billed.
            stream_task.abort();
            if !output_usage_reported && !iter_text.is_empty() {
                tracker.add_api_usage(&courier_core::TokenUsage {
                    output: crate::prompt::estimate_tokens(&iter_text),
                    ..Default::default()
                });
            }
            text.push_str(&iter_text);
            thinking_blocks.extend(iter_thinking);
            stop_reason = "cancelled".to_string();
            break;
        }

        match stream_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(CourierError::Internal(format!("stream task failed: {e}")))
            }
        }
        if let Some(message) = stream_error {
            return Err(CourierError::Provider(message));
        }

        text.push_str(&iter_text);
        stop_reason = iter_stop.clone();

        if iter_stop != "tool_use" || pending_tools.is_empty() {
            thinking_blocks.extend(iter_thinking);
            debug!(iteration, stop_reason = %iter_stop, "turn complete");
            break;
        }

        // Continuation: the assistant message replays thinking blocks
        // byte-for-byte — the provider rejects altered blocks.
        let mut assistant_content: Vec<Value> = iter_thinking.clone();
        if !iter_text.is_empty() {
            assistant_content.push(json!({"type": "text", "text": iter_text}));
        }
        for (id, name, input) in &pending_tools {
            assistant_content.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }));
        }
        request
            .messages
            .push(json!({"role": "assistant", "content": assistant_content}));
        thinking_blocks.extend(iter_thinking);

        // Cancellation checked again before dispatch: a cancel between the
        // stream end and here must not start tools.
        if cancel.is_cancelled() {
            cancelled = true;
            stop_reason = "cancelled".to_string();
            break;
        }

        info!(
            iteration,
            tools = pending_tools.len(),
            "dispatching tool calls"
        );

        // Parallel execution; join_all preserves input order for the
        // continuation message.
        let executions = futures_util::future::join_all(pending_tools.iter().map(
            |(id, name, input)| {
                dispatch_tool(
                    registry,
                    policy,
                    metrics,
                    tool_ctx,
                    precheck_enabled,
                    id,
                    name,
                    input,
                )
            },
        ))
        .await;

        let mut result_blocks: Vec<Value> = Vec::with_capacity(executions.len());
        for execution in executions {
            if execution.outcome.cost > Usd::ZERO {
                tracker.add_tool_cost(&execution.name, execution.outcome.cost);
            }
            sink.tool_finished(&execution.name, !execution.outcome.is_error)
                .await;
            result_blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": execution.id,
                "content": execution.outcome.content,
                "is_error": execution.outcome.is_error,
            }));
            tool_executions.push(execution);
        }
        request
            .messages
            .push(json!({"role": "user", "content": result_blocks}));

        if iterations == MAX_ITERATIONS {
            warn!(max = MAX_ITERATIONS, "turn hit iteration ceiling");
        }
    }

    Ok(TurnOutcome {
        text,
        thinking_blocks,
        stop_reason,
        cancelled,
        iterations,
        tool_executions,
    })
}

/// Execute one tool call with the paid-tool pre-check. Never fails: every
/// problem becomes a model-visible result.
#[allow(clippy::too_many_arguments)]
async fn dispatch_tool(
    registry: &ToolRegistry,
    policy: &BalancePolicy,
    metrics: &Metrics,
    tool_ctx: &ToolContext,
    precheck_enabled: bool,
    id: &str,
    name: &str,
    input: &Value,
) -> ToolExecution {
    let Some(executor) = registry.find(name) else {
        return ToolExecution {
            id: id.to_string(),
            name: name.to_string(),
            outcome: ToolOutcome::error(format!("unknown tool: {name}")),
            duration_ms: 0,
        };
    };
    let descriptor = executor.descriptor();

    if descriptor.paid && precheck_enabled && !policy.can_use_paid_tool(tool_ctx.user_id).await {
        let balance = policy.get_balance(tool_ctx.user_id).await;
        metrics.record_tool_precheck_rejected(name);
        warn!(
            user_id = tool_ctx.user_id,
            tool = name,
            balance = %balance,
            "paid tool rejected by balance pre-check"
        );
        return ToolExecution {
            id: id.to_string(),
            name: name.to_string(),
            outcome: ToolOutcome::insufficient_balance(name, balance),
            duration_ms: 0,
        };
    }

    let started = Instant::now();
    let outcome = executor.execute(tool_ctx, input.clone()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    debug!(
        tool = name,
        duration_ms,
        is_error = outcome.is_error,
        cost = %outcome.cost,
        "tool finished"
    );
    ToolExecution {
        id: id.to_string(),
        name: name.to_string(),
        outcome,
        duration_ms,
    }
}
