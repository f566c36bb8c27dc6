//! Provider abstraction: the streaming event vocabulary and the trait the
//! turn loop drives. Messages travel as raw wire-format JSON so thinking
//! blocks and tool results round-trip without normalization.

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_core::{Result, TokenUsage};

use crate::prompt::SystemPrompt;

/// Events emitted while streaming one model response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental visible text.
    TextDelta { text: String },

    /// Incremental internal reasoning (extended thinking).
    ThinkingDelta { text: String },

    /// A finished thinking block, verbatim wire JSON including the
    /// signature. Must be replayed unchanged in continuation calls — the
    /// provider rejects altered thinking blocks.
    ThinkingComplete { block: serde_json::Value },

    /// A tool_use block opened; the input is still streaming.
    ToolUseStart { id: String, name: String },

    /// Partial tool input JSON. Display-only; the full input arrives in
    /// `ToolUse`.
    ToolInputDelta { partial: String },

    /// A tool_use block closed with its fully accumulated input.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Token usage as the provider reports it: input and cache counts at
    /// message_start, output counts at message_delta. Emitted as soon as
    /// each arrives so a cancelled stream still accounts for the tokens
    /// it consumed.
    Usage { usage: TokenUsage },

    /// Stream completed with the final stop reason.
    Done { stop_reason: String },

    /// Provider-reported mid-stream error.
    Error { message: String },
}

/// Wire-format tool definition sent to the provider.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One model request. `messages` are raw content-block messages in the
/// provider's wire format, already truncated to the context budget.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: SystemPrompt,
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
    /// Extended-thinking budget in tokens; None disables thinking.
    pub thinking_budget: Option<u32>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Stream one response, emitting events into `tx`. Returns after the
    /// stream closes; transport and HTTP-level failures are the `Err` arm,
    /// provider-reported stream errors arrive as `StreamEvent::Error`.
    async fn stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()>;
}

/// Drive a full stream to completion and collect the visible text.
/// Used by tools making sub-calls (image/PDF analysis) and topic naming.
pub async fn collect_response(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
) -> Result<(String, TokenUsage)> {
    let (tx, mut rx) = mpsc::channel(64);
    let stream = provider.stream(req, tx);
    tokio::pin!(stream);

    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut stream_done = false;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StreamEvent::TextDelta { text: t }) => text.push_str(&t),
                Some(StreamEvent::Usage { usage: u }) => usage.add(&u),
                Some(StreamEvent::Error { message }) => {
                    return Err(courier_core::CourierError::Provider(message));
                }
                Some(_) => {}
                None => break,
            },
            result = &mut stream, if !stream_done => {
                result?;
                stream_done = true;
            }
        }
    }
    Ok((text, usage))
}
