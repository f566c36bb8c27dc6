//! Anthropic SSE stream parser: reads the reqwest byte stream, reassembles
//! lines, and emits `StreamEvent`s. Thinking blocks are reassembled with
//! their signatures and emitted verbatim so continuation calls can replay
//! them byte-for-byte.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::TokenUsage;

use crate::provider::StreamEvent;

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Parse a single SSE line. Format: `event: <type>` / `data: <json>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

/// Per-stream accumulation state.
#[derive(Default)]
struct StreamState {
    current_event: String,
    /// Block type reported by `content_block_start` ("text", "thinking",
    /// "redacted_thinking", or "tool_use") so deltas know what to emit.
    current_block_type: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    thinking_text: String,
    thinking_signature: String,
    /// Raw `redacted_thinking` block captured whole from block_start.
    redacted_block: Option<serde_json::Value>,
    stop_reason: String,
}

/// Parse the streaming response body and emit events until it closes.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // SSE arrives as multiple lines per chunk; keep the trailing
        // incomplete line in the buffer.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(parsed) = parse_sse_line(line) {
                match parsed {
                    SseParsed::Event(ev) => state.current_event = ev,
                    SseParsed::Data(data) => {
                        for event in parse_data_block(&mut state, &data) {
                            if tx.send(event).await.is_err() {
                                return; // receiver dropped (cancellation)
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done {
            stop_reason: std::mem::take(&mut state.stop_reason),
        })
        .await;
}

/// Handle one SSE data payload; may yield zero, one, or two events.
fn parse_data_block(state: &mut StreamState, data: &str) -> Vec<StreamEvent> {
    match state.current_event.as_str() {
        "message_start" => {
            // Emit input-side usage immediately: a stream cancelled before
            // message_delta must still bill the prompt tokens it consumed.
            match serde_json::from_str::<MessageStart>(data) {
                Ok(msg) => vec![StreamEvent::Usage {
                    usage: TokenUsage {
                        input: msg.message.usage.input_tokens,
                        cache_read: msg.message.usage.cache_read_input_tokens,
                        cache_write: msg.message.usage.cache_creation_input_tokens,
                        ..Default::default()
                    },
                }],
                Err(_) => vec![],
            }
        }

        "content_block_start" => {
            if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                state.current_block_type = start.content_block.block_type.clone();
                match start.content_block.block_type.as_str() {
                    "tool_use" => {
                        state.tool_use_id = start.content_block.id.unwrap_or_default();
                        state.tool_use_name = start.content_block.name.unwrap_or_default();
                        state.tool_use_input_json.clear();
                        return vec![StreamEvent::ToolUseStart {
                            id: state.tool_use_id.clone(),
                            name: state.tool_use_name.clone(),
                        }];
                    }
                    "thinking" => {
                        state.thinking_text.clear();
                        state.thinking_signature.clear();
                    }
                    "redacted_thinking" => {
                        // Opaque block: capture the raw value whole.
                        state.redacted_block =
                            serde_json::from_str::<RawBlockStart>(data).ok().map(|r| r.content_block);
                    }
                    _ => {}
                }
            }
            vec![]
        }

        "content_block_delta" => {
            let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) else {
                return vec![];
            };
            match delta.delta.delta_type.as_str() {
                "text_delta" => delta
                    .delta
                    .text
                    .map(|text| vec![StreamEvent::TextDelta { text }])
                    .unwrap_or_default(),
                "thinking_delta" => match delta.delta.thinking {
                    Some(text) => {
                        state.thinking_text.push_str(&text);
                        vec![StreamEvent::ThinkingDelta { text }]
                    }
                    None => vec![],
                },
                "signature_delta" => {
                    if let Some(sig) = delta.delta.signature {
                        state.thinking_signature.push_str(&sig);
                    }
                    vec![]
                }
                "input_json_delta" => match delta.delta.partial_json {
                    Some(partial) => {
                        state.tool_use_input_json.push_str(&partial);
                        vec![StreamEvent::ToolInputDelta { partial }]
                    }
                    None => vec![],
                },
                other => {
                    debug!(delta_type = other, "unhandled delta type");
                    vec![]
                }
            }
        }

        "content_block_stop" => {
            let block_type = std::mem::take(&mut state.current_block_type);
            match block_type.as_str() {
                "tool_use" => {
                    let input = serde_json::from_str::<serde_json::Value>(
                        state.tool_use_input_json.as_str(),
                    )
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                    state.tool_use_input_json.clear();
                    vec![StreamEvent::ToolUse {
                        id: std::mem::take(&mut state.tool_use_id),
                        name: std::mem::take(&mut state.tool_use_name),
                        input,
                    }]
                }
                "thinking" => {
                    let block = serde_json::json!({
                        "type": "thinking",
                        "thinking": std::mem::take(&mut state.thinking_text),
                        "signature": std::mem::take(&mut state.thinking_signature),
                    });
                    vec![StreamEvent::ThinkingComplete { block }]
                }
                "redacted_thinking" => state
                    .redacted_block
                    .take()
                    .map(|block| vec![StreamEvent::ThinkingComplete { block }])
                    .unwrap_or_default(),
                _ => vec![],
            }
        }

        "message_delta" => {
            match serde_json::from_str::<MessageDelta>(data) {
                Ok(delta) => {
                    if let Some(reason) = delta.delta.stop_reason {
                        state.stop_reason = reason;
                    }
                    vec![StreamEvent::Usage {
                        usage: TokenUsage {
                            output: delta.usage.output_tokens,
                            ..Default::default()
                        },
                    }]
                }
                Err(_) => vec![],
            }
        }

        "error" => {
            warn!(data, "provider stream error");
            vec![StreamEvent::Error {
                message: data.to_string(),
            }]
        }

        // message_stop, ping, unknown events — nothing to do
        _ => vec![],
    }
}

// SSE data payload types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

/// Same payload, but keeping the block as an untyped value.
#[derive(Deserialize)]
struct RawBlockStart {
    content_block: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut StreamState, event: &str, data: &str) -> Vec<StreamEvent> {
        state.current_event = event.to_string();
        parse_data_block(state, data)
    }

    #[test]
    fn text_deltas_pass_through() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "text"}}"#,
        );
        let events = feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "text_delta", "text": "Hi"}}"#,
        );
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Hi"));
    }

    #[test]
    fn thinking_block_reassembles_with_signature() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "thinking"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "thinking_delta", "thinking": "step one, "}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "thinking_delta", "thinking": "step two"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "signature_delta", "signature": "c2lnbmF0dXJl"}}"#,
        );
        let events = feed(&mut state, "content_block_stop", r#"{}"#);

        let StreamEvent::ThinkingComplete { block } = &events[0] else {
            panic!("expected ThinkingComplete, got {events:?}");
        };
        assert_eq!(block["type"], "thinking");
        assert_eq!(block["thinking"], "step one, step two");
        assert_eq!(block["signature"], "c2lnbmF0dXJl");

        // Byte-exact round trip through serialize/deserialize.
        let serialized = serde_json::to_vec(block).unwrap();
        let restored: serde_json::Value = serde_json::from_slice(&serialized).unwrap();
        assert_eq!(&restored, block);
    }

    #[test]
    fn redacted_thinking_captured_verbatim() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "redacted_thinking", "data": "opaque-bytes=="}}"#,
        );
        let events = feed(&mut state, "content_block_stop", r#"{}"#);
        let StreamEvent::ThinkingComplete { block } = &events[0] else {
            panic!("expected ThinkingComplete");
        };
        assert_eq!(block["type"], "redacted_thinking");
        assert_eq!(block["data"], "opaque-bytes==");
    }

    #[test]
    fn tool_use_accumulates_input_json() {
        let mut state = StreamState::default();
        let started = feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "tool_use", "id": "tu_1", "name": "analyze_pdf"}}"#,
        );
        assert!(
            matches!(&started[0], StreamEvent::ToolUseStart { name, .. } if name == "analyze_pdf")
        );

        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "{\"file_id\":"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "\"file_7\"}"}}"#,
        );
        let events = feed(&mut state, "content_block_stop", r#"{}"#);
        let StreamEvent::ToolUse { id, name, input } = &events[0] else {
            panic!("expected ToolUse");
        };
        assert_eq!(id, "tu_1");
        assert_eq!(name, "analyze_pdf");
        assert_eq!(input["file_id"], "file_7");
    }

    #[test]
    fn usage_emitted_from_both_ends() {
        let mut state = StreamState::default();
        let start_events = feed(
            &mut state,
            "message_start",
            r#"{"message": {"usage": {"input_tokens": 1200, "cache_read_input_tokens": 800, "cache_creation_input_tokens": 100}}}"#,
        );
        let StreamEvent::Usage { usage } = &start_events[0] else {
            panic!("expected input-side Usage, got {start_events:?}");
        };
        assert_eq!(usage.input, 1200);
        assert_eq!(usage.cache_read, 800);
        assert_eq!(usage.cache_write, 100);
        assert_eq!(usage.output, 0);

        let delta_events = feed(
            &mut state,
            "message_delta",
            r#"{"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 420}}"#,
        );
        let StreamEvent::Usage { usage } = &delta_events[0] else {
            panic!("expected output-side Usage, got {delta_events:?}");
        };
        assert_eq!(usage.output, 420);
        assert_eq!(usage.input, 0);
        assert_eq!(state.stop_reason, "end_turn");
    }

    #[test]
    fn sse_line_parsing() {
        assert!(matches!(
            parse_sse_line("event: message_start"),
            Some(SseParsed::Event(e)) if e == "message_start"
        ));
        assert!(matches!(
            parse_sse_line("data: {}"),
            Some(SseParsed::Data(d)) if d == "{}"
        ));
        assert!(parse_sse_line(": keepalive").is_none());
    }
}
