//! Anthropic Messages API client (streaming only — the pipeline always
//! streams, and sub-calls collect the stream).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::config::AnthropicConfig;
use courier_core::{config, CourierError, Result};

use crate::provider::{ChatRequest, LlmProvider, StreamEvent};

const API_VERSION: &str = "2023-06-01";
/// Beta flag required for Files API references in message content.
const FILES_BETA: &str = "files-api-2025-04-14";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &AnthropicConfig) -> Result<Self> {
        let api_key = config::read_secret_file(&cfg.api_key_file)?;
        Ok(Self::new(api_key, cfg.base_url.clone()))
    }

    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    fn map_transport_error(e: reqwest::Error) -> CourierError {
        if e.is_timeout() {
            CourierError::ApiTimeout(e.to_string())
        } else if e.is_connect() {
            CourierError::ApiConnection(e.to_string())
        } else {
            CourierError::Provider(e.to_string())
        }
    }
}

pub(crate) fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "system": req.system.to_blocks(),
        "messages": req.messages,
        "stream": true,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    if let Some(budget) = req.thinking_budget {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": budget,
        });
    }

    body
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, messages = req.messages.len(), "streaming request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", FILES_BETA)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status().as_u16();
        match status {
            429 => {
                let retry = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                return Err(CourierError::RateLimited {
                    retry_after_secs: retry,
                });
            }
            529 => return Err(CourierError::Overloaded),
            s if !resp.status().is_success() => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = s, body = %text, "provider API error");
                return Err(CourierError::Provider(format!("status {s}: {text}")));
            }
            _ => {}
        }

        crate::sse::process_stream(resp, tx).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::SystemPrompt;
    use crate::provider::ToolDefinition;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-5".into(),
            max_tokens: 8192,
            system: SystemPrompt::new("global", None, None),
            messages: vec![serde_json::json!({"role": "user", "content": "hi"})],
            tools: vec![],
            thinking_budget: None,
        }
    }

    #[test]
    fn body_has_stream_and_system_blocks() {
        let body = build_request_body(&request());
        assert_eq!(body["stream"], true);
        assert!(body["system"].is_array());
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert!(body.get("tools").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn body_includes_tools_when_present() {
        let mut req = request();
        req.tools.push(ToolDefinition {
            name: "analyze_pdf".into(),
            description: "Analyze a PDF".into(),
            input_schema: serde_json::json!({"type": "object"}),
        });
        let body = build_request_body(&req);
        assert_eq!(body["tools"][0]["name"], "analyze_pdf");
    }

    #[test]
    fn body_includes_thinking_budget() {
        let mut req = request();
        req.thinking_budget = Some(8_192);
        let body = build_request_body(&req);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 8_192);
    }

    #[test]
    fn messages_pass_through_untouched() {
        let mut req = request();
        let continuation = serde_json::json!({
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "reasoning", "signature": "sig=="},
                {"type": "text", "text": "answer"},
            ]
        });
        req.messages.push(continuation.clone());
        let body = build_request_body(&req);
        // Thinking blocks must survive the body build byte-for-byte.
        assert_eq!(body["messages"][1], continuation);
    }
}
