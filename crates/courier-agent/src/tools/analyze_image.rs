//! Vision sub-call: fetch the image bytes (cache first, Files API
//! fallback), send them to the model with the question, return its answer.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use courier_cache::file_bytes;
use courier_core::pricing::cost_for_usage;
use courier_store::repo::files;

use crate::prompt::SystemPrompt;
use crate::provider::{collect_response, ChatRequest};

use super::{ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome};

static DESCRIPTOR: ToolDescriptor = ToolDescriptor {
    name: "analyze_image",
    emoji: "🖼️",
    description: "Analyze an image from this conversation. Provide the file_id of the image \
                  and a question about its content.",
    paid: false,
    allowed_mime_prefixes: &["image/"],
};

pub struct AnalyzeImage;

#[async_trait]
impl ToolExecutor for AnalyzeImage {
    fn descriptor(&self) -> &'static ToolDescriptor {
        &DESCRIPTOR
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id of the image to analyze"
                },
                "question": {
                    "type": "string",
                    "description": "What to look for or answer about the image"
                }
            },
            "required": ["file_id"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(file_id) = input["file_id"].as_str().map(String::from) else {
            return ToolOutcome::error("missing required parameter: file_id");
        };
        let question = input["question"]
            .as_str()
            .unwrap_or("Describe this image in detail.")
            .to_string();

        // Sequential DB resolution before any parallel I/O.
        let lookup = {
            let file_id = file_id.clone();
            ctx.db
                .with_conn(move |conn| files::get(conn, &file_id))
                .await
        };
        let record = match lookup {
            Ok(Some(record)) => record,
            Ok(None) => {
                return ToolOutcome::error(format!("no file with id {file_id} in this thread"))
            }
            Err(e) => return ToolOutcome::error(format!("file lookup failed: {e}")),
        };

        if let Err(validation) = DESCRIPTOR.validate_mime(&record.mime) {
            return ToolOutcome::validation(&validation);
        }

        // Bytes: cached slab first, provider Files API second.
        let bytes = match file_bytes::get_file_bytes(&ctx.cache, &record.chat_file_id).await {
            Some(bytes) => bytes,
            None => match ctx.files.download(&file_id).await {
                Ok(bytes) => {
                    file_bytes::store_file_bytes(&ctx.cache, &record.chat_file_id, &bytes).await;
                    bytes
                }
                Err(e) => return ToolOutcome::error(format!("image download failed: {e}")),
            },
        };

        debug!(file_id = %file_id, size = bytes.len(), "analyzing image");

        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let request = ChatRequest {
            model: ctx.model_id.clone(),
            max_tokens: 2048,
            system: SystemPrompt::new(
                "You analyze images precisely. Answer the question directly.",
                None,
                None,
            ),
            messages: vec![json!({
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": record.mime,
                            "data": encoded,
                        }
                    },
                    {"type": "text", "text": question},
                ]
            })],
            tools: vec![],
            thinking_budget: None,
        };

        match collect_response(ctx.provider.as_ref(), &request).await {
            Ok((answer, usage)) => {
                let cost = cost_for_usage(&ctx.model_id, &usage).unwrap_or_default();
                ToolOutcome::success_with_cost(answer, cost)
            }
            Err(e) => ToolOutcome::error(format!("image analysis failed: {e}")),
        }
    }
}
