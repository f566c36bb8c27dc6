//! Document sub-call: the PDF is referenced by its Files API id, so no
//! bytes move through the bot for documents the provider already holds.

use async_trait::async_trait;
use serde_json::{json, Value};

use courier_core::pricing::cost_for_usage;
use courier_store::repo::files;

use crate::prompt::SystemPrompt;
use crate::provider::{collect_response, ChatRequest};

use super::{ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome};

static DESCRIPTOR: ToolDescriptor = ToolDescriptor {
    name: "analyze_pdf",
    emoji: "📄",
    description: "Read and analyze a PDF document from this conversation. Provide the \
                  file_id and a question; the full document is considered.",
    paid: false,
    allowed_mime_prefixes: &["application/pdf"],
};

pub struct AnalyzePdf;

#[async_trait]
impl ToolExecutor for AnalyzePdf {
    fn descriptor(&self) -> &'static ToolDescriptor {
        &DESCRIPTOR
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id of the PDF to analyze"
                },
                "question": {
                    "type": "string",
                    "description": "What to extract or answer from the document"
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
            .unwrap_or("Summarize this document.")
            .to_string();

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
        if !record.is_live(chrono::Utc::now()) {
            return ToolOutcome::error(format!(
                "file {file_id} has expired from the provider; ask the user to re-send it"
            ));
        }

        let request = ChatRequest {
            model: ctx.model_id.clone(),
            max_tokens: 4096,
            system: SystemPrompt::new(
                "You analyze documents precisely. Quote the document where relevant.",
                None,
                None,
            ),
            messages: vec![json!({
                "role": "user",
                "content": [
                    {
                        "type": "document",
                        "source": {"type": "file", "file_id": file_id},
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
            Err(e) => ToolOutcome::error(format!("document analysis failed: {e}")),
        }
    }
}
