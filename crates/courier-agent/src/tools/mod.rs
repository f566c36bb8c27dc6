//! Tool registry: typed descriptors plus executors.
//!
//! The turn loop is a state machine over descriptor names — it never knows
//! what a tool does, only its metadata (emoji for display markers, paid
//! flag for the balance pre-check, MIME prefixes for validation). Tool
//! failures of any kind become model-visible results, never errors.

pub mod analyze_image;
pub mod analyze_pdf;
pub mod execute_python;
pub mod render_latex;
pub mod transcribe_audio;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use courier_cache::CacheClient;
use courier_core::{ToolValidationError, Usd};
use courier_store::Database;

use crate::files_api::FilesApiClient;
use crate::provider::{LlmProvider, ToolDefinition};
use crate::sandbox::SandboxClient;
use crate::transcription::TranscriptionClient;

/// Static metadata for one tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolDescriptor {
    pub name: &'static str,
    /// Shown in streaming tool markers, e.g. `[🐍 execute_python]`.
    pub emoji: &'static str,
    pub description: &'static str,
    /// Paid tools are pre-checked against the balance before dispatch.
    pub paid: bool,
    /// Accepted MIME prefixes for file-taking tools; empty = no constraint.
    pub allowed_mime_prefixes: &'static [&'static str],
}

impl ToolDescriptor {
    /// The display marker emitted while this tool runs.
    pub fn marker(&self) -> String {
        format!("[{} {}]", self.emoji, self.name)
    }

    /// Validate a file MIME type against the allowed prefixes.
    pub fn validate_mime(&self, mime: &str) -> Result<(), ToolValidationError> {
        if self.allowed_mime_prefixes.is_empty()
            || self.allowed_mime_prefixes.iter().any(|p| mime.starts_with(p))
        {
            return Ok(());
        }
        Err(ToolValidationError::new(
            self.name,
            format!(
                "unsupported file type {mime}; expected one of {:?}",
                self.allowed_mime_prefixes
            ),
        ))
    }
}

/// Result of one tool execution, fed back to the model as a tool_result
/// block. Structured payloads are JSON-encoded into `content`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    pub cost: Usd,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            cost: Usd::ZERO,
        }
    }

    pub fn success_with_cost(content: impl Into<String>, cost: Usd) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            cost,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            cost: Usd::ZERO,
        }
    }

    /// Structured validation result — the model sees what was wrong and
    /// can correct the call.
    pub fn validation(err: &ToolValidationError) -> Self {
        Self {
            content: json!({
                "error": err.message,
                "tool_name": err.tool_name,
            })
            .to_string(),
            is_error: true,
            cost: Usd::ZERO,
        }
    }

    /// Structured pre-check rejection for paid tools on negative balance.
    pub fn insufficient_balance(tool_name: &str, balance: Usd) -> Self {
        Self {
            content: json!({
                "error": "insufficient_balance",
                "balance_usd": balance.to_string(),
                "tool_name": tool_name,
            })
            .to_string(),
            is_error: true,
            cost: Usd::ZERO,
        }
    }
}

/// Sink for tool-generated files (rendered formulas, plots). Implemented
/// by the messenger layer; tools stay transport-agnostic.
#[async_trait]
pub trait FileDelivery: Send + Sync {
    /// Send an image into the conversation; returns the message id.
    async fn deliver_photo(
        &self,
        chat_id: i64,
        topic_id: i64,
        bytes: Vec<u8>,
        caption: &str,
    ) -> courier_core::Result<i64>;

    /// Send an arbitrary file into the conversation; returns the message id.
    async fn deliver_document(
        &self,
        chat_id: i64,
        topic_id: i64,
        bytes: Vec<u8>,
        filename: &str,
    ) -> courier_core::Result<i64>;
}

/// Shared handles a tool execution may need. Constructed per turn by the
/// batch processor; tools never reach for globals.
pub struct ToolContext {
    pub cache: Arc<CacheClient>,
    pub db: Arc<Database>,
    pub provider: Arc<dyn LlmProvider>,
    pub files: Arc<FilesApiClient>,
    pub sandbox: Option<Arc<SandboxClient>>,
    pub transcription: Option<Arc<TranscriptionClient>>,
    pub delivery: Option<Arc<dyn FileDelivery>>,
    pub user_id: i64,
    pub chat_id: i64,
    pub thread_id: i64,
    pub topic_id: i64,
    pub model_id: String,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn descriptor(&self) -> &'static ToolDescriptor;
    fn input_schema(&self) -> Value;
    async fn execute(&self, ctx: &ToolContext, input: Value) -> ToolOutcome;
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn ToolExecutor>>) -> Self {
        Self { tools }
    }

    /// All built-in tools.
    pub fn builtin() -> Self {
        Self::new(vec![
            Arc::new(analyze_image::AnalyzeImage),
            Arc::new(analyze_pdf::AnalyzePdf),
            Arc::new(execute_python::ExecutePython),
            Arc::new(transcribe_audio::TranscribeAudio),
            Arc::new(render_latex::RenderLatex::new()),
        ])
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn ToolExecutor>> {
        self.tools.iter().find(|t| t.descriptor().name == name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&'static ToolDescriptor> {
        self.find(name).map(|t| t.descriptor())
    }

    /// Wire-format definitions for the provider request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.descriptor().name.to_string(),
                description: t.descriptor().description.to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
