//! Three-block system prompt with prompt-cache markers.
//!
//! Block order is fixed: global prompt, user custom prompt, files context.
//! The global block is always cache-tagged; the custom block only when it
//! is big enough to be worth a cache entry; the files listing is dynamic
//! and never tagged.

use serde_json::{json, Value};

/// Minimum estimated tokens before the user custom prompt gets its own
/// cache marker. Below this, caching costs more than it saves.
pub const CUSTOM_PROMPT_CACHE_THRESHOLD: u32 = 256;

/// Rough token estimate: ~4 chars per token for mixed prose.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32) / 4 + 1
}

#[derive(Debug, Clone)]
pub struct SystemPrompt {
    global: String,
    custom: Option<String>,
    files_context: Option<String>,
}

impl SystemPrompt {
    pub fn new(
        global: impl Into<String>,
        custom: Option<String>,
        files_context: Option<String>,
    ) -> Self {
        Self {
            global: global.into(),
            custom: custom.filter(|s| !s.trim().is_empty()),
            files_context: files_context.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Wire-format system blocks with cache_control markers.
    pub fn to_blocks(&self) -> Vec<Value> {
        let mut blocks = vec![json!({
            "type": "text",
            "text": self.global,
            "cache_control": {"type": "ephemeral"},
        })];

        if let Some(custom) = &self.custom {
            let mut block = json!({
                "type": "text",
                "text": custom,
            });
            if estimate_tokens(custom) >= CUSTOM_PROMPT_CACHE_THRESHOLD {
                block["cache_control"] = json!({"type": "ephemeral"});
            }
            blocks.push(block);
        }

        if let Some(files) = &self.files_context {
            blocks.push(json!({
                "type": "text",
                "text": files,
            }));
        }

        blocks
    }

    /// Estimated token footprint of the whole prompt, for the context budget.
    pub fn estimated_tokens(&self) -> u32 {
        estimate_tokens(&self.global)
            + self.custom.as_deref().map(estimate_tokens).unwrap_or(0)
            + self
                .files_context
                .as_deref()
                .map(estimate_tokens)
                .unwrap_or(0)
    }
}

/// Render the files-context block from live thread files.
///
/// Listing shape: one line per file with id, kind, mime, and size, so the
/// model can reference ids in tool calls.
pub fn render_files_context(files: &[(String, String, String, i64)]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let mut out = String::from("Files available in this conversation:\n");
    for (file_id, kind, mime, size) in files {
        out.push_str(&format!("- {file_id} ({kind}, {mime}, {size} bytes)\n"));
    }
    Some(out)
}
