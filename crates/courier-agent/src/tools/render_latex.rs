//! Render LaTeX math as a PNG and send it into the conversation.
//!
//! Rendering goes through a formula-image service; the resulting image is
//! delivered via the messenger's `FileDelivery` sink. Free — no provider
//! tokens, no per-use cost.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome};

static DESCRIPTOR: ToolDescriptor = ToolDescriptor {
    name: "render_latex",
    emoji: "🎨",
    description: "Render a LaTeX math expression as a PNG image and send it to the user. \
                  Use for formulas that plain text cannot display (fractions, integrals, \
                  matrices). Pass the expression WITHOUT $ delimiters.",
    paid: false,
    allowed_mime_prefixes: &[],
};

const RENDER_BASE_URL: &str = "https://latex.codecogs.com/png.image";
const MAX_LATEX_CHARS: usize = 2_000;

pub struct RenderLatex {
    client: reqwest::Client,
}

impl RenderLatex {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RenderLatex {
    fn default() -> Self {
        Self::new()
    }
}

/// Compose the render URL: dpi prefix, optional display style, expression.
fn render_url(latex: &str, display_mode: bool, dpi: u32) -> String {
    let styled = if display_mode {
        format!("\\dpi{{{dpi}}}\\displaystyle {latex}")
    } else {
        format!("\\dpi{{{dpi}}}{latex}")
    };
    format!("{RENDER_BASE_URL}?{}", urlencoding::encode(&styled))
}

#[async_trait]
impl ToolExecutor for RenderLatex {
    fn descriptor(&self) -> &'static ToolDescriptor {
        &DESCRIPTOR
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "latex": {
                    "type": "string",
                    "description": "LaTeX math expression without delimiters, e.g. \
                                    \"\\\\frac{1}{2} + \\\\sqrt{x}\""
                },
                "display_mode": {
                    "type": "boolean",
                    "description": "true for large display-style rendering with limits \
                                    above/below operators; false (default) for inline size"
                }
            },
            "required": ["latex"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(latex) = input["latex"].as_str() else {
            return ToolOutcome::error("missing required parameter: latex");
        };
        let latex = latex.trim().trim_matches('$');
        if latex.is_empty() {
            return ToolOutcome::error("latex expression is empty");
        }
        if latex.chars().count() > MAX_LATEX_CHARS {
            return ToolOutcome::error(format!(
                "latex expression too long (max {MAX_LATEX_CHARS} characters)"
            ));
        }
        let display_mode = input["display_mode"].as_bool().unwrap_or(false);

        let Some(delivery) = ctx.delivery.as_ref() else {
            return ToolOutcome::error("image delivery is not available in this context");
        };

        let url = render_url(latex, display_mode, 160);
        debug!(chars = latex.len(), display_mode, "rendering formula");

        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                // Render services answer 4xx for malformed expressions;
                // the model can fix its syntax and retry.
                return ToolOutcome::error(format!(
                    "render service rejected the expression (status {}); check the LaTeX syntax",
                    resp.status().as_u16()
                ));
            }
            Err(e) => return ToolOutcome::error(format!("render request failed: {e}")),
        };
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return ToolOutcome::error(format!("render download failed: {e}")),
        };
        if infer::get(&bytes).map(|k| k.mime_type()) != Some("image/png") {
            return ToolOutcome::error("render service returned something that is not a PNG");
        }

        let caption: String = latex.chars().take(200).collect();
        match delivery
            .deliver_photo(ctx.chat_id, ctx.topic_id, bytes, &caption)
            .await
        {
            Ok(message_id) => ToolOutcome::success(format!(
                "Formula rendered and sent to the user as an image (message {message_id})."
            )),
            Err(e) => ToolOutcome::error(format!("image delivery failed: {e}")),
        }
    }
}
