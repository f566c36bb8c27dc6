//! First-message topic naming for forum threads.
//!
//! A cheap model call produces a short title, the forum topic is renamed,
//! and the thread record stops asking. Failures only log — naming is
//! cosmetic and never blocks the pipeline.

use std::sync::Arc;

use serde_json::json;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ThreadId};
use tracing::{info, warn};

use courier_agent::prompt::SystemPrompt;
use courier_agent::provider::{collect_response, ChatRequest, LlmProvider};
use courier_core::Result;
use courier_store::models::Thread;
use courier_store::repo::threads;
use courier_store::Database;

use crate::process::AppContext;

const TITLE_MAX_CHARS: usize = 64;

/// Fire-and-forget naming task.
pub fn spawn_topic_naming(app: &AppContext, thread: Thread, first_text: String) {
    let bot = app.bot.clone();
    let provider = Arc::clone(&app.provider);
    let db = Arc::clone(&app.db);
    let model = app.config.policy.topic_naming_model.clone();
    tokio::spawn(async move {
        if let Err(e) = name_topic(bot, provider, db, model, thread, first_text).await {
            warn!(error = %e, "topic naming failed");
        }
    });
}

async fn name_topic(
    bot: Bot,
    provider: Arc<dyn LlmProvider>,
    db: Arc<Database>,
    model: String,
    thread: Thread,
    first_text: String,
) -> Result<()> {
    let sample: String = first_text.chars().take(500).collect();
    let request = ChatRequest {
        model,
        max_tokens: 32,
        system: SystemPrompt::new(
            "Produce a short title (2-5 words) for a conversation that starts with the \
             given message. Reply with the title only, no quotes, no punctuation at the end.",
            None,
            None,
        ),
        messages: vec![json!({"role": "user", "content": sample})],
        tools: vec![],
        thinking_budget: None,
    };

    let (raw_title, _usage) = collect_response(provider.as_ref(), &request).await?;
    let title = sanitize_title(&raw_title);
    if title.is_empty() {
        return Ok(());
    }

    let mut req = bot.edit_forum_topic(
        ChatId(thread.chat_id),
        ThreadId(MessageId(thread.topic_id as i32)),
    );
    req.name = Some(title.clone());
    if let Err(e) = req.await {
        warn!(chat_id = thread.chat_id, topic_id = thread.topic_id, error = %e,
              "edit_forum_topic failed");
        return Ok(());
    }

    let thread_id = thread.id;
    let stored_title = title.clone();
    db.with_conn(move |conn| threads::set_title(conn, thread_id, &stored_title))
        .await?;

    info!(thread_id, title = %title, "topic named");
    Ok(())
}

/// First line, trimmed, unquoted, capped.
fn sanitize_title(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("").trim();
    let unquoted = first_line.trim_matches(|c| c == '"' || c == '\'' || c == '«' || c == '»');
    unquoted.chars().take(TITLE_MAX_CHARS).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_quotes_and_extra_lines() {
        assert_eq!(sanitize_title("\"Rust lifetimes\"\nextra"), "Rust lifetimes");
        assert_eq!(sanitize_title("  Plain title  "), "Plain title");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "word ".repeat(40);
        assert!(sanitize_title(&long).chars().count() <= TITLE_MAX_CHARS);
    }

    #[test]
    fn sanitize_empty() {
        assert_eq!(sanitize_title(""), "");
        assert_eq!(sanitize_title("\n\n"), "");
    }
}
