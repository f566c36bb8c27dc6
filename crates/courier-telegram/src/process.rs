//! The batch processor: everything between a debounced batch and a
//! committed turn.
//!
//! Order per batch: wait for uploads → acquire a user slot → balance gate →
//! warm the cache → assemble prompt and history → run the turn loop with a
//! streaming draft → charge once → enqueue persistence → final render.
//! The charge lands before persistence is enqueued: the assistant message
//! is durable iff the charge succeeded.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use teloxide::prelude::*;
use teloxide::types::ThreadId;
use tracing::{error, info, warn};

use courier_agent::context::select_history;
use courier_agent::cost::CostTracker;
use courier_agent::files_api::FilesApiClient;
use courier_agent::prompt::{render_files_context, SystemPrompt};
use courier_agent::provider::{ChatRequest, LlmProvider};
use courier_agent::sandbox::SandboxClient;
use courier_agent::tools::{ToolContext, ToolRegistry};
use courier_agent::transcription::TranscriptionClient;
use courier_agent::turn::{run_turn, TurnOutcome};
use courier_cache::{batch as cache_batch, keys, CacheClient, WriteKind, WriteQueue};
use courier_core::config::CourierConfig;
use courier_core::error::LogLevel;
use courier_core::metrics::Metrics;
use courier_core::pricing;
use courier_core::{CourierError, Result, TokenUsage, Usd};
use courier_store::models::{
    FileKind, Role, StoredMessage, Thread, ToolCallRecord, User, UserFile,
};
use courier_store::repo::{messages as messages_repo, threads as threads_repo, users as users_repo};
use courier_store::{BalancePolicy, BalanceService, Database};

use crate::delivery::TelegramFileDelivery;
use crate::display::ParseMode;
use crate::generation::GenerationTracker;
use crate::limiter::UserConcurrencyLimiter;
use crate::queue::{BatchHandler, InboundMessage};
use crate::streaming::StreamingDraft;
use crate::topic_naming;
use crate::uploads::UploadTracker;

/// Block 1 of every system prompt. Cache-tagged on every request.
pub const GLOBAL_PROMPT: &str = "You are Courier, a careful assistant living in a Telegram \
chat. Answer in the user's language. Keep answers tight; expand only when asked. You can \
analyze images and PDF documents shared in this conversation and execute Python in a \
sandbox. Reference files by the ids listed in your context.";

/// Welcome credit granted when a user first talks to the bot.
const WELCOME_CREDIT_E4: i64 = 1_000; // $0.10

/// Process-scoped dependency bundle. Constructed once at startup and
/// passed explicitly — no global mutable state anywhere in the pipeline.
pub struct AppContext {
    pub bot: Bot,
    pub config: CourierConfig,
    pub metrics: Arc<Metrics>,
    pub cache: Arc<CacheClient>,
    pub db: Arc<Database>,
    pub write_queue: Arc<WriteQueue>,
    pub provider: Arc<dyn LlmProvider>,
    pub files_api: Arc<FilesApiClient>,
    pub sandbox: Option<Arc<SandboxClient>>,
    pub transcription: Option<Arc<TranscriptionClient>>,
    pub registry: ToolRegistry,
    pub policy: BalancePolicy,
    pub balance: Arc<BalanceService>,
    pub limiter: UserConcurrencyLimiter,
    pub generations: GenerationTracker,
    pub uploads: UploadTracker,
}

#[async_trait]
impl BatchHandler for AppContext {
    async fn process(&self, thread_id: i64, batch: Vec<InboundMessage>) -> Result<()> {
        if let Err(e) = self.run_pipeline(thread_id, &batch).await {
            match e.log_level() {
                LogLevel::Warn => warn!(thread_id, error = %e, "pipeline ended with error"),
                LogLevel::Error => error!(thread_id, error = %e, "pipeline ended with error"),
            }
            if let Some(first) = batch.first() {
                self.send_plain(first.chat_id, first.topic_id, &e.user_message())
                    .await;
            }
        }
        Ok(())
    }
}

impl AppContext {
    async fn send_plain(&self, chat_id: i64, topic_id: i64, text: &str) {
        let mut req = self.bot.send_message(ChatId(chat_id), text);
        if topic_id != 0 {
            req.message_thread_id = Some(ThreadId(teloxide::types::MessageId(topic_id as i32)));
        }
        if let Err(e) = req.await {
            warn!(chat_id, error = %e, "failed to send notice");
        }
    }

    /// Get the user, creating one with a welcome credit on first contact.
    pub async fn get_or_create_user(&self, user_id: i64, display_name: Option<String>) -> Result<User> {
        let existing = self
            .db
            .with_conn(move |conn| users_repo::get(conn, user_id))
            .await?;
        if let Some(user) = existing {
            return Ok(user);
        }

        let mut user = User::new(user_id, self.config.anthropic.default_model.clone());
        user.display_name = display_name;
        {
            let user = user.clone();
            self.db
                .with_conn(move |conn| users_repo::upsert(conn, &user))
                .await?;
        }
        self.balance
            .credit(
                user_id,
                courier_store::models::BalanceOpKind::AdminTopup,
                Usd::from_micros_e4(WELCOME_CREDIT_E4),
                "welcome credit".to_string(),
                None,
            )
            .await?;
        info!(user_id, "new user created with welcome credit");
        self.db
            .with_conn(move |conn| users_repo::get(conn, user_id))
            .await?
            .ok_or_else(|| CourierError::Internal("user vanished after create".into()))
    }

    async fn run_pipeline(&self, thread_id: i64, batch: &[InboundMessage]) -> Result<()> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let chat_id = first.chat_id;
        let user_id = first.user_id;
        let topic_id = first.topic_id;

        // 1. Media still in flight for this chat must land in this batch.
        if !self.uploads.wait_default(chat_id).await {
            warn!(chat_id, thread_id, "proceeding without tardy uploads");
        }

        // 2. Per-user slot; a queue timeout is a user-visible notice, not
        // a retryable failure.
        let _permit = match self.limiter.acquire(user_id, thread_id).await {
            Ok(permit) => permit,
            Err(e @ CourierError::ConcurrencyLimit { .. }) => {
                self.send_plain(chat_id, topic_id, &e.user_message()).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // 3. Admission gate, cache-first.
        let check = self.policy.can_make_request(user_id).await;
        if !check.allowed {
            info!(user_id, balance = %check.balance, source = check.source, "request rejected");
            self.send_plain(
                chat_id,
                topic_id,
                &format!(
                    "💰 Insufficient balance (${}). Top up to continue.",
                    check.balance
                ),
            )
            .await;
            return Ok(());
        }

        // 4. One pipelined read warms user/thread/messages/files.
        let warm =
            cache_batch::warm_thread_context(&self.cache, user_id, chat_id, Some(topic_id).filter(|t| *t != 0), thread_id)
                .await;

        let user = match warm.user.clone().and_then(|v| serde_json::from_value::<User>(v).ok()) {
            Some(user) => user,
            None => self.get_or_create_user(user_id, None).await?,
        };

        let thread = self
            .db
            .with_conn(move |conn| threads_repo::get(conn, thread_id))
            .await?
            .ok_or_else(|| CourierError::Internal(format!("thread {thread_id} missing")))?;

        // 5. History and live files, cache-first with DB fallback.
        let had_cached_messages = warm.messages.is_some();
        let had_cached_files = warm.files.is_some();
        let history = match warm.messages {
            Some(values) => values
                .into_iter()
                .filter_map(|v| serde_json::from_value::<StoredMessage>(v).ok())
                .collect(),
            None => {
                self.db
                    .with_conn(move |conn| messages_repo::recent_for_thread(conn, thread_id, 200))
                    .await?
            }
        };
        let live_files: Vec<UserFile> = match warm.files {
            Some(values) => values
                .into_iter()
                .filter_map(|v| serde_json::from_value::<UserFile>(v).ok())
                .collect(),
            None => {
                let now = Utc::now();
                self.db
                    .with_conn(move |conn| {
                        courier_store::repo::files::live_for_thread(conn, thread_id, now)
                    })
                    .await?
            }
        };

        // Refill whichever slots missed so the next batch reads warm.
        if !had_cached_messages || !had_cached_files {
            let msg_values: Vec<Value> = history
                .iter()
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect();
            let file_values: Vec<Value> = live_files
                .iter()
                .filter_map(|f| serde_json::to_value(f).ok())
                .collect();
            cache_batch::cache_thread_context(
                &self.cache,
                user_id,
                chat_id,
                Some(topic_id).filter(|t| *t != 0),
                thread_id,
                None,
                None,
                (!had_cached_messages).then_some(msg_values.as_slice()),
                (!had_cached_files).then_some(file_values.as_slice()),
            )
            .await;
        }

        // 6. Prompt: global block, user block, dynamic files block.
        let files_listing: Vec<(String, String, String, i64)> = live_files
            .iter()
            .map(|f| {
                (
                    f.file_id.clone(),
                    f.kind.as_str().to_string(),
                    f.mime.clone(),
                    f.size,
                )
            })
            .collect();
        let system = SystemPrompt::new(
            GLOBAL_PROMPT,
            user.custom_prompt.clone(),
            render_files_context(&files_listing),
        );

        let spec = pricing::lookup_model(&user.model_id)?;
        let max_output = spec.max_output.min(8_192);

        // 7. Token-budgeted history window. Overflow surfaces to the
        // outer handler as a user-visible message; no provider call, no
        // charge.
        let window = select_history(&history, spec.context_window, system.estimated_tokens(), max_output)?;

        let mut wire_messages: Vec<Value> = window
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.text}))
            .collect();
        wire_messages.push(json!({
            "role": "user",
            "content": batch_content_blocks(batch, &live_files),
        }));

        let request = ChatRequest {
            model: user.model_id.clone(),
            max_tokens: max_output,
            system,
            messages: wire_messages,
            tools: self.registry.definitions(),
            thinking_budget: Some(4_096),
        };

        // 8. Streaming display + cancellation signal for this turn.
        let cancel = self.generations.start(chat_id, user_id, topic_id);
        let mut draft = StreamingDraft::new(
            self.bot.clone(),
            ChatId(chat_id),
            (topic_id != 0).then(|| ThreadId(teloxide::types::MessageId(topic_id as i32))),
            ParseMode::default(),
            Arc::clone(&self.metrics),
        );
        draft.begin().await?;

        let tool_ctx = ToolContext {
            cache: Arc::clone(&self.cache),
            db: Arc::clone(&self.db),
            provider: Arc::clone(&self.provider),
            files: Arc::clone(&self.files_api),
            sandbox: self.sandbox.clone(),
            transcription: self.transcription.clone(),
            delivery: Some(Arc::new(TelegramFileDelivery::new(self.bot.clone()))),
            user_id,
            chat_id,
            thread_id,
            topic_id,
            model_id: user.model_id.clone(),
        };
        let mut tracker = CostTracker::new(&user.model_id, user_id);

        let turn = run_turn(
            Arc::clone(&self.provider),
            &self.registry,
            &self.policy,
            &self.metrics,
            &tool_ctx,
            request,
            &mut tracker,
            &mut draft,
            &cancel,
            self.config.policy.tool_cost_precheck_enabled,
        )
        .await;
        self.generations.cleanup(chat_id, user_id, topic_id);

        let outcome = match turn {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transient provider failures end the turn with a single
                // user-visible message; nothing is charged or persisted.
                draft.fail(&e.user_message()).await;
                match e.log_level() {
                    LogLevel::Warn => warn!(thread_id, error = %e, "turn failed"),
                    LogLevel::Error => error!(thread_id, error = %e, "turn failed"),
                }
                return Ok(());
            }
        };

        self.finalize_turn(&thread, batch, outcome, tracker, &mut draft)
            .await
    }

    /// Charge, then persist, then render. A failed charge aborts
    /// persistence entirely and apologizes.
    async fn finalize_turn(
        &self,
        thread: &Thread,
        batch: &[InboundMessage],
        outcome: TurnOutcome,
        tracker: CostTracker,
        draft: &mut StreamingDraft,
    ) -> Result<()> {
        let thread_id = thread.id;
        let chat_id = thread.chat_id;
        let user_id = thread.user_id;
        let assistant_message_id = draft.message_id().map(|id| i64::from(id.0));

        if let Err(e) = tracker
            .finalize_and_charge(&self.balance, "turn", assistant_message_id)
            .await
        {
            error!(user_id, error = %e, "charge failed, discarding turn persistence");
            draft
                .fail("Something went wrong saving this conversation. You were not charged.")
                .await;
            return Ok(());
        }

        // Persistence rides the write-behind queue; the flusher applies it
        // in batches with upsert semantics.
        for msg in batch {
            let stored = StoredMessage {
                chat_id: msg.chat_id,
                message_id: msg.message_id,
                thread_id,
                role: Role::User,
                text: msg.text.clone(),
                attachments: msg.file_ids.iter().map(|id| json!({"file_id": id})).collect(),
                usage: TokenUsage::default(),
                thinking_json: None,
                edit_count: 0,
                created_at: msg.received_at,
            };
            self.enqueue(WriteKind::Message, &stored).await;
        }

        if let Some(message_id) = assistant_message_id {
            let assistant = StoredMessage {
                chat_id,
                message_id,
                thread_id,
                role: Role::Assistant,
                text: outcome.text.clone(),
                attachments: vec![],
                usage: *tracker.usage(),
                thinking_json: (!outcome.thinking_blocks.is_empty())
                    .then(|| Value::Array(outcome.thinking_blocks.clone())),
                edit_count: 0,
                created_at: Utc::now(),
            };
            self.enqueue(WriteKind::Message, &assistant).await;
        }

        for execution in &outcome.tool_executions {
            let record = ToolCallRecord {
                id: execution.id.clone(),
                user_id,
                chat_id,
                thread_id: Some(thread_id),
                message_id: assistant_message_id,
                tool_name: execution.name.clone(),
                model_id: tracker.model_id().to_string(),
                usage: TokenUsage::default(),
                cost: execution.outcome.cost,
                duration_ms: execution.duration_ms as i64,
                success: !execution.outcome.is_error,
                error: execution
                    .outcome
                    .is_error
                    .then(|| truncate_error(&execution.outcome.content)),
                created_at: Utc::now(),
            };
            self.enqueue(WriteKind::ToolCall, &record).await;
        }

        let total_tokens =
            (tracker.usage().input + tracker.usage().output + tracker.usage().thinking) as i64;
        self.write_queue
            .enqueue(
                WriteKind::UserStats,
                json!({
                    "user_id": user_id,
                    "messages_delta": (batch.len() + 1) as i64,
                    "tokens_delta": total_tokens,
                }),
            )
            .await;

        // History changed; force the next read through the database until
        // the flusher catches up.
        self.cache.delete(&keys::messages_key(thread_id)).await;

        draft.finalize().await;

        self.metrics.turns_completed.fetch_add(1, Ordering::Relaxed);
        if outcome.cancelled {
            self.metrics.turns_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            thread_id,
            user_id,
            iterations = outcome.iterations,
            tools = outcome.tool_executions.len(),
            cancelled = outcome.cancelled,
            stop_reason = %outcome.stop_reason,
            "turn finalized"
        );

        // First message in a forum topic names the thread, off the hot path.
        if thread.needs_topic_naming
            && self.config.policy.topic_naming_enabled
            && thread.topic_id != 0
        {
            if let Some(first) = batch.first() {
                topic_naming::spawn_topic_naming(self, thread.clone(), first.text.clone());
            }
        }

        Ok(())
    }

    async fn enqueue<T: serde::Serialize>(&self, kind: WriteKind, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.write_queue.enqueue(kind, value).await;
            }
            Err(e) => warn!(error = %e, "persistence payload failed to serialize"),
        }
    }
}

fn truncate_error(content: &str) -> String {
    content.chars().take(500).collect()
}

/// Build the current user turn's content blocks: the batch texts joined,
/// plus provider file references for this batch's attachments.
fn batch_content_blocks(batch: &[InboundMessage], live_files: &[UserFile]) -> Vec<Value> {
    let text: String = batch
        .iter()
        .map(|m| m.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut blocks: Vec<Value> = Vec::new();
    for msg in batch {
        for file_id in &msg.file_ids {
            let kind = live_files
                .iter()
                .find(|f| &f.file_id == file_id)
                .map(|f| f.kind);
            match kind {
                Some(FileKind::Image) => blocks.push(json!({
                    "type": "image",
                    "source": {"type": "file", "file_id": file_id},
                })),
                Some(FileKind::Pdf) => blocks.push(json!({
                    "type": "document",
                    "source": {"type": "file", "file_id": file_id},
                })),
                _ => blocks.push(json!({
                    "type": "text",
                    "text": format!("[User attached file {file_id}]"),
                })),
            }
        }
    }

    blocks.push(json!({
        "type": "text",
        "text": if text.is_empty() { "[The user sent attachments]".to_string() } else { text },
    }));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::models::FileSource;

    fn inbound(text: &str, file_ids: Vec<String>) -> InboundMessage {
        InboundMessage {
            chat_id: 1,
            message_id: 1,
            user_id: 1,
            topic_id: 0,
            text: text.into(),
            file_ids,
            received_at: Utc::now(),
        }
    }

    fn live_file(file_id: &str, kind: FileKind, mime: &str) -> UserFile {
        UserFile {
            file_id: file_id.into(),
            chat_file_id: format!("tg-{file_id}"),
            thread_id: 1,
            chat_id: Some(1),
            message_id: Some(1),
            kind,
            mime: mime.into(),
            size: 10,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            source: FileSource::User,
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn split_batch_joins_texts() {
        let batch = vec![inbound("part one", vec![]), inbound("part two", vec![])];
        let blocks = batch_content_blocks(&batch, &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["text"], "part one\n\npart two");
    }

    #[test]
    fn attachments_become_file_reference_blocks() {
        let batch = vec![inbound("look at these", vec!["f_img".into(), "f_pdf".into()])];
        let files = vec![
            live_file("f_img", FileKind::Image, "image/png"),
            live_file("f_pdf", FileKind::Pdf, "application/pdf"),
        ];
        let blocks = batch_content_blocks(&batch, &files);
        assert_eq!(blocks[0]["type"], "image");
        assert_eq!(blocks[0]["source"]["file_id"], "f_img");
        assert_eq!(blocks[1]["type"], "document");
        assert_eq!(blocks[2]["type"], "text");
    }

    #[test]
    fn attachment_only_batch_gets_placeholder_text() {
        let batch = vec![inbound("", vec!["f_doc".into()])];
        let blocks = batch_content_blocks(&batch, &[]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["text"], "[The user sent attachments]");
    }
}
