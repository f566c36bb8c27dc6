//! Entity models. Ownership is a forest rooted at User: users own threads,
//! threads own messages, messages own files and tool calls. Money fields
//! are fixed-point USD stored as integer ten-thousandths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{TokenUsage, Usd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ChatKind::Private),
            "group" => Some(ChatKind::Group),
            "supergroup" => Some(ChatKind::Supergroup),
            "channel" => Some(ChatKind::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Pdf,
    Audio,
    Video,
    Document,
    Generated,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Pdf => "pdf",
            FileKind::Audio => "audio",
            FileKind::Video => "video",
            FileKind::Document => "document",
            FileKind::Generated => "generated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(FileKind::Image),
            "pdf" => Some(FileKind::Pdf),
            "audio" => Some(FileKind::Audio),
            "video" => Some(FileKind::Video),
            "document" => Some(FileKind::Document),
            "generated" => Some(FileKind::Generated),
            _ => None,
        }
    }

    /// Classify from a MIME type (for inbound media).
    pub fn from_mime(mime: &str) -> Self {
        if courier_core::mime::is_image(mime) {
            FileKind::Image
        } else if courier_core::mime::is_pdf(mime) {
            FileKind::Pdf
        } else if courier_core::mime::is_audio(mime) {
            FileKind::Audio
        } else if courier_core::mime::is_video(mime) {
            FileKind::Video
        } else {
            FileKind::Document
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    User,
    Assistant,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSource::User => "user",
            FileSource::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(FileSource::User),
            "assistant" => Some(FileSource::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOpKind {
    Payment,
    Usage,
    Refund,
    AdminTopup,
}

impl BalanceOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceOpKind::Payment => "payment",
            BalanceOpKind::Usage => "usage",
            BalanceOpKind::Refund => "refund",
            BalanceOpKind::AdminTopup => "admin_topup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment" => Some(BalanceOpKind::Payment),
            "usage" => Some(BalanceOpKind::Usage),
            "refund" => Some(BalanceOpKind::Refund),
            "admin_topup" => Some(BalanceOpKind::AdminTopup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub display_name: Option<String>,
    pub language: String,
    pub balance: Usd,
    pub model_id: String,
    pub custom_prompt: Option<String>,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: i64, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            display_name: None,
            language: "en".to_string(),
            balance: Usd::ZERO,
            model_id: model_id.into(),
            custom_prompt: None,
            total_messages: 0,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: i64,
    pub kind: ChatKind,
    pub is_forum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    /// External forum topic id; 0 for private chats and the main thread.
    pub topic_id: i64,
    pub title: Option<String>,
    pub files_context: Option<String>,
    pub needs_topic_naming: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub thread_id: i64,
    pub role: Role,
    pub text: String,
    /// JSON array of attachment descriptors (file ids, kinds).
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Verbatim provider thinking blocks; opaque, never normalized.
    pub thinking_json: Option<serde_json::Value>,
    #[serde(default)]
    pub edit_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFile {
    /// Provider Files API id.
    pub file_id: String,
    /// Transport (Telegram) file id, used for re-download.
    pub chat_file_id: String,
    pub thread_id: i64,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub kind: FileKind,
    pub mime: String,
    pub size: i64,
    pub expires_at: DateTime<Utc>,
    pub source: FileSource,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl UserFile {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: Option<i64>,
    pub tool_name: String,
    pub model_id: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub cost: Usd,
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceOperation {
    pub id: String,
    pub user_id: i64,
    pub kind: BalanceOpKind,
    /// Signed: negative for usage, positive for payments/refunds.
    pub amount: Usd,
    pub balance_before: Usd,
    pub balance_after: Usd,
    pub related_payment: Option<String>,
    pub related_message_id: Option<i64>,
    pub admin_user_id: Option<i64>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl BalanceOperation {
    /// The ledger invariant every row must satisfy.
    pub fn is_consistent(&self) -> bool {
        self.balance_before + self.amount == self.balance_after
    }
}
