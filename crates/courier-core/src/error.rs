use rust_decimal::Decimal;
use thiserror::Error;

/// Log severity for an error. Mapped to `tracing` levels at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Error,
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Rate limited by provider (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Failed to connect to provider API: {0}")]
    ApiConnection(String),

    #[error("Provider API request timed out: {0}")]
    ApiTimeout(String),

    #[error("Provider overloaded (529)")]
    Overloaded,

    #[error("Context window exceeded: {tokens_used} > {tokens_limit}")]
    ContextWindowExceeded {
        tokens_used: u32,
        tokens_limit: u32,
    },

    #[error("Insufficient balance: {balance} (estimated cost {estimated_cost})")]
    InsufficientBalance {
        balance: Decimal,
        estimated_cost: Decimal,
    },

    #[error("Invalid or unsupported model: {0}")]
    InvalidModel(String),

    #[error("Concurrency limit for user {user_id}: position {queue_position}, waited {waited_ms}ms")]
    ConcurrencyLimit {
        user_id: i64,
        queue_position: usize,
        waited_ms: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Telegram transport error: {0}")]
    Telegram(String),

    #[error("Provider response error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Safe, user-facing message for this error. Never leaks internals.
    pub fn user_message(&self) -> String {
        match self {
            CourierError::RateLimited { .. } => {
                "⏳ Too many requests right now. Please wait a moment and try again.".into()
            }
            CourierError::ApiConnection(_) | CourierError::ApiTimeout(_) => {
                "🔌 Temporary connection problem. Please try again.".into()
            }
            CourierError::Overloaded => {
                "⏳ The model is currently overloaded. Please try again in a minute.".into()
            }
            CourierError::ContextWindowExceeded { .. } => {
                "📏 This conversation is too long for the model. Use /forget to start fresh."
                    .into()
            }
            CourierError::InsufficientBalance { balance, .. } => format!(
                "💰 Insufficient balance (${balance}). Top up to continue."
            ),
            CourierError::InvalidModel(_) => {
                "⚙️ The selected model is not available. Pick another with /model.".into()
            }
            CourierError::ConcurrencyLimit { queue_position, .. } => format!(
                "🚦 You already have requests running (queue position {queue_position}). \
                 Please wait for them to finish."
            ),
            _ => "Something went wrong. Please try again.".into(),
        }
    }

    /// Whether the condition is expected to clear on retry.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CourierError::RateLimited { .. }
                | CourierError::ApiConnection(_)
                | CourierError::ApiTimeout(_)
                | CourierError::Overloaded
                | CourierError::ConcurrencyLimit { .. }
        )
    }

    /// Log level appropriate for this error kind. Transient provider
    /// conditions are warnings; configuration and storage failures are errors.
    pub fn log_level(&self) -> LogLevel {
        match self {
            CourierError::RateLimited { .. }
            | CourierError::ApiConnection(_)
            | CourierError::ApiTimeout(_)
            | CourierError::Overloaded
            | CourierError::ContextWindowExceeded { .. }
            | CourierError::InsufficientBalance { .. }
            | CourierError::ConcurrencyLimit { .. }
            | CourierError::Telegram(_) => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Tool input validation failure.
///
/// Not a system error: the message is fed back to the model as a tool
/// result so it can correct itself. Logged as a warning, never propagated.
#[derive(Debug, Clone)]
pub struct ToolValidationError {
    pub message: String,
    pub tool_name: String,
}

impl ToolValidationError {
    pub fn new(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tool_name: tool_name.into(),
        }
    }
}

impl std::fmt::Display for ToolValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tool_name, self.message)
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recoverable() {
        assert!(CourierError::Overloaded.recoverable());
        assert!(CourierError::RateLimited {
            retry_after_secs: Some(5)
        }
        .recoverable());
        assert!(CourierError::ApiTimeout("read".into()).recoverable());
    }

    #[test]
    fn context_overflow_is_not_recoverable() {
        let err = CourierError::ContextWindowExceeded {
            tokens_used: 250_000,
            tokens_limit: 200_000,
        };
        assert!(!err.recoverable());
        assert_eq!(err.log_level(), LogLevel::Warn);
    }

    #[test]
    fn user_messages_never_empty() {
        let errors = [
            CourierError::Overloaded,
            CourierError::InvalidModel("x".into()),
            CourierError::Internal("boom".into()),
            CourierError::Database("locked".into()),
        ];
        for e in errors {
            assert!(!e.user_message().is_empty());
        }
    }

    #[test]
    fn storage_failures_log_as_error() {
        assert_eq!(
            CourierError::Database("disk".into()).log_level(),
            LogLevel::Error
        );
        assert_eq!(
            CourierError::Telegram("edit".into()).log_level(),
            LogLevel::Warn
        );
    }
}
