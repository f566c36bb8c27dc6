use serde::{Deserialize, Serialize};

/// Token counts for one provider call (or an accumulated turn).
///
/// Field names mirror the provider usage payload: `cache_read` /
/// `cache_write` are the prompt-cache hit and creation counts. Thinking
/// tokens are billed at the output rate but tracked separately for the
/// charge description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    #[serde(default)]
    pub cache_read: u32,
    #[serde(default)]
    pub cache_write: u32,
    #[serde(default)]
    pub thinking: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.thinking += other.thinking;
    }

    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }
}
