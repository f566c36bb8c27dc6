//! Block-structured streaming buffer.
//!
//! Deltas append to typed blocks: consecutive content of the same kind
//! merges into one block, a kind change opens a new block. The formatter
//! renders thinking above text during streaming and text only at the end.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
}

#[derive(Debug, Clone)]
pub struct DisplayBlock {
    pub kind: BlockKind,
    pub content: String,
}

/// Parse mode for outgoing messages. MarkdownV2 is the default; HTML is
/// the legacy mode kept for chats that opted into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    MarkdownV2,
    Html,
}

#[derive(Debug, Default)]
pub struct DisplayManager {
    blocks: Vec<DisplayBlock>,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append content: merges into the last block when the kind matches,
    /// otherwise opens a new block. Empty content is ignored.
    pub fn append(&mut self, kind: BlockKind, content: &str) {
        if content.is_empty() {
            return;
        }
        match self.blocks.last_mut() {
            Some(last) if last.kind == kind => last.content.push_str(content),
            _ => self.blocks.push(DisplayBlock {
                kind,
                content: content.to_string(),
            }),
        }
    }

    pub fn blocks(&self) -> &[DisplayBlock] {
        &self.blocks
    }

    pub fn current_kind(&self) -> Option<BlockKind> {
        self.blocks.last().map(|b| b.kind)
    }

    /// All text content, concatenated.
    pub fn text(&self) -> String {
        self.collect(BlockKind::Text)
    }

    /// All thinking content, concatenated.
    pub fn thinking(&self) -> String {
        self.collect(BlockKind::Thinking)
    }

    fn collect(&self, kind: BlockKind) -> String {
        self.blocks
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.content.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_block() {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Thinking, "hello");
        assert_eq!(dm.blocks().len(), 1);
        assert_eq!(dm.blocks()[0].content, "hello");
    }

    #[test]
    fn same_kind_merges() {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Text, "hello ");
        dm.append(BlockKind::Text, "world");
        assert_eq!(dm.blocks().len(), 1);
        assert_eq!(dm.blocks()[0].content, "hello world");
    }

    #[test]
    fn kind_change_opens_new_block() {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Thinking, "thinking");
        dm.append(BlockKind::Text, "text");
        dm.append(BlockKind::Thinking, "more thinking");
        assert_eq!(dm.blocks().len(), 3);
    }

    #[test]
    fn empty_content_ignored() {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Text, "");
        assert!(dm.is_empty());
        assert_eq!(dm.current_kind(), None);
    }

    #[test]
    fn collectors_filter_by_kind() {
        let mut dm = DisplayManager::new();
        dm.append(BlockKind::Thinking, "t1 ");
        dm.append(BlockKind::Text, "answer one ");
        dm.append(BlockKind::Thinking, "t2");
        dm.append(BlockKind::Text, "answer two");
        assert_eq!(dm.thinking(), "t1 t2");
        assert_eq!(dm.text(), "answer one answer two");
    }

    #[test]
    fn current_kind_tracks_last() {
        let mut dm = DisplayManager::new();
        assert!(dm.current_kind().is_none());
        dm.append(BlockKind::Thinking, "x");
        assert_eq!(dm.current_kind(), Some(BlockKind::Thinking));
        dm.append(BlockKind::Text, "y");
        assert_eq!(dm.current_kind(), Some(BlockKind::Text));
    }
}
