//! Token-budgeted history selection.
//!
//! Available history budget = window − system − max_output − 10% buffer.
//! Messages are taken newest-first until the next one would overflow, then
//! reversed back to chronological order. A newest message that alone
//! overflows the budget is a hard `ContextWindowExceeded`.

use tracing::debug;

use courier_core::{CourierError, Result};
use courier_store::models::StoredMessage;

use crate::prompt::estimate_tokens;

pub const DEFAULT_BUFFER_PERCENT: f64 = 0.10;

/// Estimated footprint of one stored message: its text plus a flat
/// per-attachment overhead for the file reference block.
fn message_tokens(msg: &StoredMessage) -> u32 {
    estimate_tokens(&msg.text) + (msg.attachments.len() as u32) * 64
}

/// Select the suffix of `messages` (chronological order in, chronological
/// order out) that fits the budget.
pub fn select_history(
    messages: &[StoredMessage],
    context_window: u32,
    system_tokens: u32,
    max_output: u32,
) -> Result<Vec<StoredMessage>> {
    let buffer = (context_window as f64 * DEFAULT_BUFFER_PERCENT) as u32;
    let reserved = system_tokens.saturating_add(max_output).saturating_add(buffer);

    if reserved >= context_window {
        return Err(CourierError::ContextWindowExceeded {
            tokens_used: reserved,
            tokens_limit: context_window,
        });
    }
    let available = context_window - reserved;

    let mut included: Vec<StoredMessage> = Vec::new();
    let mut used: u32 = 0;

    for msg in messages.iter().rev() {
        let tokens = message_tokens(msg);
        if used + tokens > available {
            break;
        }
        used += tokens;
        included.push(msg.clone());
    }

    if included.is_empty() {
        if let Some(newest) = messages.last() {
            return Err(CourierError::ContextWindowExceeded {
                tokens_used: message_tokens(newest),
                tokens_limit: available,
            });
        }
    }

    included.reverse();
    debug!(
        total = messages.len(),
        included = included.len(),
        tokens_used = used,
        tokens_available = available,
        "history selected"
    );
    Ok(included)
}
