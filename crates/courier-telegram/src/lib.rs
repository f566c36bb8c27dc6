//! Telegram adapter: inbound update handling, per-thread batching with
//! upload synchronization, concurrency limiting, cancellation, streaming
//! display with truncation, the media ingestion pipeline, and the batch
//! processor that drives the turn loop end to end.

pub mod delivery;
pub mod display;
pub mod format;
pub mod generation;
pub mod handler;
pub mod limiter;
pub mod markdown;
pub mod media;
pub mod process;
pub mod queue;
pub mod streaming;
pub mod topic_naming;
pub mod truncate;
pub mod typing;
pub mod uploads;

pub use process::AppContext;
pub use queue::{BatchHandler, InboundMessage, MessageQueueManager};
