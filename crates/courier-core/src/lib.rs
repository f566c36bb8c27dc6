//! Shared foundation for the courier workspace: configuration, error
//! taxonomy, money and pricing, token accounting, MIME detection, and the
//! in-process metrics recording surface.

pub mod config;
pub mod error;
pub mod metrics;
pub mod mime;
pub mod money;
pub mod pricing;
pub mod usage;

pub use error::{CourierError, Result, ToolValidationError};
pub use money::Usd;
pub use usage::TokenUsage;
