//! Durable state: SQLite schema, entity models, repositories with upsert
//! semantics, the balance service/policy, and application of write-behind
//! batches.

pub mod balance;
pub mod db;
pub mod flush;
pub mod models;
pub mod repo;

pub use balance::{BalanceCheck, BalancePolicy, BalanceService};
pub use db::Database;
