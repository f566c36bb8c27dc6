//! Balance accounting and admission policy.
//!
//! Every balance mutation goes through `BalanceService::apply`, which
//! writes the new balance and its ledger row in one transaction so the
//! `before + amount == after` invariant is checkable by replay.
//! `BalancePolicy` is the read side: cache-first, database fallback,
//! fail-open when neither can answer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use courier_cache::keys::{user_key, USER_TTL};
use courier_cache::CacheClient;
use courier_core::{Result, Usd};

use crate::db::Database;
use crate::models::{BalanceOpKind, BalanceOperation, User};
use crate::repo::{balance_ops, users};

pub struct BalanceService {
    db: Arc<Database>,
    cache: Arc<CacheClient>,
}

impl BalanceService {
    pub fn new(db: Arc<Database>, cache: Arc<CacheClient>) -> Self {
        Self { db, cache }
    }

    /// Charge `cost` (a positive amount) against the user for one turn.
    pub async fn charge(
        &self,
        user_id: i64,
        cost: Usd,
        description: String,
        related_message_id: Option<i64>,
    ) -> Result<BalanceOperation> {
        self.apply(
            user_id,
            BalanceOpKind::Usage,
            -cost,
            description,
            related_message_id,
            None,
        )
        .await
    }

    /// Credit a positive amount (payment, refund, admin top-up).
    pub async fn credit(
        &self,
        user_id: i64,
        kind: BalanceOpKind,
        amount: Usd,
        description: String,
        admin_user_id: Option<i64>,
    ) -> Result<BalanceOperation> {
        self.apply(user_id, kind, amount, description, None, admin_user_id)
            .await
    }

    async fn apply(
        &self,
        user_id: i64,
        kind: BalanceOpKind,
        signed_amount: Usd,
        description: String,
        related_message_id: Option<i64>,
        admin_user_id: Option<i64>,
    ) -> Result<BalanceOperation> {
        let op = self
            .db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let user =
                    users::get(&tx, user_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                let before = user.balance;
                let after = before + signed_amount;
                let op = BalanceOperation {
                    id: Uuid::new_v4().to_string(),
                    user_id,
                    kind,
                    amount: signed_amount,
                    balance_before: before,
                    balance_after: after,
                    related_payment: None,
                    related_message_id,
                    admin_user_id,
                    description,
                    created_at: Utc::now(),
                };
                balance_ops::insert(&tx, &op)?;
                users::set_balance(&tx, user_id, after)?;
                tx.commit()?;
                Ok(op)
            })
            .await?;

        // The cached user is stale now; drop it so the next read refreshes.
        self.cache.delete(&user_key(user_id)).await;

        info!(
            user_id,
            kind = op.kind.as_str(),
            amount = %op.amount,
            balance_after = %op.balance_after,
            "balance operation applied"
        );
        Ok(op)
    }
}

/// Result of an admission check.
#[derive(Debug, Clone)]
pub struct BalanceCheck {
    pub allowed: bool,
    pub balance: Usd,
    /// "cache", "database", or "unknown" (fail-open).
    pub source: &'static str,
    pub reason: Option<&'static str>,
}

pub struct BalancePolicy {
    db: Arc<Database>,
    cache: Arc<CacheClient>,
    /// A new request needs balance strictly above this.
    min_balance_for_request: Usd,
    /// Paid tools need balance at or above this (zero: non-negative).
    min_balance_for_tools: Usd,
}

impl BalancePolicy {
    pub fn new(db: Arc<Database>, cache: Arc<CacheClient>, min_balance_for_request: Usd) -> Self {
        Self {
            db,
            cache,
            min_balance_for_request,
            min_balance_for_tools: Usd::ZERO,
        }
    }

    async fn cached_user(&self, user_id: i64) -> Option<User> {
        self.cache.get_json::<User>(&user_key(user_id)).await
    }

    async fn db_user(&self, user_id: i64) -> Result<Option<User>> {
        self.db.with_conn(move |conn| users::get(conn, user_id)).await
    }

    /// Can the user start a new request? Strict `>` on the threshold: a
    /// balance exactly at the minimum is rejected. With the default
    /// threshold of zero this permits one overshoot into negative, because
    /// the gate runs before the turn's charge lands.
    pub async fn can_make_request(&self, user_id: i64) -> BalanceCheck {
        if let Some(user) = self.cached_user(user_id).await {
            let allowed = user.balance > self.min_balance_for_request;
            return BalanceCheck {
                allowed,
                balance: user.balance,
                source: "cache",
                reason: (!allowed).then_some("insufficient balance"),
            };
        }

        match self.db_user(user_id).await {
            Ok(Some(user)) => {
                // Refill the cache on the way out.
                self.cache
                    .set_json_with_ttl(&user_key(user_id), &user, USER_TTL)
                    .await;
                let allowed = user.balance > self.min_balance_for_request;
                BalanceCheck {
                    allowed,
                    balance: user.balance,
                    source: "database",
                    reason: (!allowed).then_some("insufficient balance"),
                }
            }
            Ok(None) => BalanceCheck {
                allowed: true,
                balance: Usd::ZERO,
                source: "database",
                reason: Some("new user"),
            },
            Err(e) => {
                // Fail open: the turn re-checks before charging.
                warn!(user_id, error = %e, "balance check failed, admitting");
                BalanceCheck {
                    allowed: true,
                    balance: Usd::ZERO,
                    source: "unknown",
                    reason: Some("fail-open"),
                }
            }
        }
    }

    /// Can the user run a paid tool right now? `>=` on zero: a balance of
    /// exactly 0 is allowed.
    pub async fn can_use_paid_tool(&self, user_id: i64) -> bool {
        if let Some(user) = self.cached_user(user_id).await {
            return user.balance >= self.min_balance_for_tools;
        }
        match self.db_user(user_id).await {
            Ok(Some(user)) => user.balance >= self.min_balance_for_tools,
            Ok(None) => true,
            Err(e) => {
                warn!(user_id, error = %e, "paid-tool check failed, admitting");
                true
            }
        }
    }

    pub async fn get_balance(&self, user_id: i64) -> Usd {
        if let Some(user) = self.cached_user(user_id).await {
            return user.balance;
        }
        match self.db_user(user_id).await {
            Ok(Some(user)) => user.balance,
            _ => Usd::ZERO,
        }
    }
}

/// Consistency check over a user's full ledger: every row satisfies the
/// invariant and replaying amounts reproduces the stored balance.
pub async fn verify_ledger(db: &Database, user_id: i64) -> Result<bool> {
    db.with_conn(move |conn| {
        let ops = balance_ops::for_user_chronological(conn, user_id)?;
        if !ops.iter().all(|op| op.is_consistent()) {
            return Ok(false);
        }
        let replayed = balance_ops::replay_balance(conn, user_id)?;
        let user = users::get(conn, user_id)?;
        Ok(match user {
            Some(u) => u.balance == replayed,
            None => ops.is_empty(),
        })
    })
    .await
}
