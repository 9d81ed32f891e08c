//! Storage seam consumed by the services layer.
//!
//! Mirrors the seam around the payment node: services talk to the trait,
//! the Postgres adapter implements it, and tests substitute a mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Dispute, DisputeStatus, Order, OrderStatus, PendingPayment};
use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Persist every mutable column of an order in one atomic statement.
    async fn save_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;

    async fn get_order_by_hash(&self, hash: &str) -> Result<Option<Order>>;

    /// Orders sitting in `status` whose `taken_at` is older than `cutoff`.
    async fn find_stale_orders(
        &self,
        status: OrderStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>>;

    /// In-progress orders whose escrow has been held since before `cutoff`.
    async fn find_held_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>>;

    /// Orders with an outstanding hold invoice whose subscription must be
    /// live (reconciliation input after a restart).
    async fn find_escrow_watched(&self) -> Result<Vec<Order>>;

    /// Completed community orders whose fee has not been aggregated yet.
    async fn find_uncredited_community_orders(&self) -> Result<Vec<Order>>;

    async fn insert_dispute(&self, dispute: &Dispute) -> Result<()>;

    async fn get_dispute(&self, id: Uuid) -> Result<Option<Dispute>>;

    async fn get_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>>;

    /// First-claim-wins solver assignment; returns the dispute iff this
    /// call won.
    async fn claim_dispute(&self, id: Uuid, solver_id: i64) -> Result<Option<Dispute>>;

    async fn set_dispute_status(&self, id: Uuid, status: DisputeStatus) -> Result<()>;

    async fn set_dispute_status_by_order(
        &self,
        order_id: Uuid,
        status: DisputeStatus,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_pending_payment<'a>(
        &self,
        order_id: Option<Uuid>,
        community_id: Option<&'a str>,
        user_id: i64,
        amount: i64,
        payment_request: &'a str,
        hash: &'a str,
        last_error: Option<&'a str>,
    ) -> Result<PendingPayment>;

    /// The unpaid record for an order, if one exists (at most one is ever
    /// created per order).
    async fn find_open_payment_for_order(&self, order_id: Uuid)
        -> Result<Option<PendingPayment>>;

    /// Unpaid records still under the attempt bound.
    async fn find_payable(&self, max_attempts: u32) -> Result<Vec<PendingPayment>>;

    /// Increment persisted before the attempt so the bound holds across
    /// crashes; returns the new count.
    async fn increment_payment_attempts(&self, id: i64) -> Result<i32>;

    async fn record_payment_failure(&self, id: i64, last_error: &str) -> Result<()>;

    async fn mark_payment_paid(&self, id: i64) -> Result<()>;

    async fn ensure_user(&self, id: i64) -> Result<()>;

    async fn is_user_banned(&self, id: i64) -> Result<bool>;

    /// Bump a user's lifetime dispute counter; returns the new count.
    async fn add_user_dispute(&self, id: i64) -> Result<i32>;

    async fn ban_user(&self, id: i64) -> Result<()>;

    /// Aggregate fee revenue into a community's earnings balance and mark
    /// the order's fee as credited.
    async fn credit_community_order(&self, order: &Order) -> Result<()>;
}
