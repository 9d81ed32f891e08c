use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapters::store::TradeStore;
use crate::domain::{Dispute, DisputeStatus, Order, OrderKind, OrderStatus, PendingPayment, TradeParty};
use crate::error::{EngineError, Result};

/// PostgreSQL storage adapter.
///
/// One table per entity; every mutation is a single atomic statement. All
/// order writes happen under the per-order lock, so full-row saves cannot
/// interleave.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TradeStore for PostgresStore {
    // ==================== Orders ====================

    async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, kind, status, creator_id, buyer_id, seller_id, amount, fee,
                fiat_code, fiat_amount, min_amount, max_amount, payment_method,
                price_margin, price_from_api, community_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(order.id)
        .bind(order.kind.as_str())
        .bind(order.status.as_str())
        .bind(order.creator_id)
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(order.amount)
        .bind(order.fee)
        .bind(&order.fiat_code)
        .bind(order.fiat_amount)
        .bind(order.min_amount)
        .bind(order.max_amount)
        .bind(&order.payment_method)
        .bind(order.price_margin)
        .bind(order.price_from_api)
        .bind(&order.community_id)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        debug!(order_id = %order.id, kind = %order.kind, "order inserted");
        Ok(())
    }

    /// Persist every mutable column in one atomic statement
    async fn save_order(&self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = $2, buyer_id = $3, seller_id = $4, amount = $5, fee = $6,
                fiat_amount = $7, min_amount = $8, max_amount = $9,
                price_from_api = $10, hash = $11, secret = $12, buyer_invoice = $13,
                taken_at = $14, invoice_held_at = $15,
                buyer_cooperative_cancel = $16, seller_cooperative_cancel = $17,
                is_disputing = $18, buyer_dispute_token = $19, seller_dispute_token = $20,
                previous_dispute_status = $21, canceled_by = $22, action_by = $23,
                is_frozen = $24, fee_credited = $25
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(order.amount)
        .bind(order.fee)
        .bind(order.fiat_amount)
        .bind(order.min_amount)
        .bind(order.max_amount)
        .bind(order.price_from_api)
        .bind(&order.hash)
        .bind(&order.secret)
        .bind(&order.buyer_invoice)
        .bind(order.taken_at)
        .bind(order.invoice_held_at)
        .bind(order.buyer_cooperative_cancel)
        .bind(order.seller_cooperative_cancel)
        .bind(order.is_disputing)
        .bind(order.buyer_dispute_token)
        .bind(order.seller_dispute_token)
        .bind(order.previous_dispute_status.map(|s| s.as_str()))
        .bind(order.canceled_by)
        .bind(order.action_by)
        .bind(order.is_frozen)
        .bind(order.fee_credited)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::OrderNotFound(order.id));
        }
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| order_from_row(&r)).transpose()
    }

    async fn get_order_by_hash(&self, hash: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| order_from_row(&r)).transpose()
    }

    /// Orders sitting in `status` whose `taken_at` is older than `cutoff`
    async fn find_stale_orders(
        &self,
        status: OrderStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status = $1 AND taken_at IS NOT NULL AND taken_at < $2
            ORDER BY taken_at ASC
            "#,
        )
        .bind(status.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    /// In-progress orders whose escrow has been held since before `cutoff`
    async fn find_held_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status IN ('ACTIVE', 'FIAT_SENT', 'DISPUTE')
              AND invoice_held_at IS NOT NULL AND invoice_held_at < $1
            ORDER BY invoice_held_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    /// Orders with an outstanding hold invoice whose subscription must be
    /// live (reconciliation input after a restart)
    async fn find_escrow_watched(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE hash IS NOT NULL
              AND status IN ('WAITING_PAYMENT', 'ACTIVE', 'FIAT_SENT', 'DISPUTE')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    /// Completed community orders whose fee has not been aggregated yet
    async fn find_uncredited_community_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status = 'SUCCESS' AND community_id IS NOT NULL AND fee_credited = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    // ==================== Disputes ====================

    async fn insert_dispute(&self, dispute: &Dispute) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO disputes (
                id, order_id, buyer_id, seller_id, solver_id, initiator, status,
                community_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(dispute.id)
        .bind(dispute.order_id)
        .bind(dispute.buyer_id)
        .bind(dispute.seller_id)
        .bind(dispute.solver_id)
        .bind(dispute.initiator.as_str())
        .bind(dispute.status.as_str())
        .bind(&dispute.community_id)
        .bind(dispute.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dispute(&self, id: Uuid) -> Result<Option<Dispute>> {
        let row = sqlx::query("SELECT * FROM disputes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| dispute_from_row(&r)).transpose()
    }

    async fn get_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>> {
        let row = sqlx::query("SELECT * FROM disputes WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| dispute_from_row(&r)).transpose()
    }

    /// First-claim-wins solver assignment: a single conditional update so a
    /// losing claim observes the winner instead of overwriting it. Returns
    /// the dispute iff this call won.
    async fn claim_dispute(&self, id: Uuid, solver_id: i64) -> Result<Option<Dispute>> {
        let row = sqlx::query(
            r#"
            UPDATE disputes
            SET solver_id = $2, status = 'IN_PROGRESS'
            WHERE id = $1 AND solver_id IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(solver_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| dispute_from_row(&r)).transpose()
    }

    async fn set_dispute_status(&self, id: Uuid, status: DisputeStatus) -> Result<()> {
        sqlx::query("UPDATE disputes SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_dispute_status_by_order(
        &self,
        order_id: Uuid,
        status: DisputeStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE disputes SET status = $2 WHERE order_id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Pending payments ====================

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
    ) -> Result<PendingPayment> {
        let row = sqlx::query(
            r#"
            INSERT INTO pending_payments (
                order_id, community_id, user_id, amount, payment_request, hash, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(community_id)
        .bind(user_id)
        .bind(amount)
        .bind(payment_request)
        .bind(hash)
        .bind(last_error)
        .fetch_one(&self.pool)
        .await?;

        pending_payment_from_row(&row)
    }

    /// The unpaid record for an order, if one exists (at most one is ever
    /// created per order)
    async fn find_open_payment_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<PendingPayment>> {
        let row = sqlx::query(
            "SELECT * FROM pending_payments WHERE order_id = $1 AND paid = FALSE",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pending_payment_from_row(&r)).transpose()
    }

    /// Unpaid records still under the attempt bound
    async fn find_payable(&self, max_attempts: u32) -> Result<Vec<PendingPayment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_payments
            WHERE paid = FALSE AND attempts < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(max_attempts as i32)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_payment_from_row).collect()
    }

    /// Increment persisted before the attempt so the bound holds across
    /// crashes; returns the new count
    async fn increment_payment_attempts(&self, id: i64) -> Result<i32> {
        let row = sqlx::query(
            "UPDATE pending_payments SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("attempts"))
    }

    async fn record_payment_failure(&self, id: i64, last_error: &str) -> Result<()> {
        sqlx::query("UPDATE pending_payments SET last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(last_error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_payment_paid(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pending_payments SET paid = TRUE, paid_at = NOW(), last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Users ====================

    async fn ensure_user(&self, id: i64) -> Result<()> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_user_banned(&self, id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT banned FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("banned")).unwrap_or(false))
    }

    /// Bump a user's lifetime dispute counter; returns the new count
    async fn add_user_dispute(&self, id: i64) -> Result<i32> {
        self.ensure_user(id).await?;
        let row = sqlx::query(
            "UPDATE users SET disputes = disputes + 1 WHERE id = $1 RETURNING disputes",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("disputes"))
    }

    async fn ban_user(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET banned = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Communities ====================

    /// Aggregate fee revenue into a community's earnings balance and mark
    /// the order's fee as credited, each step individually atomic
    async fn credit_community_order(&self, order: &Order) -> Result<()> {
        let Some(community_id) = order.community_id.as_deref() else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO communities (id, earnings, orders_to_redeem)
            VALUES ($1, $2, 1)
            ON CONFLICT (id) DO UPDATE SET
                earnings = communities.earnings + EXCLUDED.earnings,
                orders_to_redeem = communities.orders_to_redeem + 1
            "#,
        )
        .bind(community_id)
        .bind(order.fee)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE orders SET fee_credited = TRUE WHERE id = $1")
            .bind(order.id)
            .execute(&self.pool)
            .await?;

        debug!(order_id = %order.id, community_id, fee = order.fee, "community fee credited");
        Ok(())
    }
}

fn parse_status(s: &str) -> Result<OrderStatus> {
    OrderStatus::try_from(s).map_err(EngineError::Internal)
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let previous: Option<String> = row.get("previous_dispute_status");

    Ok(Order {
        id: row.get("id"),
        kind: OrderKind::try_from(kind.as_str()).map_err(EngineError::Internal)?,
        status: parse_status(&status)?,
        creator_id: row.get("creator_id"),
        buyer_id: row.get("buyer_id"),
        seller_id: row.get("seller_id"),
        amount: row.get("amount"),
        fee: row.get("fee"),
        fiat_code: row.get("fiat_code"),
        fiat_amount: row.get("fiat_amount"),
        min_amount: row.get("min_amount"),
        max_amount: row.get("max_amount"),
        payment_method: row.get("payment_method"),
        price_margin: row.get("price_margin"),
        price_from_api: row.get("price_from_api"),
        hash: row.get("hash"),
        secret: row.get("secret"),
        buyer_invoice: row.get("buyer_invoice"),
        taken_at: row.get("taken_at"),
        invoice_held_at: row.get("invoice_held_at"),
        buyer_cooperative_cancel: row.get("buyer_cooperative_cancel"),
        seller_cooperative_cancel: row.get("seller_cooperative_cancel"),
        is_disputing: row.get("is_disputing"),
        buyer_dispute_token: row.get("buyer_dispute_token"),
        seller_dispute_token: row.get("seller_dispute_token"),
        previous_dispute_status: previous.as_deref().map(parse_status).transpose()?,
        canceled_by: row.get("canceled_by"),
        action_by: row.get("action_by"),
        is_frozen: row.get("is_frozen"),
        fee_credited: row.get("fee_credited"),
        community_id: row.get("community_id"),
        created_at: row.get("created_at"),
    })
}

fn dispute_from_row(row: &PgRow) -> Result<Dispute> {
    let initiator: String = row.get("initiator");
    let status: String = row.get("status");

    Ok(Dispute {
        id: row.get("id"),
        order_id: row.get("order_id"),
        buyer_id: row.get("buyer_id"),
        seller_id: row.get("seller_id"),
        solver_id: row.get("solver_id"),
        initiator: match initiator.as_str() {
            "buyer" => TradeParty::Buyer,
            "seller" => TradeParty::Seller,
            other => {
                return Err(EngineError::Internal(format!(
                    "unknown dispute initiator: {other}"
                )))
            }
        },
        status: DisputeStatus::try_from(status.as_str()).map_err(EngineError::Internal)?,
        community_id: row.get("community_id"),
        created_at: row.get("created_at"),
    })
}

fn pending_payment_from_row(row: &PgRow) -> Result<PendingPayment> {
    Ok(PendingPayment {
        id: row.get("id"),
        order_id: row.get("order_id"),
        community_id: row.get("community_id"),
        user_id: row.get("user_id"),
        amount: row.get("amount"),
        payment_request: row.get("payment_request"),
        hash: row.get("hash"),
        attempts: row.get("attempts"),
        paid: row.get("paid"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        paid_at: row.get("paid_at"),
    })
}
