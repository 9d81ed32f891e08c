//! Dispute coordination
//!
//! A dispute pauses the happy path and hands the escrow decision to a
//! human solver. Assignment is first-come-first-served through a single
//! conditional update, so two solvers racing for the same case cannot
//! both win.

use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TradeConfig;
use crate::domain::{Dispute, DisputeStatus, Order, OrderStatus};
use crate::error::{EngineError, Result};
use crate::services::engine::OrderEngine;

/// Result of a solver's claim attempt
#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// This solver won the assignment
    Claimed(Dispute),
    /// Another solver got there first; their assignment is returned
    AlreadyClaimed(Dispute),
}

/// Solver's verdict on a claimed dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// Escrow settled to the buyer side
    Settled,
    /// Escrow canceled back to the seller
    SellerRefunded,
    /// Trade completed through the normal release path; case closed as moot
    Released,
}

pub struct DisputeCoordinator {
    engine: Arc<OrderEngine>,
    dispute_delay_secs: u64,
    max_disputes_before_ban: u32,
}

impl DisputeCoordinator {
    pub fn new(engine: Arc<OrderEngine>, trade: &TradeConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            dispute_delay_secs: trade.dispute_delay_secs,
            max_disputes_before_ban: trade.max_disputes_before_ban,
        })
    }

    /// Either party opens a dispute on a live trade. Both parties get a
    /// verification token to identify themselves to the solver out of band.
    pub async fn open(&self, order_id: Uuid, user_id: i64) -> Result<Dispute> {
        let store = self.engine.store();
        let _guard = self.engine.locks().lock(order_id).await;
        let mut order = store
            .get_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound(order_id))?;

        let initiator = order
            .party_of(user_id)
            .ok_or(EngineError::NotOrderParty { user_id, order_id })?;

        // Re-opening a disputed order returns the standing case
        if order.is_disputing {
            if let Some(existing) = store.get_dispute_by_order(order_id).await? {
                return Ok(existing);
            }
        }
        if !matches!(order.status, OrderStatus::Active | OrderStatus::FiatSent) {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "dispute",
            });
        }
        self.check_delay(&order)?;

        let buyer_id = order.buyer_id.ok_or(EngineError::MissingCounterpart {
            order_id,
            field: "buyer_id",
        })?;
        let seller_id = order.seller_id.ok_or(EngineError::MissingCounterpart {
            order_id,
            field: "seller_id",
        })?;

        let dispute = Dispute::new(
            order_id,
            buyer_id,
            seller_id,
            initiator,
            order.community_id.clone(),
        );
        store.insert_dispute(&dispute).await?;

        let (buyer_token, seller_token) = verification_tokens();
        order.buyer_dispute_token = Some(buyer_token);
        order.seller_dispute_token = Some(seller_token);
        order.previous_dispute_status = Some(order.status);
        order.is_disputing = true;
        order.action_by = Some(user_id);

        let old = order.status;
        order.transition(OrderStatus::Dispute)?;
        store.save_order(&order).await?;
        self.engine
            .events()
            .publish(order_id, old, OrderStatus::Dispute, Some(user_id));

        self.bump_counters(&order, buyer_id, seller_id).await?;

        info!(
            order_id = %order_id,
            dispute_id = %dispute.id,
            initiator = initiator.as_str(),
            "dispute opened"
        );
        Ok(dispute)
    }

    fn check_delay(&self, order: &Order) -> Result<()> {
        let taken_at = order.taken_at.ok_or(EngineError::MissingCounterpart {
            order_id: order.id,
            field: "taken_at",
        })?;
        let elapsed = (chrono::Utc::now() - taken_at).num_seconds().max(0) as u64;
        if elapsed < self.dispute_delay_secs {
            return Err(EngineError::DisputeTooEarly(
                self.dispute_delay_secs - elapsed,
            ));
        }
        Ok(())
    }

    /// Repeat offenders are banned platform-wide; community-scoped trades
    /// leave moderation to the community instead.
    async fn bump_counters(&self, order: &Order, buyer_id: i64, seller_id: i64) -> Result<()> {
        let store = self.engine.store();
        for user_id in [buyer_id, seller_id] {
            let count = store.add_user_dispute(user_id).await?;
            if count as u32 >= self.max_disputes_before_ban && order.community_id.is_none() {
                warn!(user_id, disputes = count, "dispute threshold reached; user banned");
                store.ban_user(user_id).await?;
            }
        }
        Ok(())
    }

    /// Solver takes the case. Exactly one claim succeeds per dispute.
    pub async fn claim(&self, dispute_id: Uuid, solver_id: i64) -> Result<ClaimResult> {
        let store = self.engine.store();
        match store.claim_dispute(dispute_id, solver_id).await? {
            Some(dispute) => {
                info!(dispute_id = %dispute_id, solver_id, "dispute claimed");
                Ok(ClaimResult::Claimed(dispute))
            }
            None => {
                let dispute = store
                    .get_dispute(dispute_id)
                    .await?
                    .ok_or(EngineError::DisputeNotFound(dispute_id))?;
                Ok(ClaimResult::AlreadyClaimed(dispute))
            }
        }
    }

    /// Apply the assigned solver's verdict. The escrow movement goes
    /// through the engine's administrative paths; the dispute record's
    /// terminal status is written by those paths.
    pub async fn resolve(
        &self,
        dispute_id: Uuid,
        solver_id: i64,
        outcome: DisputeOutcome,
    ) -> Result<Dispute> {
        let store = self.engine.store();
        let dispute = store
            .get_dispute(dispute_id)
            .await?
            .ok_or(EngineError::DisputeNotFound(dispute_id))?;

        if dispute.status.is_terminal() {
            return Ok(dispute);
        }
        if dispute.solver_id != Some(solver_id) {
            return Err(EngineError::NotOrderParty {
                user_id: solver_id,
                order_id: dispute.order_id,
            });
        }

        match outcome {
            DisputeOutcome::Settled => {
                self.engine.admin_settle(dispute.order_id, solver_id).await?;
            }
            DisputeOutcome::SellerRefunded => {
                self.engine.admin_cancel(dispute.order_id, solver_id).await?;
            }
            DisputeOutcome::Released => {
                let order = store
                    .get_order(dispute.order_id)
                    .await?
                    .ok_or(EngineError::OrderNotFound(dispute.order_id))?;
                if order.status == OrderStatus::Dispute {
                    // The order has not left DISPUTE; the escrow still
                    // needs a verdict
                    return Err(EngineError::InvalidAction {
                        status: order.status,
                        action: "close dispute as released",
                    });
                }
                store
                    .set_dispute_status(dispute_id, DisputeStatus::Released)
                    .await?;
            }
        }

        let resolved = store
            .get_dispute(dispute_id)
            .await?
            .ok_or(EngineError::DisputeNotFound(dispute_id))?;
        info!(
            dispute_id = %dispute_id,
            solver_id,
            status = %resolved.status,
            "dispute resolved"
        );
        Ok(resolved)
    }
}

/// Two distinct per-party tokens, shown to the solver for identification
fn verification_tokens() -> (i32, i32) {
    let mut rng = rand::thread_rng();
    let buyer = rng.gen_range(100_000..1_000_000);
    let mut seller = rng.gen_range(100_000..1_000_000);
    while seller == buyer {
        seller = rng.gen_range(100_000..1_000_000);
    }
    (buyer, seller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockLightningNode, MockTradeStore, PriceFeed, TradeStore};
    use crate::config::LndConfig;
    use crate::coordination::{OrderEventBus, OrderLocks};
    use crate::domain::{NewOrder, OrderKind, TradeParty};
    use crate::services::escrow::EscrowOrchestrator;
    use crate::services::retry::PaymentRetryEngine;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn trade_config() -> TradeConfig {
        TradeConfig {
            hold_invoice_expiration_secs: 86_400,
            order_taken_expiration_secs: 7_200,
            dispute_delay_secs: 1_800,
            max_disputes_before_ban: 8,
            max_payment_attempts: 3,
            max_routing_fee_pct: dec!(0.001),
            min_payment_amount_sats: 100,
            max_payment_amount_sats: 5_000_000,
            fee_rate: dec!(0.006),
        }
    }

    fn coordinator_with(store: MockTradeStore) -> Arc<DisputeCoordinator> {
        let store: Arc<dyn TradeStore> = Arc::new(store);
        let lnd = LndConfig {
            rest_url: "https://localhost:8080".to_string(),
            macaroon_hex: "0201".to_string(),
            invoice_expiry_secs: 3600,
            payment_timeout_secs: 5,
        };
        let escrow =
            EscrowOrchestrator::new(Arc::new(MockLightningNode::new()), &lnd, &trade_config());
        let locks = OrderLocks::new();
        let events = OrderEventBus::default();
        let payouts = PaymentRetryEngine::new(
            Arc::clone(&store),
            escrow.clone(),
            events.clone(),
            locks.clone(),
            3,
        );
        let engine = OrderEngine::new(
            store,
            escrow,
            payouts,
            PriceFeed::new("https://localhost", Duration::from_secs(1)).unwrap(),
            locks,
            events,
            trade_config(),
        );
        DisputeCoordinator::new(engine, &trade_config())
    }

    fn disputed_order() -> Order {
        let mut order = Order::from_request(&NewOrder {
            kind: OrderKind::Sell,
            creator_id: 1,
            amount: 50_000,
            fiat_code: "EUR".to_string(),
            fiat_amount: Some(dec!(20)),
            min_amount: None,
            max_amount: None,
            payment_method: "SEPA".to_string(),
            price_margin: Decimal::ZERO,
            community_id: None,
        });
        order.seller_id = Some(1);
        order.buyer_id = Some(2);
        order.hash = Some("ab".repeat(32));
        order.secret = Some("cd".repeat(32));
        order.taken_at = Some(Utc::now());
        order.transition(OrderStatus::WaitingPayment).unwrap();
        order.transition(OrderStatus::Active).unwrap();
        order.transition(OrderStatus::Dispute).unwrap();
        order.is_disputing = true;
        order
    }

    fn claimed_case(order: &Order, solver_id: i64) -> Dispute {
        Dispute {
            solver_id: Some(solver_id),
            status: DisputeStatus::InProgress,
            ..Dispute::new(order.id, 2, 1, TradeParty::Buyer, None)
        }
    }

    #[tokio::test]
    async fn test_reopen_returns_standing_case() {
        let order = disputed_order();
        let existing = claimed_case(&order, 99);

        let mut store = MockTradeStore::new();
        {
            let order = order.clone();
            store
                .expect_get_order()
                .returning(move |_| Ok(Some(order.clone())));
        }
        {
            let existing = existing.clone();
            store
                .expect_get_dispute_by_order()
                .times(1)
                .returning(move |_| Ok(Some(existing.clone())));
        }
        store.expect_insert_dispute().times(0);
        store.expect_save_order().times(0);

        let coordinator = coordinator_with(store);
        let dispute = coordinator.open(order.id, 2).await.unwrap();
        assert_eq!(dispute.id, existing.id);
    }

    #[tokio::test]
    async fn test_resolve_released_rejected_while_order_disputed() {
        let order = disputed_order();
        let dispute = claimed_case(&order, 99);

        let mut store = MockTradeStore::new();
        {
            let dispute = dispute.clone();
            store
                .expect_get_dispute()
                .returning(move |_| Ok(Some(dispute.clone())));
        }
        {
            let order = order.clone();
            store
                .expect_get_order()
                .returning(move |_| Ok(Some(order.clone())));
        }
        store.expect_set_dispute_status().times(0);

        let coordinator = coordinator_with(store);
        let err = coordinator
            .resolve(dispute.id, 99, DisputeOutcome::Released)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidAction {
                status: OrderStatus::Dispute,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resolve_released_accepted_once_order_moved_on() {
        let mut order = disputed_order();
        order.transition(OrderStatus::PaidHoldInvoice).unwrap();
        order.is_disputing = false;
        let dispute = claimed_case(&order, 99);

        let resolved = Dispute {
            status: DisputeStatus::Released,
            ..dispute.clone()
        };

        let mut store = MockTradeStore::new();
        let mut seq = mockall::Sequence::new();
        {
            let dispute = dispute.clone();
            store
                .expect_get_dispute()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(Some(dispute.clone())));
        }
        {
            let resolved = resolved.clone();
            store
                .expect_get_dispute()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(Some(resolved.clone())));
        }
        {
            let order = order.clone();
            store
                .expect_get_order()
                .returning(move |_| Ok(Some(order.clone())));
        }
        store
            .expect_set_dispute_status()
            .times(1)
            .withf(|_, status| *status == DisputeStatus::Released)
            .returning(|_, _| Ok(()));

        let coordinator = coordinator_with(store);
        let outcome = coordinator
            .resolve(dispute.id, 99, DisputeOutcome::Released)
            .await
            .unwrap();
        assert_eq!(outcome.status, DisputeStatus::Released);
    }

    #[test]
    fn test_verification_tokens_distinct_six_digits() {
        for _ in 0..64 {
            let (buyer, seller) = verification_tokens();
            assert_ne!(buyer, seller);
            assert!((100_000..1_000_000).contains(&buyer));
            assert!((100_000..1_000_000).contains(&seller));
        }
    }
}
