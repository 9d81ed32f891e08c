//! Payment retry engine
//!
//! Owns the `PendingPayment` lifecycle. An outbound payout that fails or
//! cannot be attempted immediately becomes a pending record; the scheduler
//! drives bounded retries. Once the bound is exhausted the record stays
//! terminal-but-unpaid and the administrative payout path is the only
//! remaining route; a trade is never silently dropped.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::TradeStore;
use crate::coordination::{OrderEventBus, OrderLocks};
use crate::domain::{Order, OrderStatus, PendingPayment};
use crate::error::{EngineError, PaymentFailure, Result};
use crate::services::escrow::EscrowOrchestrator;

pub struct PaymentRetryEngine {
    store: Arc<dyn TradeStore>,
    escrow: EscrowOrchestrator,
    events: OrderEventBus,
    locks: OrderLocks,
    max_attempts: u32,
}

impl PaymentRetryEngine {
    pub fn new(
        store: Arc<dyn TradeStore>,
        escrow: EscrowOrchestrator,
        events: OrderEventBus,
        locks: OrderLocks,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            escrow,
            events,
            locks,
            max_attempts,
        })
    }

    /// Create the pending record for an order's buyer payout, unless one
    /// already exists or the node reports the payment in flight. Caller
    /// holds the order lock.
    pub async fn schedule(
        &self,
        order: &Order,
        last_error: Option<&PaymentFailure>,
    ) -> Result<Option<PendingPayment>> {
        let invoice = order
            .buyer_invoice
            .as_deref()
            .ok_or(EngineError::MissingCounterpart {
                order_id: order.id,
                field: "buyer_invoice",
            })?;
        let buyer_id = order.buyer_id.ok_or(EngineError::MissingCounterpart {
            order_id: order.id,
            field: "buyer_id",
        })?;

        // Never a second concurrent record for the same order
        if let Some(existing) = self.store.find_open_payment_for_order(order.id).await? {
            if existing.can_attempt(self.max_attempts) {
                return Ok(Some(existing));
            }
            warn!(
                order_id = %order.id,
                attempts = existing.attempts,
                "payout attempts exhausted; administrative payout required"
            );
            return Ok(None);
        }

        let payout_hash = self.escrow.decode_invoice_hash(invoice).await?;
        if self.escrow.is_payment_in_flight(&payout_hash).await? {
            warn!(order_id = %order.id, "payout already in flight; not scheduling");
            return Ok(None);
        }

        let pending = self
            .store
            .insert_pending_payment(
                Some(order.id),
                None,
                buyer_id,
                order.buyer_payout_amount(),
                invoice,
                &payout_hash,
                last_error.map(|e| e.as_label()),
            )
            .await?;

        info!(order_id = %order.id, amount = pending.amount, "payout scheduled");
        Ok(Some(pending))
    }

    /// One payout attempt against a record whose order the caller has
    /// locked and loaded. Returns true when the payment confirmed.
    pub async fn attempt_with_order(
        &self,
        pending: &PendingPayment,
        order: &mut Order,
    ) -> Result<bool> {
        if !pending.can_attempt(self.max_attempts) {
            warn!(
                order_id = %order.id,
                attempts = pending.attempts,
                "attempt bound reached; skipping"
            );
            return Ok(false);
        }

        // Persisted before paying so the bound holds across crashes
        let attempts = self.store.increment_payment_attempts(pending.id).await?;

        match self
            .escrow
            .pay_invoice(&pending.payment_request, pending.amount)
            .await
        {
            Ok(receipt) => {
                self.store.mark_payment_paid(pending.id).await?;
                info!(
                    order_id = %order.id,
                    fee_paid = receipt.fee_paid_sats,
                    attempts,
                    "payout confirmed"
                );

                // COMPLETED_BY_ADMIN orders stay terminal; only payouts of
                // regular and frozen trades advance the order
                if order.status.can_transition_to(OrderStatus::Success) {
                    let old = order.status;
                    order.transition(OrderStatus::Success)?;
                    self.store.save_order(order).await?;
                    self.events.publish(order.id, old, order.status, None);
                }
                Ok(true)
            }
            Err(failure) => {
                warn!(
                    order_id = %order.id,
                    attempts,
                    class = failure.as_label(),
                    "payout attempt failed"
                );
                self.store
                    .record_payment_failure(pending.id, failure.as_label())
                    .await?;
                Ok(false)
            }
        }
    }

    /// Immediate payout for a just-settled escrow: ensure the record
    /// exists, then attempt once. Caller holds the order lock.
    pub async fn payout_order(&self, order: &mut Order) -> Result<bool> {
        let Some(pending) = self.schedule(order, None).await? else {
            return Ok(false);
        };
        self.attempt_with_order(&pending, order).await
    }

    /// Administrative payout: one attempt outside the bound, for records
    /// the retry path has exhausted. The attempt counter tracks automatic
    /// retries only and stays within its bound; administrative attempts
    /// are not counted against it.
    pub async fn force_payout(&self, order: &mut Order) -> Result<bool> {
        let pending = match self.store.find_open_payment_for_order(order.id).await? {
            Some(p) => p,
            None => match self.schedule(order, None).await? {
                Some(p) => p,
                None => return Ok(false),
            },
        };

        info!(
            order_id = %order.id,
            attempts = pending.attempts,
            "administrative payout attempt"
        );
        match self
            .escrow
            .pay_invoice(&pending.payment_request, pending.amount)
            .await
        {
            Ok(receipt) => {
                self.store.mark_payment_paid(pending.id).await?;
                info!(
                    order_id = %order.id,
                    fee_paid = receipt.fee_paid_sats,
                    "administrative payout confirmed"
                );
                if order.status.can_transition_to(OrderStatus::Success) {
                    let old = order.status;
                    order.transition(OrderStatus::Success)?;
                    self.store.save_order(order).await?;
                    self.events.publish(order.id, old, order.status, None);
                }
                Ok(true)
            }
            Err(failure) => {
                self.store
                    .record_payment_failure(pending.id, failure.as_label())
                    .await?;
                Err(failure.into())
            }
        }
    }

    /// Scheduler entry point: retry every payable record, locking each
    /// order for the duration of its attempt.
    pub async fn run_pending(&self) -> Result<()> {
        let payable = self.store.find_payable(self.max_attempts).await?;
        if payable.is_empty() {
            return Ok(());
        }
        info!(count = payable.len(), "retrying pending payments");

        for pending in payable {
            if let Err(e) = self.retry_one(&pending).await {
                error!(payment_id = pending.id, "pending payment retry failed: {e}");
            }
        }
        Ok(())
    }

    async fn retry_one(&self, pending: &PendingPayment) -> Result<()> {
        match pending.order_id {
            Some(order_id) => {
                let _guard = self.locks.lock(order_id).await;
                let Some(mut order) = self.store.get_order(order_id).await? else {
                    warn!(payment_id = pending.id, %order_id, "order vanished; skipping payout");
                    return Ok(());
                };
                // Re-read under the lock: another flow may have paid it
                let Some(current) = self.store.find_open_payment_for_order(order_id).await? else {
                    return Ok(());
                };
                self.attempt_with_order(&current, &mut order).await?;
            }
            None => {
                // Community earnings withdrawal: no order to advance
                let attempts = self.store.increment_payment_attempts(pending.id).await?;
                match self
                    .escrow
                    .pay_invoice(&pending.payment_request, pending.amount)
                    .await
                {
                    Ok(_) => {
                        self.store.mark_payment_paid(pending.id).await?;
                        info!(payment_id = pending.id, attempts, "community payout confirmed");
                    }
                    Err(failure) => {
                        self.store
                            .record_payment_failure(pending.id, failure.as_label())
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockLightningNode, MockTradeStore, PaymentReceipt};
    use crate::config::{LndConfig, TradeConfig};
    use crate::domain::{NewOrder, OrderKind};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

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

    fn lnd_config() -> LndConfig {
        LndConfig {
            rest_url: "https://localhost:8080".to_string(),
            macaroon_hex: "0201".to_string(),
            invoice_expiry_secs: 3600,
            payment_timeout_secs: 5,
        }
    }

    fn retry_with(store: MockTradeStore, node: MockLightningNode) -> Arc<PaymentRetryEngine> {
        let escrow = EscrowOrchestrator::new(Arc::new(node), &lnd_config(), &trade_config());
        PaymentRetryEngine::new(
            Arc::new(store),
            escrow,
            OrderEventBus::default(),
            OrderLocks::new(),
            3,
        )
    }

    fn paid_hold_order() -> Order {
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
        order.fee = 300;
        order.seller_id = Some(1);
        order.buyer_id = Some(2);
        order.buyer_invoice = Some("lnbc500u1pjexamplelongenoughrequest".to_string());
        order.transition(OrderStatus::WaitingPayment).unwrap();
        order.transition(OrderStatus::Active).unwrap();
        order.transition(OrderStatus::FiatSent).unwrap();
        order.transition(OrderStatus::PaidHoldInvoice).unwrap();
        order
    }

    fn open_record(order_id: Uuid, attempts: i32) -> PendingPayment {
        PendingPayment {
            id: 7,
            order_id: Some(order_id),
            community_id: None,
            user_id: 2,
            amount: 49_700,
            payment_request: "lnbc500u1pjexamplelongenoughrequest".to_string(),
            hash: "aa".repeat(32),
            attempts,
            paid: false,
            last_error: Some("TIMEOUT".to_string()),
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn test_retry_after_timeout_reuses_existing_record() {
        let mut order = paid_hold_order();
        let record = open_record(order.id, 1);

        let mut store = MockTradeStore::new();
        {
            let record = record.clone();
            store
                .expect_find_open_payment_for_order()
                .returning(move |_| Ok(Some(record.clone())));
        }
        // One record per order, ever: a retry after a timed-out attempt
        // must not create a second one
        store.expect_insert_pending_payment().times(0);
        store
            .expect_increment_payment_attempts()
            .times(1)
            .returning(|_| Ok(2));
        store.expect_mark_payment_paid().times(1).returning(|_| Ok(()));
        store
            .expect_save_order()
            .times(1)
            .withf(|o| o.status == OrderStatus::Success)
            .returning(|_| Ok(()));

        let mut node = MockLightningNode::new();
        node.expect_send_payment().times(1).returning(|_, _, _, _| {
            Ok(PaymentReceipt {
                fee_paid_sats: 2,
                preimage: "33".repeat(32),
            })
        });

        let retry = retry_with(store, node);
        assert!(retry.payout_order(&mut order).await.unwrap());
    }

    #[tokio::test]
    async fn test_force_payout_does_not_consume_retry_attempts() {
        let mut order = paid_hold_order();
        let record = open_record(order.id, 3);

        let mut store = MockTradeStore::new();
        {
            let record = record.clone();
            store
                .expect_find_open_payment_for_order()
                .returning(move |_| Ok(Some(record.clone())));
        }
        // The counter tracks automatic retries only; an administrative
        // attempt leaves it at the bound
        store.expect_increment_payment_attempts().times(0);
        store.expect_mark_payment_paid().times(1).returning(|_| Ok(()));
        store
            .expect_save_order()
            .times(1)
            .withf(|o| o.status == OrderStatus::Success)
            .returning(|_| Ok(()));

        let mut node = MockLightningNode::new();
        node.expect_send_payment().times(1).returning(|_, _, _, _| {
            Ok(PaymentReceipt {
                fee_paid_sats: 1,
                preimage: "44".repeat(32),
            })
        });

        let retry = retry_with(store, node);
        assert!(retry.force_payout(&mut order).await.unwrap());
    }

    #[tokio::test]
    async fn test_attempt_skipped_once_bound_reached() {
        let mut order = paid_hold_order();
        let record = open_record(order.id, 3);

        let mut store = MockTradeStore::new();
        store.expect_increment_payment_attempts().times(0);

        let retry = retry_with(store, MockLightningNode::new());
        assert!(!retry.attempt_with_order(&record, &mut order).await.unwrap());
    }
}
