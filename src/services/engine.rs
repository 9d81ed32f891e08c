//! Order state machine
//!
//! The single authority for what is allowed to happen next to a trade.
//! Every mutation path — user action, invoice event, admin command —
//! acquires the per-order lock, re-reads the order, validates the move
//! against the central transition table, persists, and publishes one
//! order-changed event.

use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{InvoiceState, PriceFeed, TradeStore};
use crate::config::TradeConfig;
use crate::coordination::{OrderEventBus, OrderLocks};
use crate::domain::{
    fee_for, market_sats, CoopCancelOutcome, DisputeStatus, NewOrder, Order, OrderKind,
    OrderStatus, TradeParty,
};
use crate::error::{EngineError, Result};
use crate::services::escrow::EscrowOrchestrator;
use crate::services::retry::PaymentRetryEngine;

/// How a cancel request resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Order canceled outright (untaken, or by mutual consent)
    Canceled,
    /// Creator withdrew a taken-but-not-live order
    Closed,
    /// Taker abandoned; order republished for a new counterparty
    Republished,
    /// Requester's cooperative-cancel flag set; counterparty must agree
    CoopInitiated,
    /// Requester had already asked; still waiting for the counterparty
    CoopAlreadyRequested,
}

/// Result of taking an order
#[derive(Debug, Clone)]
pub struct TakeOutcome {
    pub order: Order,
    /// Hold invoice the seller side must pay, when escrow was just created
    pub funding_invoice: Option<String>,
}

pub struct OrderEngine {
    store: Arc<dyn TradeStore>,
    escrow: EscrowOrchestrator,
    payouts: Arc<PaymentRetryEngine>,
    price: PriceFeed,
    locks: OrderLocks,
    events: OrderEventBus,
    trade: TradeConfig,
    /// Hashes with a live subscription task; keeps reconciliation passes
    /// from stacking duplicate watchers on the same invoice
    watched: DashSet<String>,
}

impl OrderEngine {
    pub fn new(
        store: Arc<dyn TradeStore>,
        escrow: EscrowOrchestrator,
        payouts: Arc<PaymentRetryEngine>,
        price: PriceFeed,
        locks: OrderLocks,
        events: OrderEventBus,
        trade: TradeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            escrow,
            payouts,
            price,
            locks,
            events,
            trade,
            watched: DashSet::new(),
        })
    }

    pub fn events(&self) -> &OrderEventBus {
        &self.events
    }

    pub fn locks(&self) -> &OrderLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    /// Validated transition + persist + publish, in that order
    async fn apply(
        &self,
        order: &mut Order,
        to: OrderStatus,
        changed_by: Option<i64>,
    ) -> Result<()> {
        let old = order.status;
        order.transition(to)?;
        self.store.save_order(order).await?;
        self.events.publish(order.id, old, to, changed_by);
        Ok(())
    }

    async fn fetch(&self, order_id: Uuid) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound(order_id))
    }

    // ==================== Publication ====================

    /// Publish a new order in PENDING
    pub async fn create_order(&self, req: NewOrder) -> Result<Order> {
        req.validate()?;

        self.store.ensure_user(req.creator_id).await?;
        if self.store.is_user_banned(req.creator_id).await? {
            return Err(EngineError::UserBanned(req.creator_id));
        }

        if req.amount < 0 {
            return Err(EngineError::AmountOutOfRange {
                amount: req.amount,
                min: self.trade.min_payment_amount_sats,
                max: self.trade.max_payment_amount_sats,
            });
        }
        if req.amount > 0 {
            self.check_amount_bounds(req.amount)?;
        }

        let mut order = Order::from_request(&req);
        if order.amount > 0 {
            // Frozen here, never recomputed
            order.fee = fee_for(order.amount, self.trade.fee_rate);
        }
        self.store.insert_order(&order).await?;

        info!(
            order_id = %order.id,
            kind = %order.kind,
            amount = order.amount,
            fiat = %order.fiat_code,
            "order published"
        );
        Ok(order)
    }

    // ==================== Taking ====================

    /// A counterparty takes a published order. Sell offers move to
    /// WAITING_BUYER_INVOICE; buy offers get their escrow created and move
    /// to WAITING_PAYMENT.
    pub async fn take_order(
        self: &Arc<Self>,
        order_id: Uuid,
        taker_id: i64,
        fiat_amount: Option<rust_decimal::Decimal>,
    ) -> Result<TakeOutcome> {
        self.store.ensure_user(taker_id).await?;
        if self.store.is_user_banned(taker_id).await? {
            return Err(EngineError::UserBanned(taker_id));
        }

        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if order.status != OrderStatus::Pending {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "take",
            });
        }
        if order.creator_id == taker_id {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "take own order",
            });
        }

        if let (Some(min), Some(max)) = (order.min_amount, order.max_amount) {
            let chosen = fiat_amount.ok_or_else(|| {
                EngineError::FiatAmountOutOfRange(rust_decimal::Decimal::ZERO)
            })?;
            if chosen < min || chosen > max {
                return Err(EngineError::FiatAmountOutOfRange(chosen));
            }
            order.fiat_amount = Some(chosen);
        }

        self.resolve_amount(&mut order).await?;

        order.taken_at = Some(Utc::now());
        order.action_by = Some(taker_id);

        match order.kind {
            OrderKind::Sell => {
                order.seller_id = Some(order.creator_id);
                order.buyer_id = Some(taker_id);
                self.apply(&mut order, OrderStatus::WaitingBuyerInvoice, Some(taker_id))
                    .await?;
                Ok(TakeOutcome {
                    order,
                    funding_invoice: None,
                })
            }
            OrderKind::Buy => {
                order.buyer_id = Some(order.creator_id);
                order.seller_id = Some(taker_id);

                let ticket = self
                    .escrow
                    .create_hold_invoice(&escrow_memo(&order), order.escrow_amount())
                    .await?;
                order.hash = Some(ticket.hash.clone());
                order.secret = Some(ticket.secret.clone());

                self.apply(&mut order, OrderStatus::WaitingPayment, Some(taker_id))
                    .await?;
                self.watch_invoice(ticket.hash);
                Ok(TakeOutcome {
                    order,
                    funding_invoice: Some(ticket.payment_request),
                })
            }
        }
    }

    /// Resolve a market-priced amount at first use and freeze the fee
    async fn resolve_amount(&self, order: &mut Order) -> Result<()> {
        if order.amount == 0 {
            let fiat = order.fiat_amount.ok_or(EngineError::MissingCounterpart {
                order_id: order.id,
                field: "fiat_amount",
            })?;
            let rate = self.price.rate_per_btc(&order.fiat_code).await?;
            let amount = market_sats(fiat, rate, order.price_margin)
                .ok_or_else(|| EngineError::RateUnavailable(order.fiat_code.clone()))?;
            self.check_amount_bounds(amount)?;
            order.amount = amount;
            debug!(order_id = %order.id, amount, %rate, "market amount resolved");
        }
        if order.fee == 0 {
            order.fee = fee_for(order.amount, self.trade.fee_rate);
        }
        Ok(())
    }

    fn check_amount_bounds(&self, amount: i64) -> Result<()> {
        let (min, max) = (
            self.trade.min_payment_amount_sats,
            self.trade.max_payment_amount_sats,
        );
        if amount < min || amount > max {
            return Err(EngineError::AmountOutOfRange { amount, min, max });
        }
        Ok(())
    }

    // ==================== Buyer invoice ====================

    /// The buyer supplies a payout destination. For sell offers this is
    /// the point the escrow is created; for buy offers the escrow is
    /// already held and the trade goes live.
    pub async fn add_buyer_invoice(
        self: &Arc<Self>,
        order_id: Uuid,
        user_id: i64,
        invoice: String,
    ) -> Result<TakeOutcome> {
        validate_invoice(&invoice)?;

        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if order.party_of(user_id) != Some(TradeParty::Buyer) {
            return Err(EngineError::NotOrderParty { user_id, order_id });
        }
        if order.status != OrderStatus::WaitingBuyerInvoice {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "add invoice",
            });
        }

        order.buyer_invoice = Some(invoice);
        order.action_by = Some(user_id);

        if order.has_escrow() {
            // Buy flow: escrow already held, trade goes live
            self.apply(&mut order, OrderStatus::Active, Some(user_id))
                .await?;
            Ok(TakeOutcome {
                order,
                funding_invoice: None,
            })
        } else {
            // Sell flow: escrow created now for the seller to fund
            let ticket = self
                .escrow
                .create_hold_invoice(&escrow_memo(&order), order.escrow_amount())
                .await?;
            order.hash = Some(ticket.hash.clone());
            order.secret = Some(ticket.secret.clone());

            self.apply(&mut order, OrderStatus::WaitingPayment, Some(user_id))
                .await?;
            self.watch_invoice(ticket.hash);
            Ok(TakeOutcome {
                order,
                funding_invoice: Some(ticket.payment_request),
            })
        }
    }

    // ==================== Trade progress ====================

    /// Buyer declares the fiat payment sent
    pub async fn mark_fiat_sent(&self, order_id: Uuid, user_id: i64) -> Result<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if order.party_of(user_id) != Some(TradeParty::Buyer) {
            return Err(EngineError::NotOrderParty { user_id, order_id });
        }
        if order.status != OrderStatus::Active {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "fiat sent",
            });
        }

        order.action_by = Some(user_id);
        self.apply(&mut order, OrderStatus::FiatSent, Some(user_id))
            .await?;
        Ok(order)
    }

    /// Seller releases the escrow. The status change itself is driven by
    /// the settlement event on the subscription stream.
    pub async fn release(&self, order_id: Uuid, user_id: i64) -> Result<()> {
        let _guard = self.locks.lock(order_id).await;
        let order = self.fetch(order_id).await?;

        if order.party_of(user_id) != Some(TradeParty::Seller) {
            return Err(EngineError::NotOrderParty { user_id, order_id });
        }
        if !order.status.is_trade_in_progress() {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "release",
            });
        }
        let secret = order.secret.as_deref().ok_or(EngineError::MissingCounterpart {
            order_id,
            field: "secret",
        })?;

        self.escrow.settle(secret).await?;
        info!(order_id = %order_id, "escrow release requested");
        Ok(())
    }

    // ==================== Cancellation ====================

    /// Cancel dispatch: unilateral for untaken and not-yet-live orders,
    /// cooperative once the trade is underway.
    pub async fn cancel(&self, order_id: Uuid, user_id: i64) -> Result<CancelResult> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        match order.status {
            OrderStatus::Pending => {
                if !order.is_creator(user_id) {
                    return Err(EngineError::NotOrderParty { user_id, order_id });
                }
                order.canceled_by = Some(user_id);
                self.apply(&mut order, OrderStatus::Canceled, Some(user_id))
                    .await?;
                Ok(CancelResult::Canceled)
            }
            OrderStatus::WaitingPayment | OrderStatus::WaitingBuyerInvoice => {
                let is_creator = order.is_creator(user_id);
                if !is_creator && order.party_of(user_id).is_none() {
                    return Err(EngineError::NotOrderParty { user_id, order_id });
                }

                if let Some(hash) = order.hash.clone() {
                    self.escrow.cancel(&hash).await?;
                }

                if is_creator {
                    order.canceled_by = Some(user_id);
                    self.apply(&mut order, OrderStatus::Closed, Some(user_id))
                        .await?;
                    Ok(CancelResult::Closed)
                } else {
                    self.republish(&mut order, Some(user_id)).await?;
                    Ok(CancelResult::Republished)
                }
            }
            OrderStatus::Active | OrderStatus::FiatSent | OrderStatus::Dispute => {
                let party = order
                    .party_of(user_id)
                    .ok_or(EngineError::NotOrderParty { user_id, order_id })?;
                self.cooperative_cancel(&mut order, party, user_id).await
            }
            status => Err(EngineError::InvalidAction {
                status,
                action: "cancel",
            }),
        }
    }

    /// Two-phase mutual consent: the second flag wins
    async fn cooperative_cancel(
        &self,
        order: &mut Order,
        party: TradeParty,
        user_id: i64,
    ) -> Result<CancelResult> {
        match order.cooperative_cancel_outcome(party) {
            CoopCancelOutcome::AlreadyRequested => Ok(CancelResult::CoopAlreadyRequested),
            CoopCancelOutcome::CounterpartyNotified => {
                match party {
                    TradeParty::Buyer => order.buyer_cooperative_cancel = true,
                    TradeParty::Seller => order.seller_cooperative_cancel = true,
                }
                self.store.save_order(order).await?;
                info!(
                    order_id = %order.id,
                    requester = party.as_str(),
                    "cooperative cancel proposed"
                );
                Ok(CancelResult::CoopInitiated)
            }
            CoopCancelOutcome::CancelNow => {
                if let Some(hash) = order.hash.clone() {
                    self.escrow.cancel(&hash).await?;
                }
                match party {
                    TradeParty::Buyer => order.buyer_cooperative_cancel = true,
                    TradeParty::Seller => order.seller_cooperative_cancel = true,
                }
                order.canceled_by = Some(user_id);
                if order.status == OrderStatus::Dispute {
                    self.store
                        .set_dispute_status_by_order(order.id, DisputeStatus::SellerRefunded)
                        .await?;
                    order.is_disputing = false;
                }
                self.apply(order, OrderStatus::Canceled, Some(user_id))
                    .await?;
                Ok(CancelResult::Canceled)
            }
        }
    }

    /// Clear the taker side and put the offer back on the book. Range
    /// orders also drop their resolved amount and fee so the next take
    /// prices against its own fiat choice.
    async fn republish(&self, order: &mut Order, changed_by: Option<i64>) -> Result<()> {
        order.reset_for_republish();
        self.apply(order, OrderStatus::Pending, changed_by).await?;
        info!(order_id = %order.id, "order republished");
        Ok(())
    }

    // ==================== Invoice event ingress ====================

    /// Spawn the subscription watcher for an outstanding hold invoice.
    /// At most one watcher per hash is ever live; a second call while the
    /// first task runs is a no-op.
    pub fn watch_invoice(self: &Arc<Self>, hash: String) {
        if !self.watched.insert(hash.clone()) {
            debug!(hash = %hash, "invoice already watched");
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.escrow.subscribe(&hash).await {
                Ok(mut rx) => {
                    while let Some(state) = rx.recv().await {
                        let result = match state {
                            InvoiceState::Held => engine.invoice_accepted(&hash).await,
                            InvoiceState::Settled => engine.invoice_settled(&hash).await,
                            // Cancellation transitions are driven by
                            // whichever flow canceled the invoice
                            InvoiceState::Canceled => {
                                debug!(hash = %hash, "invoice canceled");
                                Ok(())
                            }
                            InvoiceState::Open => Ok(()),
                        };
                        if let Err(e) = result {
                            error!(hash = %hash, "invoice event handling failed: {e}");
                        }
                    }
                }
                Err(e) => error!(hash = %hash, "invoice subscription failed: {e}"),
            }
            engine.watched.remove(&hash);
        });
    }

    /// Escrow funds locked ("held"). Goes live, or waits for the buyer's
    /// payout invoice.
    pub async fn invoice_accepted(&self, hash: &str) -> Result<()> {
        let Some(stub) = self.store.get_order_by_hash(hash).await? else {
            warn!(hash = %hash, "held event for unknown order");
            return Ok(());
        };
        let _guard = self.locks.lock(stub.id).await;
        let Some(mut order) = self.store.get_order(stub.id).await? else {
            return Ok(());
        };
        if order.hash.as_deref() != Some(hash) {
            return Ok(());
        }

        match order.status {
            OrderStatus::WaitingPayment => {
                order.invoice_held_at = Some(Utc::now());
                let to = if order.buyer_invoice.is_some() {
                    OrderStatus::Active
                } else {
                    OrderStatus::WaitingBuyerInvoice
                };
                self.apply(&mut order, to, None).await?;
                info!(order_id = %order.id, status = %order.status, "escrow held");
            }
            // Duplicate or replayed event: no effect
            status => debug!(order_id = %order.id, %status, "held event ignored"),
        }
        Ok(())
    }

    /// Escrow settled ("confirmed") after release. Marks the trade paid
    /// and hands the payout to the retry engine.
    pub async fn invoice_settled(&self, hash: &str) -> Result<()> {
        let Some(stub) = self.store.get_order_by_hash(hash).await? else {
            warn!(hash = %hash, "settled event for unknown order");
            return Ok(());
        };
        let _guard = self.locks.lock(stub.id).await;
        let Some(mut order) = self.store.get_order(stub.id).await? else {
            return Ok(());
        };
        if order.hash.as_deref() != Some(hash) {
            return Ok(());
        }
        if order.is_frozen {
            // Settled into platform custody by an admin; the admin flow
            // owns the rest
            debug!(order_id = %order.id, "settled event on frozen order ignored");
            return Ok(());
        }

        if !order.status.is_trade_in_progress() {
            debug!(order_id = %order.id, status = %order.status, "settled event ignored");
            return Ok(());
        }

        if order.status == OrderStatus::Dispute {
            // Completed through the normal release path while disputed
            self.store
                .set_dispute_status_by_order(order.id, DisputeStatus::Released)
                .await?;
            order.is_disputing = false;
        }

        self.apply(&mut order, OrderStatus::PaidHoldInvoice, None)
            .await?;
        info!(order_id = %order.id, "escrow settled; paying buyer");

        if order.buyer_invoice.is_some() {
            if let Err(e) = self.payouts.payout_order(&mut order).await {
                error!(order_id = %order.id, "payout failed: {e}");
            }
        } else {
            warn!(order_id = %order.id, "no payout invoice on settled order");
        }

        self.republish_range_remainder(&order).await;
        Ok(())
    }

    /// A partially taken range order spawns a fresh PENDING order for the
    /// remaining interval once the parent's escrow settles.
    async fn republish_range_remainder(&self, order: &Order) {
        let Some(taken) = order.fiat_amount else { return };
        let Some((min, max)) = order.range_remainder(taken) else {
            return;
        };

        let child = NewOrder {
            kind: order.kind,
            creator_id: order.creator_id,
            amount: 0,
            fiat_code: order.fiat_code.clone(),
            fiat_amount: None,
            min_amount: Some(min),
            max_amount: Some(max),
            payment_method: order.payment_method.clone(),
            price_margin: order.price_margin,
            community_id: order.community_id.clone(),
        };
        match self.create_order(child).await {
            Ok(new_order) => info!(
                parent = %order.id,
                child = %new_order.id,
                %min, %max,
                "range remainder republished"
            ),
            Err(e) => error!(parent = %order.id, "range remainder republish failed: {e}"),
        }
    }

    // ==================== Scheduler-driven expiry ====================

    /// Seller never funded the escrow within the taken-expiration window
    pub(crate) async fn expire_unfunded(&self, order_id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(order_id).await;
        let Some(mut order) = self.store.get_order(order_id).await? else {
            return Ok(());
        };
        if order.status != OrderStatus::WaitingPayment {
            return Ok(());
        }

        if let Some(hash) = order.hash.clone() {
            self.escrow.cancel(&hash).await?;
        }
        self.apply(&mut order, OrderStatus::Expired, None).await?;
        info!(order_id = %order_id, "unfunded order expired");
        Ok(())
    }

    /// Buyer never supplied a payout invoice within the window. A silent
    /// creator forfeits the publication; a silent taker puts it back on
    /// the book.
    pub(crate) async fn expire_abandoned(&self, order_id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(order_id).await;
        let Some(mut order) = self.store.get_order(order_id).await? else {
            return Ok(());
        };
        if order.status != OrderStatus::WaitingBuyerInvoice {
            return Ok(());
        }

        if let Some(hash) = order.hash.clone() {
            self.escrow.cancel(&hash).await?;
            order.hash = None;
            order.secret = None;
        }

        let buyer_is_creator = order.buyer_id == Some(order.creator_id);
        if buyer_is_creator {
            self.apply(&mut order, OrderStatus::Closed, None).await?;
            info!(order_id = %order_id, "abandoned order closed");
        } else {
            self.republish(&mut order, None).await?;
        }
        Ok(())
    }

    /// Escrow held past the absolute hold-invoice window: the HTLC must be
    /// released before the channel force-closes, so the trade is voided
    /// and the seller refunded.
    pub(crate) async fn expire_held(&self, order_id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(order_id).await;
        let Some(mut order) = self.store.get_order(order_id).await? else {
            return Ok(());
        };
        if !order.status.is_trade_in_progress() {
            return Ok(());
        }

        if let Some(hash) = order.hash.clone() {
            self.escrow.cancel(&hash).await?;
        }
        if order.is_disputing {
            self.store
                .set_dispute_status_by_order(order_id, DisputeStatus::SellerRefunded)
                .await?;
            order.is_disputing = false;
        }
        self.apply(&mut order, OrderStatus::HoldInvoiceExpired, None)
            .await?;
        warn!(order_id = %order_id, "hold invoice expired; escrow returned to seller");
        Ok(())
    }

    // ==================== Admin paths ====================

    /// Settle the escrow into platform custody and hold the order
    pub async fn freeze(&self, order_id: Uuid, admin_id: i64) -> Result<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if !order.status.can_transition_to(OrderStatus::Frozen) {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "freeze",
            });
        }
        let secret = order.secret.clone().ok_or(EngineError::MissingCounterpart {
            order_id,
            field: "secret",
        })?;

        self.escrow.settle(&secret).await?;
        order.is_frozen = true;
        order.action_by = Some(admin_id);
        self.apply(&mut order, OrderStatus::Frozen, Some(admin_id))
            .await?;
        info!(order_id = %order_id, admin_id, "order frozen");
        Ok(order)
    }

    /// Cancel the escrow back to the seller and close the order
    pub async fn admin_cancel(&self, order_id: Uuid, admin_id: i64) -> Result<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if !order.status.can_transition_to(OrderStatus::CanceledByAdmin) {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "admin cancel",
            });
        }

        if let Some(hash) = order.hash.clone() {
            if !order.is_frozen {
                self.escrow.cancel(&hash).await?;
            }
        }
        order.canceled_by = Some(admin_id);
        if order.is_disputing {
            self.store
                .set_dispute_status_by_order(order_id, DisputeStatus::SellerRefunded)
                .await?;
            order.is_disputing = false;
        }
        self.apply(&mut order, OrderStatus::CanceledByAdmin, Some(admin_id))
            .await?;
        info!(order_id = %order_id, admin_id, "order canceled by admin");
        Ok(order)
    }

    /// Settle a disputed trade in the buyer's favor
    pub async fn admin_settle(&self, order_id: Uuid, admin_id: i64) -> Result<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if order.status != OrderStatus::Dispute {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "admin settle",
            });
        }
        let secret = order.secret.clone().ok_or(EngineError::MissingCounterpart {
            order_id,
            field: "secret",
        })?;

        self.escrow.settle(&secret).await?;
        self.store
            .set_dispute_status_by_order(order_id, DisputeStatus::Settled)
            .await?;
        order.is_disputing = false;
        order.action_by = Some(admin_id);
        self.apply(&mut order, OrderStatus::CompletedByAdmin, Some(admin_id))
            .await?;

        if order.buyer_invoice.is_some() {
            if let Err(e) = self.payouts.payout_order(&mut order).await {
                error!(order_id = %order_id, "dispute settlement payout failed: {e}");
            }
        }
        info!(order_id = %order_id, admin_id, "dispute settled by admin");
        Ok(order)
    }

    /// Manual payout for a trade whose automatic retries are exhausted
    pub async fn admin_pay_order(&self, order_id: Uuid, admin_id: i64) -> Result<bool> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.fetch(order_id).await?;

        if !matches!(
            order.status,
            OrderStatus::PaidHoldInvoice | OrderStatus::Frozen | OrderStatus::CompletedByAdmin
        ) {
            return Err(EngineError::InvalidAction {
                status: order.status,
                action: "admin pay",
            });
        }
        if order.buyer_invoice.is_none() {
            return Err(EngineError::MissingCounterpart {
                order_id,
                field: "buyer_invoice",
            });
        }

        info!(order_id = %order_id, admin_id, "administrative payout requested");
        self.payouts.force_payout(&mut order).await
    }
}

fn escrow_memo(order: &Order) -> String {
    format!(
        "escrow for order {} ({} sats, {})",
        order.id, order.amount, order.fiat_code
    )
}

/// Cheap sanity check on a BOLT11 payout destination; the node does the
/// real validation when the payment is attempted
fn validate_invoice(invoice: &str) -> Result<()> {
    let trimmed = invoice.trim();
    if !trimmed.to_lowercase().starts_with("ln") || trimmed.len() < 32 {
        return Err(EngineError::InvalidInvoice(
            "not a BOLT11 payment request".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockLightningNode, MockTradeStore};
    use crate::config::LndConfig;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

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

    fn engine_with(store: MockTradeStore, node: MockLightningNode) -> Arc<OrderEngine> {
        let store: Arc<dyn TradeStore> = Arc::new(store);
        let escrow = EscrowOrchestrator::new(Arc::new(node), &lnd_config(), &trade_config());
        let locks = OrderLocks::new();
        let events = OrderEventBus::default();
        let payouts = PaymentRetryEngine::new(
            Arc::clone(&store),
            escrow.clone(),
            events.clone(),
            locks.clone(),
            3,
        );
        OrderEngine::new(
            store,
            escrow,
            payouts,
            PriceFeed::new("https://localhost", Duration::from_secs(1)).unwrap(),
            locks,
            events,
            trade_config(),
        )
    }

    fn sell_request(amount: i64) -> NewOrder {
        NewOrder {
            kind: OrderKind::Sell,
            creator_id: 1,
            amount,
            fiat_code: "EUR".to_string(),
            fiat_amount: Some(dec!(20)),
            min_amount: None,
            max_amount: None,
            payment_method: "SEPA".to_string(),
            price_margin: Decimal::ZERO,
            community_id: None,
        }
    }

    fn frozen_order(hash: &str) -> Order {
        let mut order = Order::from_request(&sell_request(50_000));
        order.seller_id = Some(1);
        order.buyer_id = Some(2);
        order.hash = Some(hash.to_string());
        order.secret = Some("11".repeat(32));
        order.transition(OrderStatus::WaitingPayment).unwrap();
        order.transition(OrderStatus::Active).unwrap();
        order.transition(OrderStatus::Frozen).unwrap();
        order.is_frozen = true;
        order
    }

    #[tokio::test]
    async fn test_settled_event_on_frozen_order_has_no_effect() {
        let hash = "ab".repeat(32);
        let order = frozen_order(&hash);

        let mut store = MockTradeStore::new();
        {
            let order = order.clone();
            store
                .expect_get_order_by_hash()
                .returning(move |_| Ok(Some(order.clone())));
        }
        {
            let order = order.clone();
            store
                .expect_get_order()
                .returning(move |_| Ok(Some(order.clone())));
        }
        // The admin flow owns a frozen order; the stream event must not
        // touch it
        store.expect_save_order().times(0);

        let engine = engine_with(store, MockLightningNode::new());
        engine.invoice_settled(&hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_watcher_per_invoice_hash() {
        let hash = "cd".repeat(32);
        let (tx, rx) = mpsc::channel::<InvoiceState>(4);
        let mut node = MockLightningNode::new();
        node.expect_subscribe_invoice()
            .times(1)
            .return_once(move |_| Ok(rx));

        let engine = engine_with(MockTradeStore::new(), node);
        engine.watch_invoice(hash.clone());
        engine.watch_invoice(hash.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.watched.len(), 1);

        // Stream end frees the slot for a future resubscribe
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.watched.is_empty());
    }

    #[tokio::test]
    async fn test_unfunded_expiry_sweep_is_idempotent() {
        let hash = "ef".repeat(32);
        let mut order = Order::from_request(&sell_request(50_000));
        order.seller_id = Some(1);
        order.buyer_id = Some(2);
        order.hash = Some(hash.clone());
        order.secret = Some("22".repeat(32));
        order.taken_at = Some(Utc::now());
        order.transition(OrderStatus::WaitingPayment).unwrap();

        let mut expired = order.clone();
        expired.transition(OrderStatus::Expired).unwrap();

        let mut store = MockTradeStore::new();
        let mut seq = mockall::Sequence::new();
        {
            let order = order.clone();
            store
                .expect_get_order()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(Some(order.clone())));
        }
        {
            let expired = expired.clone();
            store
                .expect_get_order()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(Some(expired.clone())));
        }
        store
            .expect_save_order()
            .times(1)
            .withf(|o| o.status == OrderStatus::Expired)
            .returning(|_| Ok(()));

        let mut node = MockLightningNode::new();
        node.expect_cancel_invoice().times(1).returning(|_| Ok(()));

        let engine = engine_with(store, node);
        engine.expire_unfunded(order.id).await.unwrap();
        // Second pass sees the terminal order and leaves it alone
        engine.expire_unfunded(order.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_range_order_republishes_unpriced() {
        let mut req = sell_request(0);
        req.fiat_amount = None;
        req.min_amount = Some(dec!(10));
        req.max_amount = Some(dec!(100));
        let mut order = Order::from_request(&req);
        // First taker chose 40 EUR and the amount was resolved for it
        order.fiat_amount = Some(dec!(40));
        order.amount = 200_000;
        order.fee = 1_200;
        order.seller_id = Some(1);
        order.buyer_id = Some(2);
        order.taken_at = Some(Utc::now());
        order.transition(OrderStatus::WaitingBuyerInvoice).unwrap();

        let mut store = MockTradeStore::new();
        {
            let order = order.clone();
            store
                .expect_get_order()
                .returning(move |_| Ok(Some(order.clone())));
        }
        store
            .expect_save_order()
            .times(1)
            .withf(|o| {
                o.status == OrderStatus::Pending
                    && o.amount == 0
                    && o.fee == 0
                    && o.fiat_amount.is_none()
                    && o.buyer_id.is_none()
            })
            .returning(|_| Ok(()));

        let engine = engine_with(store, MockLightningNode::new());
        let result = engine.cancel(order.id, 2).await.unwrap();
        assert!(matches!(result, CancelResult::Republished));
    }

    #[tokio::test]
    async fn test_create_order_rejects_fixed_amount_with_range() {
        let mut req = sell_request(50_000);
        req.min_amount = Some(dec!(10));
        req.max_amount = Some(dec!(100));

        // Rejected before any storage interaction
        let engine = engine_with(MockTradeStore::new(), MockLightningNode::new());
        let err = engine.create_order(req).await.unwrap_err();
        assert!(matches!(err, EngineError::AmountRangeConflict));
    }

    #[test]
    fn test_validate_invoice() {
        assert!(validate_invoice("lnbc500u1pjexamplelongenoughrequest").is_ok());
        assert!(validate_invoice("  LNBC500U1PJEXAMPLELONGENOUGHREQUEST  ").is_ok());
        assert!(validate_invoice("bc1qonchainaddressisnotaninvoice").is_err());
        assert!(validate_invoice("ln").is_err());
        assert!(validate_invoice("").is_err());
    }

    #[test]
    fn test_escrow_memo_contains_terms() {
        let order = Order::from_request(&NewOrder {
            kind: OrderKind::Sell,
            creator_id: 1,
            amount: 21_000,
            fiat_code: "USD".to_string(),
            fiat_amount: None,
            min_amount: None,
            max_amount: None,
            payment_method: "cash".to_string(),
            price_margin: rust_decimal::Decimal::ZERO,
            community_id: None,
        });
        let memo = escrow_memo(&order);
        assert!(memo.contains(&order.id.to_string()));
        assert!(memo.contains("21000"));
        assert!(memo.contains("USD"));
    }
}
