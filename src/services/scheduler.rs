//! Background sweeps
//!
//! Interval tasks that keep the order book honest when nobody is pressing
//! buttons: expiring stale orders, retrying payouts, reconciling the node's
//! view of held invoices after a restart, and crediting community fee
//! revenue. Every sweep is idempotent; order mutations go through the
//! engine, which takes the per-order lock.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::adapters::{InvoiceState, TradeStore};
use crate::config::{SchedulerConfig, TradeConfig};
use crate::domain::OrderStatus;
use crate::error::Result;
use crate::services::engine::OrderEngine;
use crate::services::escrow::EscrowOrchestrator;
use crate::services::retry::PaymentRetryEngine;

pub struct Scheduler {
    engine: Arc<OrderEngine>,
    payouts: Arc<PaymentRetryEngine>,
    store: Arc<dyn TradeStore>,
    escrow: EscrowOrchestrator,
    trade: TradeConfig,
    intervals: SchedulerConfig,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        engine: Arc<OrderEngine>,
        payouts: Arc<PaymentRetryEngine>,
        escrow: EscrowOrchestrator,
        trade: TradeConfig,
        intervals: SchedulerConfig,
    ) -> Arc<Self> {
        let store = engine.store().clone();
        Arc::new(Self {
            engine,
            payouts,
            store,
            escrow,
            trade,
            intervals,
            running: AtomicBool::new(false),
        })
    }

    /// Reconcile once against the node, then spawn all interval loops
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }
        info!("starting scheduler");

        if let Err(e) = self.reconcile_escrow().await {
            error!("startup escrow reconciliation failed: {e}");
        }

        self.spawn_loop(self.intervals.order_sweep_interval_secs, |s| async move {
            s.sweep_expired_orders().await
        });
        self.spawn_loop(self.intervals.order_sweep_interval_secs, |s| async move {
            s.sweep_held_expired().await
        });
        self.spawn_loop(
            self.intervals.pending_payment_interval_secs,
            |s| async move { s.payouts.run_pending().await },
        );
        self.spawn_loop(self.intervals.reconcile_interval_secs, |s| async move {
            s.reconcile_escrow().await
        });
        self.spawn_loop(self.intervals.earnings_interval_secs, |s| async move {
            s.sweep_community_earnings().await
        });
    }

    pub fn stop(&self) {
        info!("stopping scheduler");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, interval_secs: u64, sweep: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it, reconciliation already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sweep(Arc::clone(&scheduler)).await {
                    error!("sweep failed: {e}");
                }
            }
        });
    }

    /// Taken orders stuck before going live: unfunded escrow expires,
    /// missing buyer invoice republishes or closes.
    async fn sweep_expired_orders(&self) -> Result<()> {
        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.trade.order_taken_expiration_secs as i64);

        let unfunded = self
            .store
            .find_stale_orders(OrderStatus::WaitingPayment, cutoff)
            .await?;
        for order in unfunded {
            if let Err(e) = self.engine.expire_unfunded(order.id).await {
                error!(order_id = %order.id, "unfunded expiry failed: {e}");
            }
        }

        let abandoned = self
            .store
            .find_stale_orders(OrderStatus::WaitingBuyerInvoice, cutoff)
            .await?;
        for order in abandoned {
            if let Err(e) = self.engine.expire_abandoned(order.id).await {
                error!(order_id = %order.id, "abandoned expiry failed: {e}");
            }
        }
        Ok(())
    }

    /// Escrow held longer than the absolute hold window must be returned
    /// before the HTLC times out on-chain.
    async fn sweep_held_expired(&self) -> Result<()> {
        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.trade.hold_invoice_expiration_secs as i64);

        for order in self.store.find_held_expired(cutoff).await? {
            if let Err(e) = self.engine.expire_held(order.id).await {
                error!(order_id = %order.id, "held expiry failed: {e}");
            }
        }
        Ok(())
    }

    /// Bring the local order book and the node back in sync: replay any
    /// invoice event missed while down, resubscribe every watched escrow,
    /// and cancel node-held invoices no live order claims.
    async fn reconcile_escrow(&self) -> Result<()> {
        let watched = self.store.find_escrow_watched().await?;
        info!(count = watched.len(), "reconciling watched escrow");

        for order in &watched {
            let Some(hash) = order.hash.clone() else { continue };

            match self.escrow.invoice_state(&hash).await {
                Ok(InvoiceState::Settled) => {
                    // Settled while we were down
                    if let Err(e) = self.engine.invoice_settled(&hash).await {
                        error!(order_id = %order.id, "settle replay failed: {e}");
                    }
                }
                Ok(InvoiceState::Held) => {
                    if order.status == OrderStatus::WaitingPayment {
                        if let Err(e) = self.engine.invoice_accepted(&hash).await {
                            error!(order_id = %order.id, "held replay failed: {e}");
                        }
                    }
                    self.engine.watch_invoice(hash);
                }
                Ok(InvoiceState::Open) => {
                    self.engine.watch_invoice(hash);
                }
                Ok(InvoiceState::Canceled) => {
                    debug!(order_id = %order.id, "watched invoice already canceled");
                }
                Err(e) => {
                    warn!(order_id = %order.id, "invoice lookup failed: {e}");
                }
            }
        }

        // Node-held funds with no live order go back to their sender
        for held in self.escrow.held_invoices().await? {
            let claimed = match self.store.get_order_by_hash(&held.hash).await? {
                Some(order) => !order.status.is_terminal(),
                None => false,
            };
            if !claimed {
                warn!(hash = %held.hash, amount = held.amount_sats, "orphaned held invoice; canceling");
                if let Err(e) = self.escrow.cancel(&held.hash).await {
                    error!(hash = %held.hash, "orphan cancel failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Fold the fees of completed community trades into the community's
    /// redeemable earnings, exactly once per order.
    async fn sweep_community_earnings(&self) -> Result<()> {
        let orders = self.store.find_uncredited_community_orders().await?;
        if orders.is_empty() {
            return Ok(());
        }
        info!(count = orders.len(), "crediting community earnings");

        for order in orders {
            if let Err(e) = self.store.credit_community_order(&order).await {
                error!(order_id = %order.id, "community credit failed: {e}");
            }
        }
        Ok(())
    }
}
