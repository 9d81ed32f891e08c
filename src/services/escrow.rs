//! Escrow orchestration over the payment node
//!
//! The hold invoice is the commitment device: funds lock when the seller
//! pays it, release only on `settle`, and can always be returned via
//! `cancel` before settlement. The platform never holds keys. Every
//! escrow-driven order transition is driven by the subscription stream, so
//! the narrow window between "held" and "confirmed" cannot be missed by a
//! poll.

use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::{HeldInvoice, InvoiceState, LightningNode, PaymentReceipt};
use crate::config::{LndConfig, TradeConfig};
use crate::error::{PaymentFailure, Result};

/// A freshly created hold invoice: the engine stores `hash`/`secret` on the
/// order together, or not at all.
#[derive(Debug, Clone)]
pub struct HoldInvoiceTicket {
    pub payment_request: String,
    /// Hex SHA-256 of the preimage; the invoice identifier
    pub hash: String,
    /// Hex settlement preimage
    pub secret: String,
}

/// Wraps the payment node with engine-level semantics: preimage ownership,
/// idempotent settle/cancel, bounded-fee payouts.
#[derive(Clone)]
pub struct EscrowOrchestrator {
    node: Arc<dyn LightningNode>,
    invoice_expiry_secs: u64,
    payment_timeout: Duration,
    max_routing_fee_pct: Decimal,
}

impl EscrowOrchestrator {
    pub fn new(node: Arc<dyn LightningNode>, lnd: &LndConfig, trade: &TradeConfig) -> Self {
        Self {
            node,
            invoice_expiry_secs: lnd.invoice_expiry_secs,
            payment_timeout: Duration::from_secs(lnd.payment_timeout_secs),
            max_routing_fee_pct: trade.max_routing_fee_pct,
        }
    }

    /// Create a hold invoice for `amount_sats`. The preimage is generated
    /// here and kept on the order until release.
    pub async fn create_hold_invoice(
        &self,
        description: &str,
        amount_sats: i64,
    ) -> Result<HoldInvoiceTicket> {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let hash = Sha256::digest(preimage);

        let hash_hex = hex::encode(hash);
        let payment_request = self
            .node
            .add_hold_invoice(&hash_hex, amount_sats, description, self.invoice_expiry_secs)
            .await?;

        info!(hash = %hash_hex, amount_sats, "hold invoice created");
        Ok(HoldInvoiceTicket {
            payment_request,
            hash: hash_hex,
            secret: hex::encode(preimage),
        })
    }

    /// Subscribe to an invoice's state stream
    pub async fn subscribe(&self, hash: &str) -> Result<mpsc::Receiver<InvoiceState>> {
        self.node.subscribe_invoice(hash).await
    }

    /// Settle a held invoice. Settling an already-settled invoice is a
    /// logged no-op; the order is left in its pre-call state on failure.
    pub async fn settle(&self, preimage: &str) -> Result<()> {
        match self.node.settle_invoice(preimage).await {
            Ok(()) => Ok(()),
            Err(e) if is_terminal_invoice_error(&e.to_string()) => {
                warn!("settle on finalized invoice ignored: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel an invoice, returning any held funds. Canceling an invoice
    /// already in a terminal state is a logged no-op.
    pub async fn cancel(&self, hash: &str) -> Result<()> {
        match self.node.cancel_invoice(hash).await {
            Ok(()) => Ok(()),
            Err(e) if is_terminal_invoice_error(&e.to_string()) => {
                warn!(hash = %hash, "cancel on finalized invoice ignored: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Pay out an invoice with the configured fee cap and timeout
    pub async fn pay_invoice(
        &self,
        payment_request: &str,
        amount_sats: i64,
    ) -> std::result::Result<PaymentReceipt, PaymentFailure> {
        let max_fee = self.max_fee_for(amount_sats);
        self.node
            .send_payment(payment_request, amount_sats, max_fee, self.payment_timeout)
            .await
    }

    pub async fn invoice_state(&self, hash: &str) -> Result<InvoiceState> {
        self.node.lookup_invoice(hash).await
    }

    /// Payment hash of a payout invoice, used to correlate in-flight
    /// payments before scheduling a retry
    pub async fn decode_invoice_hash(&self, payment_request: &str) -> Result<String> {
        self.node.decode_payment_request(payment_request).await
    }

    pub async fn held_invoices(&self) -> Result<Vec<HeldInvoice>> {
        self.node.list_held_invoices().await
    }

    pub async fn is_payment_in_flight(&self, hash: &str) -> Result<bool> {
        self.node.is_payment_in_flight(hash).await
    }

    /// Routing fee cap in sats, at least 1
    fn max_fee_for(&self, amount_sats: i64) -> i64 {
        (Decimal::from(amount_sats) * self.max_routing_fee_pct)
            .floor()
            .to_i64()
            .unwrap_or(1)
            .max(1)
    }
}

/// Node errors meaning the invoice already reached a final state; the
/// caller's intent is satisfied or moot either way.
fn is_terminal_invoice_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already settled")
        || lower.contains("already canceled")
        || lower.contains("already cancelled")
        || lower.contains("invoice is already")
        || lower.contains("invoice already exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockLightningNode;
    use crate::error::EngineError;
    use rust_decimal_macros::dec;

    fn orchestrator(node: MockLightningNode) -> EscrowOrchestrator {
        EscrowOrchestrator {
            node: Arc::new(node),
            invoice_expiry_secs: 3600,
            payment_timeout: Duration::from_secs(30),
            max_routing_fee_pct: dec!(0.001),
        }
    }

    #[tokio::test]
    async fn test_create_hold_invoice_hash_matches_preimage() {
        let mut node = MockLightningNode::new();
        node.expect_add_hold_invoice()
            .returning(|_, _, _, _| Ok("lnbc1invoice".to_string()));

        let ticket = orchestrator(node)
            .create_hold_invoice("order 1", 50_000)
            .await
            .unwrap();

        let preimage = hex::decode(&ticket.secret).unwrap();
        assert_eq!(hex::encode(Sha256::digest(preimage)), ticket.hash);
        assert_eq!(ticket.payment_request, "lnbc1invoice");
    }

    #[tokio::test]
    async fn test_settle_is_idempotent_on_finalized_invoice() {
        let mut node = MockLightningNode::new();
        node.expect_settle_invoice().returning(|_| {
            Err(EngineError::Lightning(
                "rpc error: invoice already settled".to_string(),
            ))
        });

        assert!(orchestrator(node).settle("aa").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_finalized_invoice() {
        let mut node = MockLightningNode::new();
        node.expect_cancel_invoice().returning(|_| {
            Err(EngineError::Lightning(
                "invoice already canceled".to_string(),
            ))
        });

        assert!(orchestrator(node).cancel("bb").await.is_ok());
    }

    #[tokio::test]
    async fn test_settle_propagates_real_failures() {
        let mut node = MockLightningNode::new();
        node.expect_settle_invoice()
            .returning(|_| Err(EngineError::Lightning("connection refused".to_string())));

        assert!(orchestrator(node).settle("aa").await.is_err());
    }

    #[test]
    fn test_fee_cap_floor_and_minimum() {
        let node = MockLightningNode::new();
        let orch = orchestrator(node);
        // 0.1% of 50k = 50
        assert_eq!(orch.max_fee_for(50_000), 50);
        // Tiny amounts still allow a 1 sat fee
        assert_eq!(orch.max_fee_for(100), 1);
    }
}
