//! LND REST adapter
//!
//! The engine's only view of the payment node. Hold invoices are created
//! with an externally generated preimage hash, subscribed as a server-side
//! stream of state changes, and settled or canceled by the escrow
//! orchestrator. Outbound payments go through the router endpoint with a
//! bounded fee and timeout.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE as B64_URL};
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{EngineError, PaymentFailure, Result};

/// Lifecycle states of a hold invoice as seen from the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    /// Funds locked, not yet settled ("held")
    Held,
    /// Preimage revealed, funds captured ("confirmed")
    Settled,
    Canceled,
}

impl InvoiceState {
    fn from_lnd(state: &str) -> Option<Self> {
        match state {
            "OPEN" => Some(InvoiceState::Open),
            "ACCEPTED" => Some(InvoiceState::Held),
            "SETTLED" => Some(InvoiceState::Settled),
            "CANCELED" => Some(InvoiceState::Canceled),
            _ => None,
        }
    }
}

/// Confirmed outbound payment
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub fee_paid_sats: i64,
    pub preimage: String,
}

/// A held invoice reported by the node (reconciliation input)
#[derive(Debug, Clone)]
pub struct HeldInvoice {
    /// Hex-encoded payment hash
    pub hash: String,
    pub amount_sats: i64,
}

/// Payment node capability consumed by the escrow orchestrator.
///
/// All hashes and preimages are hex strings at this seam; the adapter owns
/// the node's own encodings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LightningNode: Send + Sync {
    /// Register a hold invoice for the given payment hash; returns the
    /// BOLT11 payment request the seller must pay.
    async fn add_hold_invoice(
        &self,
        hash_hex: &str,
        amount_sats: i64,
        description: &str,
        expiry_secs: u64,
    ) -> Result<String>;

    /// Stream of invoice state changes. Escrow transitions are driven off
    /// this stream, never polled.
    async fn subscribe_invoice(&self, hash_hex: &str) -> Result<mpsc::Receiver<InvoiceState>>;

    /// Settle a held invoice by revealing its preimage.
    async fn settle_invoice(&self, preimage_hex: &str) -> Result<()>;

    /// Cancel an invoice, returning held funds to the payer.
    async fn cancel_invoice(&self, hash_hex: &str) -> Result<()>;

    /// Execute an outbound payment with bounded fee and timeout.
    async fn send_payment(
        &self,
        payment_request: &str,
        amount_sats: i64,
        max_fee_sats: i64,
        timeout: Duration,
    ) -> std::result::Result<PaymentReceipt, PaymentFailure>;

    /// Point lookup of an invoice's current state.
    async fn lookup_invoice(&self, hash_hex: &str) -> Result<InvoiceState>;

    /// Decode a BOLT11 payment request into its payment hash (hex).
    async fn decode_payment_request(&self, payment_request: &str) -> Result<String>;

    /// All invoices the node currently holds funds for.
    async fn list_held_invoices(&self) -> Result<Vec<HeldInvoice>>;

    /// Whether an outbound payment to this hash is already in flight.
    async fn is_payment_in_flight(&self, hash_hex: &str) -> Result<bool>;
}

/// LND REST client
pub struct LndRestClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AddHoldInvoiceResponse {
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    state: String,
    #[serde(default)]
    r_hash: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PaymentUpdate {
    status: String,
    #[serde(default)]
    failure_reason: String,
    #[serde(default)]
    fee_sat: String,
    #[serde(default)]
    payment_preimage: String,
}

#[derive(Debug, Deserialize)]
struct ListInvoicesResponse {
    #[serde(default)]
    invoices: Vec<InvoiceResponse>,
}

#[derive(Debug, Deserialize)]
struct ListPaymentsResponse {
    #[serde(default)]
    payments: Vec<PaymentListEntry>,
}

#[derive(Debug, Deserialize)]
struct PaymentListEntry {
    #[serde(default)]
    payment_hash: String,
    status: String,
}

impl LndRestClient {
    pub fn new(rest_url: &str, macaroon_hex: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let macaroon = reqwest::header::HeaderValue::from_str(macaroon_hex)
            .map_err(|e| EngineError::Lightning(format!("invalid macaroon: {e}")))?;
        headers.insert("Grpc-Metadata-macaroon", macaroon);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            // LND serves its REST API over a self-signed certificate
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            base_url: rest_url.trim_end_matches('/').to_string(),
        })
    }

    fn hash_b64(hash_hex: &str) -> Result<String> {
        let bytes = hex::decode(hash_hex)
            .map_err(|e| EngineError::Lightning(format!("bad payment hash: {e}")))?;
        Ok(B64.encode(bytes))
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(EngineError::Lightning(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl LightningNode for LndRestClient {
    async fn add_hold_invoice(
        &self,
        hash_hex: &str,
        amount_sats: i64,
        description: &str,
        expiry_secs: u64,
    ) -> Result<String> {
        let body = json!({
            "hash": Self::hash_b64(hash_hex)?,
            "value": amount_sats.to_string(),
            "memo": description,
            "expiry": expiry_secs.to_string(),
        });

        let resp = self
            .client
            .post(format!("{}/v2/invoices/hodl", self.base_url))
            .json(&body)
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let parsed: AddHoldInvoiceResponse = resp.json().await?;

        debug!(hash = %hash_hex, amount_sats, "hold invoice registered");
        Ok(parsed.payment_request)
    }

    async fn subscribe_invoice(&self, hash_hex: &str) -> Result<mpsc::Receiver<InvoiceState>> {
        let hash_bytes = hex::decode(hash_hex)
            .map_err(|e| EngineError::Lightning(format!("bad payment hash: {e}")))?;
        let url = format!(
            "{}/v2/invoices/subscribe/{}",
            self.base_url,
            B64_URL.encode(hash_bytes)
        );

        let resp = self.client.get(url).send().await?;
        let resp = self.check(resp).await?;

        let (tx, rx) = mpsc::channel(16);
        let hash = hash_hex.to_string();

        // LND streams line-delimited JSON envelopes for the invoice's
        // state changes until it reaches a final state.
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(hash = %hash, "invoice subscription stream error: {e}");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let Ok(envelope) =
                        serde_json::from_slice::<StreamEnvelope<InvoiceResponse>>(&line)
                    else {
                        continue;
                    };
                    if let Some(err) = envelope.error {
                        warn!(hash = %hash, "invoice subscription error: {err}");
                        return;
                    }
                    let Some(update) = envelope.result else {
                        continue;
                    };
                    let Some(state) = InvoiceState::from_lnd(&update.state) else {
                        continue;
                    };
                    if tx.send(state).await.is_err() {
                        return;
                    }
                    if matches!(state, InvoiceState::Settled | InvoiceState::Canceled) {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn settle_invoice(&self, preimage_hex: &str) -> Result<()> {
        let preimage = hex::decode(preimage_hex)
            .map_err(|e| EngineError::Lightning(format!("bad preimage: {e}")))?;
        let body = json!({ "preimage": B64.encode(preimage) });

        let resp = self
            .client
            .post(format!("{}/v2/invoices/settle", self.base_url))
            .json(&body)
            .send()
            .await?;
        self.check(resp).await?;
        Ok(())
    }

    async fn cancel_invoice(&self, hash_hex: &str) -> Result<()> {
        let body = json!({ "payment_hash": Self::hash_b64(hash_hex)? });

        let resp = self
            .client
            .post(format!("{}/v2/invoices/cancel", self.base_url))
            .json(&body)
            .send()
            .await?;
        self.check(resp).await?;
        Ok(())
    }

    async fn send_payment(
        &self,
        payment_request: &str,
        amount_sats: i64,
        max_fee_sats: i64,
        timeout: Duration,
    ) -> std::result::Result<PaymentReceipt, PaymentFailure> {
        let body = json!({
            "payment_request": payment_request,
            "timeout_seconds": timeout.as_secs(),
            "fee_limit_sat": max_fee_sats.to_string(),
        });
        debug!(amount_sats, max_fee_sats, "sending payment");

        let fut = async {
            let resp = self
                .client
                .post(format!("{}/v2/router/send", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| PaymentFailure::Unknown(e.to_string()))?;

            if !resp.status().is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(PaymentFailure::classify(&body));
            }

            let mut stream = resp.bytes_stream();
            let mut buf = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| PaymentFailure::Unknown(e.to_string()))?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let Ok(envelope) =
                        serde_json::from_slice::<StreamEnvelope<PaymentUpdate>>(&line)
                    else {
                        continue;
                    };
                    let Some(update) = envelope.result else {
                        continue;
                    };
                    match update.status.as_str() {
                        "SUCCEEDED" => {
                            return Ok(PaymentReceipt {
                                fee_paid_sats: update.fee_sat.parse().unwrap_or(0),
                                preimage: update.payment_preimage,
                            });
                        }
                        "FAILED" => {
                            return Err(PaymentFailure::classify(&update.failure_reason));
                        }
                        _ => {}
                    }
                }
            }

            Err(PaymentFailure::Unknown(
                "payment stream ended without a final status".to_string(),
            ))
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PaymentFailure::Timeout),
        }
    }

    async fn lookup_invoice(&self, hash_hex: &str) -> Result<InvoiceState> {
        let resp = self
            .client
            .get(format!("{}/v1/invoice/{}", self.base_url, hash_hex))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let parsed: InvoiceResponse = resp.json().await?;

        InvoiceState::from_lnd(&parsed.state)
            .ok_or_else(|| EngineError::Lightning(format!("unknown invoice state: {}", parsed.state)))
    }

    async fn decode_payment_request(&self, payment_request: &str) -> Result<String> {
        #[derive(Debug, Deserialize)]
        struct PayReq {
            payment_hash: String,
        }

        let resp = self
            .client
            .get(format!("{}/v1/payreq/{}", self.base_url, payment_request))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let parsed: PayReq = resp.json().await?;
        Ok(parsed.payment_hash)
    }

    async fn list_held_invoices(&self) -> Result<Vec<HeldInvoice>> {
        let resp = self
            .client
            .get(format!(
                "{}/v1/invoices?pending_only=true&num_max_invoices=1000",
                self.base_url
            ))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let parsed: ListInvoicesResponse = resp.json().await?;

        Ok(parsed
            .invoices
            .into_iter()
            .filter(|inv| inv.state == "ACCEPTED")
            .filter_map(|inv| {
                let bytes = B64.decode(&inv.r_hash).ok()?;
                Some(HeldInvoice {
                    hash: hex::encode(bytes),
                    amount_sats: inv.value.parse().unwrap_or(0),
                })
            })
            .collect())
    }

    async fn is_payment_in_flight(&self, hash_hex: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!(
                "{}/v1/payments?include_incomplete=true&reversed=true&max_payments=200",
                self.base_url
            ))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let parsed: ListPaymentsResponse = resp.json().await?;

        Ok(parsed
            .payments
            .iter()
            .any(|p| p.payment_hash == hash_hex && p.status == "IN_FLIGHT"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_state_mapping() {
        assert_eq!(InvoiceState::from_lnd("ACCEPTED"), Some(InvoiceState::Held));
        assert_eq!(
            InvoiceState::from_lnd("SETTLED"),
            Some(InvoiceState::Settled)
        );
        assert_eq!(
            InvoiceState::from_lnd("CANCELED"),
            Some(InvoiceState::Canceled)
        );
        assert_eq!(InvoiceState::from_lnd("OPEN"), Some(InvoiceState::Open));
        assert_eq!(InvoiceState::from_lnd("???"), None);
    }

    #[test]
    fn test_hash_b64_rejects_bad_hex() {
        assert!(LndRestClient::hash_b64("not-hex").is_err());
        assert!(LndRestClient::hash_b64(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn test_payment_update_parsing() {
        let line = r#"{"result":{"status":"SUCCEEDED","fee_sat":"12","payment_preimage":"aa"}}"#;
        let envelope: StreamEnvelope<PaymentUpdate> = serde_json::from_str(line).unwrap();
        let update = envelope.result.unwrap();
        assert_eq!(update.status, "SUCCEEDED");
        assert_eq!(update.fee_sat, "12");
    }
}
