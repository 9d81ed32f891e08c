use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Order kind: what the creator wants to do with sats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Buy,
    Sell,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Buy => "buy",
            OrderKind::Sell => "sell",
        }
    }
}

impl TryFrom<&str> for OrderKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "buy" => Ok(OrderKind::Buy),
            "sell" => Ok(OrderKind::Sell),
            other => Err(format!("unknown order kind: {other}")),
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A party to a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeParty {
    Buyer,
    Seller,
}

impl TradeParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeParty::Buyer => "buyer",
            TradeParty::Seller => "seller",
        }
    }

    pub fn counterpart(&self) -> TradeParty {
        match self {
            TradeParty::Buyer => TradeParty::Seller,
            TradeParty::Seller => TradeParty::Buyer,
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Published, no counterparty yet
    Pending,
    /// Escrow created, waiting for the seller side to fund it
    WaitingPayment,
    /// Waiting for the buyer to supply a payout invoice
    WaitingBuyerInvoice,
    /// Escrow held, fiat exchange underway
    Active,
    /// Buyer declared the fiat payment sent
    FiatSent,
    /// Escrow settled, payout to the buyer pending
    PaidHoldInvoice,
    /// Trade completed, buyer paid out
    Success,
    /// A party opened a dispute
    Dispute,
    /// Escrow settled into platform custody by an admin
    Frozen,
    /// Escrow held past its expiration window, invoice canceled
    HoldInvoiceExpired,
    /// Canceled while untaken, or by mutual consent
    Canceled,
    CanceledByAdmin,
    CompletedByAdmin,
    /// Taken but never funded within the window
    Expired,
    /// Closed by the creator before the trade went live
    Closed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 15] = [
        OrderStatus::Pending,
        OrderStatus::WaitingPayment,
        OrderStatus::WaitingBuyerInvoice,
        OrderStatus::Active,
        OrderStatus::FiatSent,
        OrderStatus::PaidHoldInvoice,
        OrderStatus::Success,
        OrderStatus::Dispute,
        OrderStatus::Frozen,
        OrderStatus::HoldInvoiceExpired,
        OrderStatus::Canceled,
        OrderStatus::CanceledByAdmin,
        OrderStatus::CompletedByAdmin,
        OrderStatus::Expired,
        OrderStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::WaitingPayment => "WAITING_PAYMENT",
            OrderStatus::WaitingBuyerInvoice => "WAITING_BUYER_INVOICE",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::FiatSent => "FIAT_SENT",
            OrderStatus::PaidHoldInvoice => "PAID_HOLD_INVOICE",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Dispute => "DISPUTE",
            OrderStatus::Frozen => "FROZEN",
            OrderStatus::HoldInvoiceExpired => "HOLD_INVOICE_EXPIRED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::CanceledByAdmin => "CANCELED_BY_ADMIN",
            OrderStatus::CompletedByAdmin => "COMPLETED_BY_ADMIN",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Success
                | OrderStatus::Canceled
                | OrderStatus::CanceledByAdmin
                | OrderStatus::CompletedByAdmin
                | OrderStatus::Expired
                | OrderStatus::Closed
                | OrderStatus::HoldInvoiceExpired
        )
    }

    /// Statuses where a trade is underway with escrow held
    pub fn is_trade_in_progress(&self) -> bool {
        matches!(
            self,
            OrderStatus::Active | OrderStatus::FiatSent | OrderStatus::Dispute
        )
    }

    /// The single transition table: every status write is validated here.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(to, WaitingPayment | WaitingBuyerInvoice | Canceled),
            WaitingPayment => matches!(
                to,
                Active | WaitingBuyerInvoice | Pending | Closed | Expired | CanceledByAdmin
            ),
            WaitingBuyerInvoice => {
                matches!(to, Active | WaitingPayment | Pending | Closed | CanceledByAdmin)
            }
            Active => matches!(
                to,
                FiatSent
                    | PaidHoldInvoice
                    | Dispute
                    | HoldInvoiceExpired
                    | Canceled
                    | Frozen
                    | CanceledByAdmin
            ),
            FiatSent => matches!(
                to,
                PaidHoldInvoice | Dispute | HoldInvoiceExpired | Canceled | Frozen
                    | CanceledByAdmin
            ),
            PaidHoldInvoice => matches!(to, Success | Frozen),
            Dispute => matches!(
                to,
                PaidHoldInvoice
                    | HoldInvoiceExpired
                    | Canceled
                    | Frozen
                    | CanceledByAdmin
                    | CompletedByAdmin
            ),
            Frozen => matches!(to, Success | CanceledByAdmin),
            // Terminal states have no outgoing edges
            Success | Canceled | CanceledByAdmin | CompletedByAdmin | Expired | Closed
            | HoldInvoiceExpired => false,
        }
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        OrderStatus::ALL
            .iter()
            .find(|st| st.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown order status: {s}"))
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a cooperative cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoopCancelOutcome {
    /// Requester's flag was already set; surfaced as "already waiting"
    AlreadyRequested,
    /// First flag of the pair; counterparty must still agree
    CounterpartyNotified,
    /// Both flags observed; cancel escrow and the order now
    CancelNow,
}

/// Order creation request (what a user asked for)
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub kind: OrderKind,
    pub creator_id: i64,
    pub amount: i64,
    pub fiat_code: String,
    pub fiat_amount: Option<Decimal>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub payment_method: String,
    pub price_margin: Decimal,
    pub community_id: Option<String>,
}

impl NewOrder {
    /// Shape checks independent of engine configuration. A request either
    /// fixes the sats amount up front or offers a fiat range that prices
    /// each take at the market rate; never both, since a range order's
    /// amount depends on the taker's chosen fiat.
    pub fn validate(&self) -> Result<()> {
        match (self.min_amount, self.max_amount) {
            (None, None) => Ok(()),
            (Some(min), Some(max)) => {
                if self.amount != 0 {
                    return Err(EngineError::AmountRangeConflict);
                }
                if min <= Decimal::ZERO || max <= min {
                    return Err(EngineError::FiatAmountOutOfRange(max));
                }
                Ok(())
            }
            (Some(bound), None) | (None, Some(bound)) => {
                Err(EngineError::FiatAmountOutOfRange(bound))
            }
        }
    }
}

/// A single trade: the root aggregate of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub creator_id: i64,
    pub buyer_id: Option<i64>,
    pub seller_id: Option<i64>,
    /// Integer satoshis; 0 = price deferred to the market rate
    pub amount: i64,
    /// Frozen at first assignment, never recomputed
    pub fee: i64,
    pub fiat_code: String,
    pub fiat_amount: Option<Decimal>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub payment_method: String,
    pub price_margin: Decimal,
    pub price_from_api: bool,
    /// Hold invoice identifier; set together with `secret` or not at all
    pub hash: Option<String>,
    /// Settlement preimage for the outstanding hold invoice
    pub secret: Option<String>,
    pub buyer_invoice: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub invoice_held_at: Option<DateTime<Utc>>,
    pub buyer_cooperative_cancel: bool,
    pub seller_cooperative_cancel: bool,
    pub is_disputing: bool,
    pub buyer_dispute_token: Option<i32>,
    pub seller_dispute_token: Option<i32>,
    pub previous_dispute_status: Option<OrderStatus>,
    pub canceled_by: Option<i64>,
    pub action_by: Option<i64>,
    pub is_frozen: bool,
    pub fee_credited: bool,
    pub community_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(req: &NewOrder) -> Self {
        let price_from_api = req.amount == 0;
        Self {
            id: Uuid::new_v4(),
            kind: req.kind,
            status: OrderStatus::Pending,
            creator_id: req.creator_id,
            buyer_id: None,
            seller_id: None,
            amount: req.amount,
            fee: 0,
            fiat_code: req.fiat_code.clone(),
            fiat_amount: req.fiat_amount,
            min_amount: req.min_amount,
            max_amount: req.max_amount,
            payment_method: req.payment_method.clone(),
            price_margin: req.price_margin,
            price_from_api,
            hash: None,
            secret: None,
            buyer_invoice: None,
            taken_at: None,
            invoice_held_at: None,
            buyer_cooperative_cancel: false,
            seller_cooperative_cancel: false,
            is_disputing: false,
            buyer_dispute_token: None,
            seller_dispute_token: None,
            previous_dispute_status: None,
            canceled_by: None,
            action_by: None,
            is_frozen: false,
            fee_credited: false,
            community_id: req.community_id.clone(),
            created_at: Utc::now(),
        }
    }

    /// Validated status write; the only way status changes
    pub fn transition(&mut self, to: OrderStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Which side of the trade a user is on, if any
    pub fn party_of(&self, user_id: i64) -> Option<TradeParty> {
        if self.buyer_id == Some(user_id) {
            Some(TradeParty::Buyer)
        } else if self.seller_id == Some(user_id) {
            Some(TradeParty::Seller)
        } else {
            None
        }
    }

    pub fn is_creator(&self, user_id: i64) -> bool {
        self.creator_id == user_id
    }

    /// True while a hold invoice is outstanding
    pub fn has_escrow(&self) -> bool {
        self.hash.is_some() && self.secret.is_some()
    }

    /// A range order expresses a fiat interval instead of a fixed amount
    pub fn is_range_order(&self) -> bool {
        self.min_amount.is_some() && self.max_amount.is_some()
    }

    /// Decide the outcome of a cooperative cancellation request without
    /// mutating anything; the engine persists the winning effect.
    pub fn cooperative_cancel_outcome(&self, requester: TradeParty) -> CoopCancelOutcome {
        let (own, other) = match requester {
            TradeParty::Buyer => (self.buyer_cooperative_cancel, self.seller_cooperative_cancel),
            TradeParty::Seller => (self.seller_cooperative_cancel, self.buyer_cooperative_cancel),
        };
        if own {
            CoopCancelOutcome::AlreadyRequested
        } else if other {
            CoopCancelOutcome::CancelNow
        } else {
            CoopCancelOutcome::CounterpartyNotified
        }
    }

    /// Amount the buyer is paid out: escrow amount minus the frozen fee
    pub fn buyer_payout_amount(&self) -> i64 {
        self.amount - self.fee
    }

    /// Amount the seller must lock into escrow
    pub fn escrow_amount(&self) -> i64 {
        self.amount
    }

    /// Clear the taker side ahead of putting the offer back on the book.
    /// A fixed-amount order keeps its first-resolution amount and fee; a
    /// range order drops its resolved pricing so the next taker's fiat
    /// choice prices the trade afresh.
    pub fn reset_for_republish(&mut self) {
        self.buyer_id = None;
        self.seller_id = None;
        self.hash = None;
        self.secret = None;
        self.buyer_invoice = None;
        self.taken_at = None;
        self.invoice_held_at = None;
        self.buyer_cooperative_cancel = false;
        self.seller_cooperative_cancel = false;
        self.action_by = None;
        if self.is_range_order() {
            self.amount = 0;
            self.fee = 0;
            self.fiat_amount = None;
            self.price_from_api = true;
        }
    }

    /// Remainder terms for a partially taken range order, if any fiat
    /// interval is left after taking `taken_fiat`.
    pub fn range_remainder(&self, taken_fiat: Decimal) -> Option<(Decimal, Decimal)> {
        let (min, max) = (self.min_amount?, self.max_amount?);
        let rest = max - taken_fiat;
        if rest >= min {
            Some((min, rest))
        } else {
            None
        }
    }
}

/// Resolve a market-priced amount to integer sats.
///
/// `rate_per_btc` is the fiat price of one BTC; margin is a percentage
/// (2 = 2%) applied as `amount * (1 - margin/100)`, floored.
pub fn market_sats(fiat_amount: Decimal, rate_per_btc: Decimal, margin: Decimal) -> Option<i64> {
    if rate_per_btc <= Decimal::ZERO {
        return None;
    }
    let btc = fiat_amount / rate_per_btc;
    let sats = btc * Decimal::from(100_000_000u64);
    let with_margin = sats * (Decimal::ONE - margin / Decimal::from(100u64));
    with_margin.floor().to_i64()
}

/// Platform fee for an amount, floored to integer sats. Computed once at
/// order creation and never recomputed.
pub fn fee_for(amount: i64, fee_rate: Decimal) -> i64 {
    (Decimal::from(amount) * fee_rate)
        .floor()
        .to_i64()
        .unwrap_or(0)
}
