pub mod dispute;
pub mod order;
pub mod payment;

pub use dispute::{Dispute, DisputeStatus};
pub use order::{
    fee_for, market_sats, CoopCancelOutcome, NewOrder, Order, OrderKind, OrderStatus, TradeParty,
};
pub use payment::PendingPayment;
