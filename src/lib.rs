pub mod adapters;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod services;

pub use adapters::{LightningNode, LndRestClient, PostgresStore, PriceFeed, TradeStore};
pub use config::AppConfig;
pub use coordination::{OrderEvent, OrderEventBus, OrderLockGuard, OrderLocks};
pub use domain::{
    CoopCancelOutcome, Dispute, DisputeStatus, NewOrder, Order, OrderKind, OrderStatus,
    PendingPayment, TradeParty,
};
pub use error::{EngineError, PaymentFailure, Result};
pub use services::{
    CancelResult, ClaimResult, DisputeCoordinator, DisputeOutcome, EscrowOrchestrator,
    OrderEngine, PaymentRetryEngine, Scheduler, TakeOutcome,
};
