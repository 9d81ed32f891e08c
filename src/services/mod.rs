pub mod dispute;
pub mod engine;
pub mod escrow;
pub mod retry;
pub mod scheduler;

pub use dispute::{ClaimResult, DisputeCoordinator, DisputeOutcome};
pub use engine::{CancelResult, OrderEngine, TakeOutcome};
pub use escrow::{EscrowOrchestrator, HoldInvoiceTicket};
pub use retry::PaymentRetryEngine;
pub use scheduler::Scheduler;
