use thiserror::Error;

use crate::domain::OrderStatus;

/// Main error type for the trade engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lightning node errors
    #[error("Lightning node error: {0}")]
    Lightning(String),

    #[error("Payment failed: {0}")]
    Payment(#[from] PaymentFailure),

    // User input errors (rejected synchronously, no state change)
    #[error("Order not found: {0}")]
    OrderNotFound(uuid::Uuid),

    #[error("Dispute not found: {0}")]
    DisputeNotFound(uuid::Uuid),

    #[error("User {user_id} is not a party to order {order_id}")]
    NotOrderParty { user_id: i64, order_id: uuid::Uuid },

    #[error("Invalid action for order in status {status}: {action}")]
    InvalidAction {
        status: OrderStatus,
        action: &'static str,
    },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    #[error("Amount {amount} sats outside allowed range {min}..={max}")]
    AmountOutOfRange { amount: i64, min: i64, max: i64 },

    #[error("Fiat amount {0} outside the order's range")]
    FiatAmountOutOfRange(rust_decimal::Decimal),

    #[error("A fixed sats amount cannot be combined with a fiat range")]
    AmountRangeConflict,

    #[error("Invalid payout invoice: {0}")]
    InvalidInvoice(String),

    #[error("User {0} is banned")]
    UserBanned(i64),

    #[error("Dispute can be opened {0} seconds after the order was taken")]
    DisputeTooEarly(u64),

    // Domain consistency errors (logged, aborted, no partial effect)
    #[error("Order {order_id} has no {field}")]
    MissingCounterpart {
        order_id: uuid::Uuid,
        field: &'static str,
    },

    #[error("Market rate unavailable for {0}")]
    RateUnavailable(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classified outbound payment failure.
///
/// The class picks user-facing wording and whether clearing routing state
/// is worth doing before a retry; it never changes the retry bound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentFailure {
    #[error("payment timed out")]
    Timeout,

    #[error("no route to destination")]
    RoutingFailed,

    #[error("insufficient outbound balance")]
    InsufficientBalance,

    #[error("payment failed: {0}")]
    Unknown(String),
}

impl PaymentFailure {
    /// Classify a node failure reason string.
    pub fn classify(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            PaymentFailure::Timeout
        } else if lower.contains("no_route")
            || lower.contains("no route")
            || lower.contains("unable to find a path")
        {
            PaymentFailure::RoutingFailed
        } else if lower.contains("insufficient") {
            PaymentFailure::InsufficientBalance
        } else {
            PaymentFailure::Unknown(reason.to_string())
        }
    }

    /// Short stable label stored in `pending_payments.last_error`.
    pub fn as_label(&self) -> &'static str {
        match self {
            PaymentFailure::Timeout => "TIMEOUT",
            PaymentFailure::RoutingFailed => "ROUTING_FAILED",
            PaymentFailure::InsufficientBalance => "INSUFFICIENT_BALANCE",
            PaymentFailure::Unknown(_) => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_payment_failure() {
        assert_eq!(
            PaymentFailure::classify("payment attempt timed out"),
            PaymentFailure::Timeout
        );
        assert_eq!(
            PaymentFailure::classify("FAILURE_REASON_NO_ROUTE"),
            PaymentFailure::RoutingFailed
        );
        assert_eq!(
            PaymentFailure::classify("insufficient local balance"),
            PaymentFailure::InsufficientBalance
        );
        assert!(matches!(
            PaymentFailure::classify("incorrect payment details"),
            PaymentFailure::Unknown(_)
        ));
    }

    #[test]
    fn test_failure_labels() {
        assert_eq!(PaymentFailure::Timeout.as_label(), "TIMEOUT");
        assert_eq!(PaymentFailure::Unknown("x".into()).as_label(), "UNKNOWN");
    }
}
