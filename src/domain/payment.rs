use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scheduled, retryable outbound settlement.
///
/// Carries either `order_id` (buyer payout for a trade) or `community_id`
/// (earnings withdrawal), never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayment {
    pub id: i64,
    pub order_id: Option<Uuid>,
    pub community_id: Option<String>,
    pub user_id: i64,
    pub amount: i64,
    pub payment_request: String,
    pub hash: String,
    pub attempts: i32,
    pub paid: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PendingPayment {
    /// Whether another attempt is allowed under the configured bound
    pub fn can_attempt(&self, max_attempts: u32) -> bool {
        !self.paid && (self.attempts as u32) < max_attempts
    }

    /// Exhausted without success: the manual-intervention path remains
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        !self.paid && (self.attempts as u32) >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(attempts: i32, paid: bool) -> PendingPayment {
        PendingPayment {
            id: 1,
            order_id: Some(Uuid::new_v4()),
            community_id: None,
            user_id: 9,
            amount: 10_000,
            payment_request: "lnbc1...".to_string(),
            hash: "ab".repeat(32),
            attempts,
            paid,
            last_error: None,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    #[test]
    fn test_attempt_bound() {
        assert!(pending(0, false).can_attempt(3));
        assert!(pending(2, false).can_attempt(3));
        assert!(!pending(3, false).can_attempt(3));
        assert!(!pending(0, true).can_attempt(3));
    }

    #[test]
    fn test_exhausted() {
        assert!(pending(3, false).is_exhausted(3));
        assert!(!pending(2, false).is_exhausted(3));
        // Paid records are done, not exhausted
        assert!(!pending(3, true).is_exhausted(3));
    }
}
