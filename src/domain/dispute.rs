use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TradeParty;

/// Dispute status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    /// Opened, no solver assigned yet
    WaitingForSolver,
    /// A solver claimed it
    InProgress,
    /// Moot: the trade completed through the normal release path
    Released,
    /// Solver settled the escrow to the buyer side
    Settled,
    /// Solver canceled the escrow back to the seller
    SellerRefunded,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::WaitingForSolver => "WAITING_FOR_SOLVER",
            DisputeStatus::InProgress => "IN_PROGRESS",
            DisputeStatus::Released => "RELEASED",
            DisputeStatus::Settled => "SETTLED",
            DisputeStatus::SellerRefunded => "SELLER_REFUNDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisputeStatus::Released | DisputeStatus::Settled | DisputeStatus::SellerRefunded
        )
    }
}

impl TryFrom<&str> for DisputeStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "WAITING_FOR_SOLVER" => Ok(DisputeStatus::WaitingForSolver),
            "IN_PROGRESS" => Ok(DisputeStatus::InProgress),
            "RELEASED" => Ok(DisputeStatus::Released),
            "SETTLED" => Ok(DisputeStatus::Settled),
            "SELLER_REFUNDED" => Ok(DisputeStatus::SellerRefunded),
            other => Err(format!("unknown dispute status: {other}")),
        }
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One dispute per disputed order, correlated by `order_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub order_id: Uuid,
    pub buyer_id: i64,
    pub seller_id: i64,
    /// Assigned exactly once via a conditional update
    pub solver_id: Option<i64>,
    pub initiator: TradeParty,
    pub status: DisputeStatus,
    pub community_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Dispute {
    pub fn new(
        order_id: Uuid,
        buyer_id: i64,
        seller_id: i64,
        initiator: TradeParty,
        community_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            buyer_id,
            seller_id,
            solver_id: None,
            initiator,
            status: DisputeStatus::WaitingForSolver,
            community_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_dispute_waits_for_solver() {
        let dispute = Dispute::new(Uuid::new_v4(), 1, 2, TradeParty::Buyer, None);
        assert_eq!(dispute.status, DisputeStatus::WaitingForSolver);
        assert!(dispute.solver_id.is_none());
        assert!(!dispute.status.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DisputeStatus::Settled.is_terminal());
        assert!(DisputeStatus::SellerRefunded.is_terminal());
        assert!(DisputeStatus::Released.is_terminal());
        assert!(!DisputeStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for st in [
            DisputeStatus::WaitingForSolver,
            DisputeStatus::InProgress,
            DisputeStatus::Released,
            DisputeStatus::Settled,
            DisputeStatus::SellerRefunded,
        ] {
            assert_eq!(DisputeStatus::try_from(st.as_str()).unwrap(), st);
        }
    }
}
