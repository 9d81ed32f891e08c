//! Order-changed event surface
//!
//! A bounded broadcast channel owned by the engine. Every committed
//! transition publishes one event; consumers (chat notifier, indexer)
//! subscribe at startup. A lagging consumer drops oldest events and is
//! expected to reconcile from the store.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::domain::OrderStatus;

/// Emitted after every committed order transition
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    /// User whose action drove the transition; None for scheduler/escrow
    pub changed_by: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Bounded publish point for order events
#[derive(Clone)]
pub struct OrderEventBus {
    tx: broadcast::Sender<OrderEvent>,
}

impl OrderEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.tx.subscribe()
    }

    /// Publish a committed transition. No subscribers is not an error.
    pub fn publish(
        &self,
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
        changed_by: Option<i64>,
    ) {
        let event = OrderEvent {
            order_id,
            old_status,
            new_status,
            changed_by,
            at: Utc::now(),
        };
        debug!(
            order_id = %order_id,
            from = %old_status,
            to = %new_status,
            "order changed"
        );
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for OrderEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = OrderEventBus::new(8);
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(id, OrderStatus::Active, OrderStatus::FiatSent, Some(42));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.order_id, id);
        assert_eq!(event.old_status, OrderStatus::Active);
        assert_eq!(event.new_status, OrderStatus::FiatSent);
        assert_eq!(event.changed_by, Some(42));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = OrderEventBus::new(8);
        bus.publish(
            Uuid::new_v4(),
            OrderStatus::Pending,
            OrderStatus::Canceled,
            None,
        );
        assert_eq!(bus.receiver_count(), 0);
    }
}
