//! Per-order mutual exclusion
//!
//! Both mutation sources — user actions plus invoice events, and scheduler
//! sweeps — must hold the order's lock before a read-modify-write. For a
//! given order id exactly one guarded section runs at a time; the final
//! state is a function of acquisition order, not of which network call
//! returns first. Guards are owned values passed down a flow, so each
//! logical flow locks exactly once. Process-local only: horizontal scaling
//! needs a leased lock on the order row instead.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    /// Outstanding guards plus waiters; entry removed at zero
    refs: usize,
}

/// Registry of per-order-id locks
#[derive(Clone, Default)]
pub struct OrderLocks {
    inner: Arc<DashMap<Uuid, LockEntry>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for an order id, waiting if another flow holds it.
    /// The lock is released when the returned guard drops, on every exit
    /// path.
    pub async fn lock(&self, order_id: Uuid) -> OrderLockGuard {
        let mutex = {
            let mut entry = self.inner.entry(order_id).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };

        let guard = mutex.lock_owned().await;
        OrderLockGuard {
            order_id,
            locks: self.clone(),
            _guard: guard,
        }
    }

    /// Number of order ids with live lock entries (tests/metrics)
    pub fn active(&self) -> usize {
        self.inner.len()
    }

    fn release(&self, order_id: Uuid) {
        if let Some(mut entry) = self.inner.get_mut(&order_id) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        self.inner.remove_if(&order_id, |_, entry| entry.refs == 0);
    }
}

/// RAII guard over one order's lock
pub struct OrderLockGuard {
    order_id: Uuid,
    locks: OrderLocks,
    _guard: OwnedMutexGuard<()>,
}

impl OrderLockGuard {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }
}

impl Drop for OrderLockGuard {
    fn drop(&mut self) {
        self.locks.release(self.order_id);
    }
}
