//! Concurrency primitives shared by every order mutation path.

pub mod events;
pub mod order_lock;

pub use events::{OrderEvent, OrderEventBus};
pub use order_lock::{OrderLockGuard, OrderLocks};
