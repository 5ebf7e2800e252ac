//! Non-blocking pub/sub of lifecycle events.
//!
//! Publishers never block on slow consumers: each subscriber owns a bounded
//! queue and events that do not fit are dropped and counted.

mod bus;
mod event;

pub use bus::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus, wait_for_event};
pub use event::{Event, EventType};
