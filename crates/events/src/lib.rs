//! Integration events and content-based routing.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{Delivery, EventBus, EventTarget, PublishReceipt, TargetError};
pub use envelope::EventEnvelope;
pub use event::{Event, Routable};
pub use in_memory_bus::{BusError, EventPattern, InMemoryEventBus};
