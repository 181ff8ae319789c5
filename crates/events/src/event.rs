/// An integration event published on the bus.
///
/// Events are immutable facts; the bus routes on `(source, detail_type)` plus
/// the event's routing key.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (the bus `detail-type`, e.g. "JobRequested").
    fn detail_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;
}

/// Events that carry a closed routing key for content-based rules.
pub trait Routable {
    type Key: Copy + Eq + core::hash::Hash + core::fmt::Debug + Send + Sync + 'static;

    fn routing_key(&self) -> Self::Key;
}
