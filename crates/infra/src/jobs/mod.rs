//! Job storage, routing and the job control surface.
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records, versioned saves
//! - `JobRouter` / `RoutingTable`: method -> queue routing through the bus
//! - `JobService`: create / start / requeue / delete and dead-letter admin

pub mod router;
pub mod service;
pub mod store;

pub use router::{JobRouter, QueuePair, RouterError, RoutingOutcome, RoutingTable};
pub use service::{
    DISCARDED_DETAIL, DeadLetterEntry, DeadLetterOutcome, JobService, RequeueOutcome,
    ServiceError, StartOutcome,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
