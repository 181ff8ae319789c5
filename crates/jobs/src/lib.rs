//! Segmentation job domain: the job aggregate, its lifecycle and work orders.

pub mod execution;
pub mod job;
pub mod message;
pub mod method;

pub use execution::ExecutionError;
pub use job::{Job, JobStatus, NewJob, StartKind, MAX_ERROR_DETAIL_LEN};
pub use message::{JOB_REQUESTED, JOB_SOURCE, RoutingMessage};
pub use method::{CostClass, Method, SegmentationParams, WhiteBalance};
