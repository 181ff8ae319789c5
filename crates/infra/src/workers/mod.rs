//! Queue consumers: the execution loop and the pool that sizes it.

pub mod pool;
pub mod segmenter;
pub mod worker;

pub use pool::{PoolBounds, WorkerPool};
pub use segmenter::Segmenter;
pub use worker::{Disposition, Worker, WorkerConfig, WorkerStats};
