//! Single-process segmentation node: in-memory store, bus and queues, one
//! worker pool per method, the autoscaling control loop and the dead-letter
//! report.

pub mod load;
pub mod runtime;
pub mod segmenter;

pub use runtime::{Node, NodeService};
pub use segmenter::SyntheticSegmenter;
