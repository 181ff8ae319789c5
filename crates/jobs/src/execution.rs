use thiserror::Error;

/// The segmentation algorithm failed on valid input.
///
/// Deterministic by assumption: the job is recorded as `error` and the work
/// order is acknowledged, never retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The input artifact could not be fetched or decoded.
    #[error("input unavailable: {0}")]
    InputUnavailable(String),

    /// The algorithm itself failed.
    #[error("segmentation failed: {0}")]
    Algorithm(String),
}
