use std::sync::Arc;

use async_trait::async_trait;

use segq_core::ArtifactRef;
use segq_jobs::{ExecutionError, RoutingMessage};

/// The algorithm a worker runs for one work order.
///
/// Must be safe to run again from scratch for the same order: a redelivered
/// message executes the whole attempt anew.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Produce the result artifact for `order`.
    async fn segment(&self, order: &RoutingMessage) -> Result<ArtifactRef, ExecutionError>;
}

#[async_trait]
impl<T: Segmenter + ?Sized> Segmenter for Arc<T> {
    async fn segment(&self, order: &RoutingMessage) -> Result<ArtifactRef, ExecutionError> {
        (**self).segment(order).await
    }
}
