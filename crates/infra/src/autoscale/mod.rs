//! Autoscaling: a pure backlog policy and the loop that feeds it.

pub mod control_loop;
pub mod policy;

pub use control_loop::{ControlLoop, DecisionSink, MetricsSource, QueueSampler, RunningWorkers};
pub use policy::{
    Band, HysteresisWindow, PolicyError, QueueMetricSnapshot, ScalingController, ScalingDecision,
    ScalingEvaluation, ScalingPolicy, wait_seconds,
};
