//! Infrastructure layer: job store, work queues, routing, workers,
//! autoscaling and configuration.

pub mod autoscale;
pub mod config;
pub mod dead_letter;
pub mod jobs;
pub mod queue;
pub mod workers;

pub use config::{Config, ConfigError};
