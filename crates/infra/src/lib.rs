//! Infrastructure layer: queue broker, workers, scheduling, adapters, config.

pub mod classifier;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod repository;
pub mod runtime;
pub mod source;
