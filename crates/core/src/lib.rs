//! `tubewatch-core`: shared building blocks.
//!
//! This crate contains the content model, identifiers and the contracts the
//! orchestration core consumes (no infrastructure concerns, no threads).

pub mod error;
pub mod fingerprint;
pub mod id;
pub mod model;
pub mod ports;
pub mod sentiment;

pub use error::DomainError;
pub use fingerprint::Fingerprint;
pub use id::{EntityId, JobId, LeaseId};
pub use model::{AnalyticsSnapshot, Channel, Comment, Metric, MetricReading, Video};
pub use ports::{
    ClassifierError, ContentSource, Repository, RepositoryError, SentimentClassifier, SourceError,
};
pub use sentiment::{Classification, SentimentCounts, SentimentDistribution, SentimentLabel};
