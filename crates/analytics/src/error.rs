use chrono::{DateTime, Utc};
use thiserror::Error;

use tubewatch_core::{EntityId, Metric, RepositoryError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregationError {
    /// The reading falls into a bucket whose window has already closed.
    #[error("bucket {bucket_start} for {entity_id}/{metric} is closed")]
    BucketClosed {
        entity_id: EntityId,
        metric: Metric,
        bucket_start: DateTime<Utc>,
    },

    /// The reading is stamped in a bucket that has not started yet at `now`.
    #[error("bucket {bucket_start} for {entity_id}/{metric} has not opened yet")]
    FutureReading {
        entity_id: EntityId,
        metric: Metric,
        bucket_start: DateTime<Utc>,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AggregationError {
    pub fn is_transient(&self) -> bool {
        match self {
            AggregationError::BucketClosed { .. } | AggregationError::FutureReading { .. } => false,
            AggregationError::Repository(e) => e.is_transient(),
        }
    }
}
