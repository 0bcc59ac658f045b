//! `tubewatch-analytics`
//!
//! **Responsibility:** fold completed job results into per-entity rolling statistics.
//!
//! - Metric readings accumulate into fixed-width time buckets that freeze once their window closes
//! - Sentiment counters grow per classified comment, with classifications memoized by content hash
//! - Trend scores update incrementally from closed buckets, never by re-reading history

pub mod aggregator;
pub mod bucket;
pub mod error;
pub mod sweeper;
pub mod trend;

pub use aggregator::{AggregatorConfig, AnalyticsAggregator, BatchReport, MetricsReport};
pub use bucket::{Accumulate, MetricSeries, bucket_start_for};
pub use error::AggregationError;
pub use sweeper::{BucketSweeper, BucketSweeperHandle};
pub use trend::{TrendAccumulator, naive_trend_score};
