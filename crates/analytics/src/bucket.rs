//! Fixed-width, write-once-then-frozen time buckets.

use std::time::Duration;

use chrono::{DateTime, Utc};

use tubewatch_core::{AnalyticsSnapshot, EntityId, Metric};

use crate::error::AggregationError;

/// Start of the bucket of width `width` containing `at`, aligned to the Unix epoch.
///
/// Widths are truncated to whole seconds; anything under one second is treated as one.
pub fn bucket_start_for(at: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_secs = width.as_secs().max(1) as i64;
    let start = at.timestamp().div_euclid(width_secs) * width_secs;
    DateTime::from_timestamp(start, 0).unwrap_or(at)
}

/// How readings landing in the same bucket combine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Accumulate {
    /// Gauges (view counts, subscribers): the latest reading wins.
    Last,
    /// Counters (sentiment per bucket): readings add up.
    Sum,
}

impl Accumulate {
    pub fn for_metric(metric: Metric) -> Self {
        match metric {
            Metric::SentimentPositive | Metric::SentimentNegative | Metric::SentimentNeutral => Accumulate::Sum,
            _ => Accumulate::Last,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct OpenBucket {
    start: DateTime<Utc>,
    value: f64,
}

/// One metric of one entity: at most one open bucket plus the start of the
/// newest frozen one.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    entity_id: EntityId,
    metric: Metric,
    width: Duration,
    accumulate: Accumulate,
    open: Option<OpenBucket>,
    newest_closed: Option<DateTime<Utc>>,
}

impl MetricSeries {
    pub fn new(entity_id: EntityId, metric: Metric, width: Duration) -> Self {
        Self {
            entity_id,
            metric,
            width,
            accumulate: Accumulate::for_metric(metric),
            open: None,
            newest_closed: None,
        }
    }

    /// Treat everything up to and including `bucket_start` as already frozen.
    ///
    /// Used when resuming from persisted snapshots.
    pub fn resume_after(&mut self, bucket_start: DateTime<Utc>) {
        if self.newest_closed.is_none_or(|closed| closed < bucket_start) {
            self.newest_closed = Some(bucket_start);
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    /// Value of the open bucket, if any.
    pub fn open_value(&self) -> Option<f64> {
        self.open.as_ref().map(|b| b.value)
    }

    fn width_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.width.as_secs().max(1) as i64)
    }

    fn closed_error(&self, bucket_start: DateTime<Utc>) -> AggregationError {
        AggregationError::BucketClosed {
            entity_id: self.entity_id.clone(),
            metric: self.metric,
            bucket_start,
        }
    }

    fn snapshot(&self, bucket: &OpenBucket) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            entity_id: self.entity_id.clone(),
            bucket_start: bucket.start,
            bucket_width: self.width,
            metric: self.metric,
            value: bucket.value,
        }
    }

    /// Fold a reading observed at `at` into its bucket, as seen at `now`.
    ///
    /// If the reading opens a newer bucket, the previously open one is
    /// frozen and returned; its window has necessarily elapsed by then.
    /// Readings for a bucket whose window has elapsed (or that precedes the
    /// open bucket) are rejected, as are readings stamped in a bucket that
    /// has not started at `now`.
    pub fn record(
        &mut self,
        at: DateTime<Utc>,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalyticsSnapshot>, AggregationError> {
        let start = bucket_start_for(at, self.width);

        if now >= start + self.width_chrono() {
            return Err(self.closed_error(start));
        }
        if self.newest_closed.is_some_and(|closed| start <= closed) {
            return Err(self.closed_error(start));
        }
        if start > bucket_start_for(now, self.width) {
            return Err(AggregationError::FutureReading {
                entity_id: self.entity_id.clone(),
                metric: self.metric,
                bucket_start: start,
            });
        }

        let open_start = self.open.as_ref().map(|b| b.start);
        match open_start {
            Some(open) if open == start => {
                let accumulate = self.accumulate;
                if let Some(bucket) = self.open.as_mut() {
                    bucket.value = match accumulate {
                        Accumulate::Last => value,
                        Accumulate::Sum => bucket.value + value,
                    };
                }
                Ok(None)
            }
            Some(open) if open > start => Err(self.closed_error(start)),
            _ => {
                let frozen = self.freeze();
                self.open = Some(OpenBucket { start, value });
                Ok(frozen)
            }
        }
    }

    /// Freeze the open bucket if its window has elapsed at `now`.
    pub fn close_elapsed(&mut self, now: DateTime<Utc>) -> Option<AnalyticsSnapshot> {
        let elapsed = self
            .open
            .as_ref()
            .is_some_and(|open| now >= open.start + self.width_chrono());
        if elapsed { self.freeze() } else { None }
    }

    fn freeze(&mut self) -> Option<AnalyticsSnapshot> {
        let bucket = self.open.take()?;
        self.newest_closed = Some(bucket.start);
        Some(self.snapshot(&bucket))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn series(metric: Metric) -> MetricSeries {
        MetricSeries::new(EntityId::parse("v1").unwrap(), metric, HOUR)
    }

    #[test]
    fn bucket_start_floors_to_width() {
        assert_eq!(bucket_start_for(t(10, 42), HOUR), t(10, 0));
        assert_eq!(bucket_start_for(t(10, 0), HOUR), t(10, 0));
        assert_eq!(bucket_start_for(t(23, 59), Duration::from_secs(86_400)), t(0, 0));
    }

    #[test]
    fn gauge_keeps_latest_and_counter_sums() {
        let mut views = series(Metric::Views);
        views.record(t(10, 5), 100.0, t(10, 5)).unwrap();
        views.record(t(10, 20), 140.0, t(10, 20)).unwrap();
        assert_eq!(views.open_value(), Some(140.0));

        let mut positive = series(Metric::SentimentPositive);
        positive.record(t(10, 5), 3.0, t(10, 5)).unwrap();
        positive.record(t(10, 20), 4.0, t(10, 20)).unwrap();
        assert_eq!(positive.open_value(), Some(7.0));
    }

    #[test]
    fn newer_reading_freezes_previous_bucket() {
        let mut views = series(Metric::Views);
        views.record(t(10, 5), 100.0, t(10, 5)).unwrap();

        let frozen = views.record(t(11, 1), 150.0, t(11, 1)).unwrap().unwrap();
        assert_eq!(frozen.bucket_start, t(10, 0));
        assert_eq!(frozen.value, 100.0);
        assert_eq!(views.open_value(), Some(150.0));
    }

    #[test]
    fn closed_bucket_rejects_writes() {
        let mut views = series(Metric::Views);
        views.record(t(10, 5), 100.0, t(10, 5)).unwrap();
        views.record(t(11, 1), 150.0, t(11, 1)).unwrap();

        let late = views.record(t(10, 50), 999.0, t(10, 59));
        assert!(matches!(late, Err(AggregationError::BucketClosed { .. })));

        // Window elapsed by wall clock, even though nothing newer arrived.
        let stale = series(Metric::Views).record(t(9, 30), 1.0, t(10, 0));
        assert!(matches!(stale, Err(AggregationError::BucketClosed { .. })));
    }

    #[test]
    fn future_reading_does_not_freeze_open_bucket() {
        let mut views = series(Metric::Views);
        views.record(t(10, 5), 100.0, t(10, 5)).unwrap();

        let skewed = views.record(t(11, 10), 150.0, t(10, 30));
        assert!(matches!(skewed, Err(AggregationError::FutureReading { bucket_start, .. }) if bucket_start == t(11, 0)));
        assert_eq!(views.open_value(), Some(100.0));

        assert_eq!(views.record(t(10, 45), 120.0, t(10, 45)).unwrap(), None);
        assert_eq!(views.open_value(), Some(120.0));
        assert!(views.close_elapsed(t(10, 59)).is_none());
    }

    #[test]
    fn close_elapsed_freezes_only_after_window() {
        let mut views = series(Metric::Views);
        views.record(t(10, 5), 100.0, t(10, 5)).unwrap();

        assert!(views.close_elapsed(t(10, 59)).is_none());
        let frozen = views.close_elapsed(t(11, 0)).unwrap();
        assert_eq!(frozen.value, 100.0);
        assert!(views.close_elapsed(t(12, 0)).is_none());

        assert!(views.record(t(10, 30), 1.0, t(10, 30)).is_err());
    }

    #[test]
    fn resume_after_blocks_persisted_buckets() {
        let mut views = series(Metric::Views);
        views.resume_after(t(10, 0));
        assert!(views.record(t(10, 30), 1.0, t(10, 30)).is_err());
        assert!(views.record(t(11, 30), 1.0, t(11, 30)).is_ok());
    }
}
