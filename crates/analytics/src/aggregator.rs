use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use tubewatch_cache::{CacheError, CacheManager, ComputeError};
use tubewatch_core::{
    AnalyticsSnapshot, Classification, ClassifierError, Comment, EntityId, Metric, MetricReading, Repository,
    RepositoryError, SentimentClassifier, SentimentCounts, SentimentLabel,
};

use crate::bucket::MetricSeries;
use crate::error::AggregationError;
use crate::trend::TrendAccumulator;

/// The trend source persisted as the entity's `trend_score` series.
const PERSISTED_TREND_SOURCE: Metric = Metric::Views;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub bucket_width: Duration,
    pub trend_window: Duration,
    /// How long a classification stays memoized per content hash
    pub classification_ttl: Duration,
    /// Most recent comment ids remembered per entity for de-duplication
    pub seen_comments_per_entity: usize,
    /// Entities with nothing open or pending are dropped after this long without activity
    pub entity_idle_ttl: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(3600),
            trend_window: Duration::from_secs(7 * 24 * 3600),
            classification_ttl: Duration::from_secs(24 * 3600),
            seen_comments_per_entity: 10_000,
            entity_idle_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Outcome of folding one comment batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub classified: usize,
    /// Comments already counted for this entity (redelivery or repeated ids)
    pub skipped_duplicates: usize,
    /// Comments whose classification failed; excluded from the counts
    pub failed: usize,
}

/// Outcome of folding a set of metric readings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub recorded: usize,
    /// Readings aimed at a bucket that had already frozen
    pub late: usize,
    /// Readings stamped in a bucket that had not opened yet
    pub future: usize,
    /// Buckets frozen as a side effect
    pub closed: usize,
}

#[derive(Debug)]
struct EntityState {
    entity_id: EntityId,
    counts: SentimentCounts,
    /// Counts were reset or loaded; the persisted totals must not overwrite them.
    counts_loaded: bool,
    seen_comments: LruCache<String, ()>,
    series: HashMap<Metric, MetricSeries>,
    trends: HashMap<Metric, TrendAccumulator>,
    /// Closed snapshots not yet accepted by the repository, oldest first.
    pending: Vec<AnalyticsSnapshot>,
    warmed: bool,
    last_active: Option<DateTime<Utc>>,
}

impl EntityState {
    fn new(entity_id: EntityId, seen_capacity: usize) -> Self {
        let seen_capacity = NonZeroUsize::new(seen_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            counts: SentimentCounts::new(entity_id.clone()),
            counts_loaded: false,
            entity_id,
            seen_comments: LruCache::new(seen_capacity),
            series: HashMap::new(),
            trends: HashMap::new(),
            pending: Vec::new(),
            warmed: false,
            last_active: None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if self.last_active.is_none_or(|last| last < now) {
            self.last_active = Some(now);
        }
    }

    /// Nothing open, nothing pending, and untouched for `ttl` at `now`.
    fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        self.pending.is_empty()
            && self.series.values().all(|s| s.open_value().is_none())
            && self
                .last_active
                .is_none_or(|last| last.checked_add_signed(ttl).is_some_and(|expiry| expiry <= now))
    }

    fn series_mut(&mut self, metric: Metric, width: Duration) -> &mut MetricSeries {
        let entity_id = &self.entity_id;
        self.series
            .entry(metric)
            .or_insert_with(|| MetricSeries::new(entity_id.clone(), metric, width))
    }

    /// Queue a frozen bucket for persistence and fold it into its trend.
    fn absorb_closed(&mut self, snapshot: AnalyticsSnapshot, window: Duration) {
        if snapshot.metric.is_trend_source() {
            let trend = self
                .trends
                .entry(snapshot.metric)
                .or_insert_with(|| TrendAccumulator::new(window));
            let score = trend.fold(snapshot.bucket_start, snapshot.value);
            if let (Some(score), true) = (score, snapshot.metric == PERSISTED_TREND_SOURCE) {
                self.pending.push(AnalyticsSnapshot {
                    entity_id: snapshot.entity_id.clone(),
                    bucket_start: snapshot.bucket_start,
                    bucket_width: snapshot.bucket_width,
                    metric: Metric::TrendScore,
                    value: score,
                });
            }
        }
        self.pending.push(snapshot);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Folds job results into per-entity rolling statistics.
///
/// Updates for one entity are serialized behind that entity's lock; different
/// entities proceed concurrently.
pub struct AnalyticsAggregator {
    repository: Arc<dyn Repository>,
    classifier: Arc<dyn SentimentClassifier>,
    cache: Arc<CacheManager>,
    config: AggregatorConfig,
    entities: Mutex<HashMap<EntityId, Arc<Mutex<EntityState>>>>,
}

impl core::fmt::Debug for AnalyticsAggregator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnalyticsAggregator")
            .field("config", &self.config)
            .field("entities", &lock(&self.entities).len())
            .finish_non_exhaustive()
    }
}

impl AnalyticsAggregator {
    pub fn new(
        repository: Arc<dyn Repository>,
        classifier: Arc<dyn SentimentClassifier>,
        cache: Arc<CacheManager>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            repository,
            classifier,
            cache,
            config,
            entities: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn entity(&self, entity_id: &EntityId) -> Arc<Mutex<EntityState>> {
        lock(&self.entities)
            .entry(entity_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(EntityState::new(
                    entity_id.clone(),
                    self.config.seen_comments_per_entity,
                )))
            })
            .clone()
    }

    fn existing(&self, entity_id: &EntityId) -> Option<Arc<Mutex<EntityState>>> {
        lock(&self.entities).get(entity_id).cloned()
    }

    /// Classify and count a batch of comments for `entity_id`.
    ///
    /// Each comment is counted at most once per entity, within a window of the
    /// most recent `seen_comments_per_entity` ids. A comment whose
    /// classification fails is logged, excluded, and left eligible for a later
    /// batch; the rest of the batch still counts.
    pub fn ingest_comments(
        &self,
        entity_id: &EntityId,
        comments: &[Comment],
        now: DateTime<Utc>,
    ) -> Result<BatchReport, AggregationError> {
        let entity = self.entity(entity_id);
        let mut report = BatchReport::default();

        let candidates: Vec<&Comment> = {
            let state = lock(&entity);
            let mut batch_ids = HashSet::new();
            comments
                .iter()
                .filter(|c| {
                    let fresh = !state.seen_comments.contains(&c.id) && batch_ids.insert(c.id.as_str());
                    if !fresh {
                        report.skipped_duplicates += 1;
                    }
                    fresh
                })
                .collect()
        };

        let mut labelled = Vec::with_capacity(candidates.len());
        for comment in candidates {
            match self.classify(&comment.text) {
                Ok(label) => labelled.push((comment.id.as_str(), label)),
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        entity_id = %entity_id,
                        comment_id = %comment.id,
                        error = %e,
                        "classification failed; comment excluded from batch"
                    );
                }
            }
        }

        let mut state = lock(&entity);
        self.load_counts(&mut state)?;
        self.warm(&mut state, now);
        state.touch(now);

        let mut tally = SentimentCounts::new(entity_id.clone());
        for (comment_id, label) in labelled {
            if state.seen_comments.put(comment_id.to_string(), ()).is_none() {
                tally.record(label);
                report.classified += 1;
            } else {
                // A concurrent batch counted it while we were classifying.
                report.skipped_duplicates += 1;
            }
        }
        state.counts.absorb(&tally);

        let width = self.config.bucket_width;
        for label in SentimentLabel::ALL {
            let n = tally.get(label);
            if n == 0 {
                continue;
            }
            match state.series_mut(Metric::sentiment(label), width).record(now, n as f64, now) {
                Ok(Some(closed)) => state.absorb_closed(closed, self.config.trend_window),
                Ok(None) => {}
                Err(e) => warn!(entity_id = %entity_id, error = %e, "sentiment bucket rejected update"),
            }
        }

        self.repository.save_sentiment_counts(&state.counts)?;
        self.flush(&mut state)?;

        debug!(
            entity_id = %entity_id,
            classified = report.classified,
            skipped = report.skipped_duplicates,
            failed = report.failed,
            "comment batch folded"
        );
        Ok(report)
    }

    /// Reset the sentiment counters for `entity_id` and rebuild them from `comments`.
    pub fn recompute_sentiment(
        &self,
        entity_id: &EntityId,
        comments: &[Comment],
        now: DateTime<Utc>,
    ) -> Result<BatchReport, AggregationError> {
        {
            let entity = self.entity(entity_id);
            let mut state = lock(&entity);
            state.counts = SentimentCounts::new(entity_id.clone());
            state.counts_loaded = true;
            state.seen_comments.clear();
        }
        info!(entity_id = %entity_id, comments = comments.len(), "recomputing sentiment");
        self.ingest_comments(entity_id, comments, now)
    }

    fn classify(&self, text: &str) -> Result<SentimentLabel, CacheError> {
        let key = tubewatch_core::Fingerprint::for_text(text);
        let classification: Classification =
            self.cache
                .get_or_compute_as(&key, self.config.classification_ttl, || {
                    self.classifier.classify(text).map_err(|e| match e {
                        ClassifierError::EmptyText => ComputeError::permanent(e.to_string()),
                        ClassifierError::Failed(_) => ComputeError::transient(e.to_string()),
                    })
                })?;
        Ok(classification.label)
    }

    /// Fold metric readings into their buckets as seen at `now`.
    ///
    /// Readings for a frozen bucket are counted as late and dropped.
    pub fn record_metrics(
        &self,
        readings: &[MetricReading],
        now: DateTime<Utc>,
    ) -> Result<MetricsReport, AggregationError> {
        let mut by_entity: HashMap<&EntityId, Vec<&MetricReading>> = HashMap::new();
        for reading in readings {
            by_entity.entry(&reading.entity_id).or_default().push(reading);
        }

        let mut report = MetricsReport::default();
        let mut first_error = None;

        for (entity_id, readings) in by_entity {
            let entity = self.entity(entity_id);
            let mut state = lock(&entity);
            self.warm(&mut state, now);
            state.touch(now);

            for reading in readings {
                let series = state.series_mut(reading.metric, self.config.bucket_width);
                match series.record(reading.observed_at, reading.value, now) {
                    Ok(closed) => {
                        report.recorded += 1;
                        if let Some(closed) = closed {
                            report.closed += 1;
                            state.absorb_closed(closed, self.config.trend_window);
                        }
                    }
                    Err(e @ AggregationError::FutureReading { .. }) => {
                        report.future += 1;
                        debug!(entity_id = %entity_id, metric = %reading.metric, error = %e, "future reading dropped");
                    }
                    Err(e) => {
                        report.late += 1;
                        debug!(entity_id = %entity_id, metric = %reading.metric, error = %e, "late reading dropped");
                    }
                }
            }

            if let Err(e) = self.flush(&mut state) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Freeze every open bucket whose window has elapsed at `now` and persist it,
    /// then drop entities that have gone idle.
    ///
    /// Returns the number of snapshots the repository accepted.
    pub fn close_elapsed(&self, now: DateTime<Utc>) -> Result<usize, AggregationError> {
        let entities: Vec<Arc<Mutex<EntityState>>> = lock(&self.entities).values().cloned().collect();
        let mut saved = 0;
        let mut first_error = None;

        for entity in entities {
            let mut state = lock(&entity);
            let mut metrics: Vec<Metric> = state.series.keys().copied().collect();
            metrics.sort();
            for metric in metrics {
                let closed = state.series.get_mut(&metric).and_then(|s| s.close_elapsed(now));
                if let Some(closed) = closed {
                    state.absorb_closed(closed, self.config.trend_window);
                }
            }
            match self.flush(&mut state) {
                Ok(n) => saved += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.evict_idle(now);

        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Forget entities nobody holds that have nothing open or pending.
    ///
    /// Their totals, frozen-bucket marks and trends come back from the
    /// repository on next use; remembered comment ids do not.
    fn evict_idle(&self, now: DateTime<Utc>) {
        let ttl = self.config.entity_idle_ttl;
        let mut entities = lock(&self.entities);
        let before = entities.len();
        // Holding the map lock, a count of one means no caller can reach the entry.
        entities.retain(|_, entity| Arc::strong_count(entity) > 1 || !lock(entity).is_idle(now, ttl));
        let evicted = before - entities.len();
        if evicted > 0 {
            debug!(evicted, remaining = entities.len(), "idle entities evicted");
        }
    }

    /// Persist pending snapshots in order, stopping at the first transient failure.
    fn flush(&self, state: &mut EntityState) -> Result<usize, AggregationError> {
        let mut saved = 0;
        while !state.pending.is_empty() {
            match self.repository.save_snapshot(&state.pending[0]) {
                Ok(()) => {
                    state.pending.remove(0);
                    saved += 1;
                }
                Err(RepositoryError::Unavailable(msg)) => {
                    warn!(
                        entity_id = %state.entity_id,
                        pending = state.pending.len(),
                        error = %msg,
                        "snapshot write deferred"
                    );
                    return Err(RepositoryError::Unavailable(msg).into());
                }
                Err(e) => {
                    let dropped = state.pending.remove(0);
                    error!(
                        entity_id = %state.entity_id,
                        metric = %dropped.metric,
                        bucket_start = %dropped.bucket_start,
                        error = %e,
                        "snapshot write refused; dropping"
                    );
                }
            }
        }
        Ok(saved)
    }

    /// Resume sentiment totals persisted before this entity was last evicted.
    fn load_counts(&self, state: &mut EntityState) -> Result<(), AggregationError> {
        if state.counts_loaded {
            return Ok(());
        }
        if let Some(persisted) = self.repository.load_sentiment_counts(&state.entity_id)? {
            debug!(entity_id = %state.entity_id, total = persisted.total(), "sentiment totals resumed");
            state.counts.absorb(&persisted);
        }
        state.counts_loaded = true;
        Ok(())
    }

    /// Seed trend accumulators and frozen-bucket marks from persisted snapshots.
    fn warm(&self, state: &mut EntityState, now: DateTime<Utc>) {
        if state.warmed {
            return;
        }
        let lookback = self.config.trend_window + self.config.bucket_width;
        let mut snapshots = match self.repository.load_recent_snapshots(&state.entity_id, lookback, now) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(entity_id = %state.entity_id, error = %e, "warm start skipped");
                return;
            }
        };
        state.warmed = true;
        snapshots.sort_by_key(|s| s.bucket_start);

        let width = self.config.bucket_width;
        let window = self.config.trend_window;
        for snapshot in &snapshots {
            if snapshot.metric == Metric::TrendScore {
                continue;
            }
            state.series_mut(snapshot.metric, width).resume_after(snapshot.bucket_start);
            if snapshot.metric.is_trend_source() {
                state
                    .trends
                    .entry(snapshot.metric)
                    .or_insert_with(|| TrendAccumulator::new(window))
                    .fold(snapshot.bucket_start, snapshot.value);
            }
        }
        if !snapshots.is_empty() {
            debug!(entity_id = %state.entity_id, snapshots = snapshots.len(), "warm start from repository");
        }
    }

    pub fn sentiment(&self, entity_id: &EntityId) -> Option<SentimentCounts> {
        let entity = self.existing(entity_id)?;
        let counts = lock(&entity).counts.clone();
        Some(counts)
    }

    /// Current trend score of `metric`, as of its newest closed bucket.
    pub fn trend_score(&self, entity_id: &EntityId, metric: Metric) -> Option<f64> {
        let entity = self.existing(entity_id)?;
        let state = lock(&entity);
        state.trends.get(&metric).map(TrendAccumulator::score)
    }

    /// Value of the currently open bucket for `metric`.
    pub fn open_value(&self, entity_id: &EntityId, metric: Metric) -> Option<f64> {
        let entity = self.existing(entity_id)?;
        let state = lock(&entity);
        state.series.get(&metric).and_then(MetricSeries::open_value)
    }

    /// Snapshots closed but not yet persisted, across all entities.
    pub fn pending_writes(&self) -> usize {
        let entities: Vec<_> = lock(&self.entities).values().cloned().collect();
        entities.iter().map(|e| lock(e).pending.len()).sum()
    }

    pub fn tracked_entities(&self) -> usize {
        lock(&self.entities).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::TimeZone;
    use proptest::prelude::*;
    use tubewatch_cache::CacheConfig;
    use tubewatch_core::Channel;

    use super::*;

    #[derive(Default)]
    struct MemoryRepo {
        snapshots: Mutex<Vec<AnalyticsSnapshot>>,
        counts: Mutex<HashMap<EntityId, SentimentCounts>>,
        offline: AtomicBool,
    }

    impl Repository for MemoryRepo {
        fn save_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<(), RepositoryError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable("offline".into()));
            }
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        fn save_comment(&self, _comment: &Comment) -> Result<(), RepositoryError> {
            Ok(())
        }

        fn load_recent_snapshots(
            &self,
            entity_id: &EntityId,
            window: Duration,
            until: DateTime<Utc>,
        ) -> Result<Vec<AnalyticsSnapshot>, RepositoryError> {
            let from = until - chrono::Duration::from_std(window).unwrap();
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .filter(|s| &s.entity_id == entity_id && s.bucket_start >= from && s.bucket_start < until)
                .cloned()
                .collect())
        }

        fn save_channel(&self, _channel: &Channel) -> Result<(), RepositoryError> {
            Ok(())
        }

        fn save_video(&self, _video: &tubewatch_core::Video) -> Result<(), RepositoryError> {
            Ok(())
        }

        fn save_sentiment_counts(&self, counts: &SentimentCounts) -> Result<(), RepositoryError> {
            self.counts.lock().unwrap().insert(counts.entity_id.clone(), counts.clone());
            Ok(())
        }

        fn load_sentiment_counts(&self, entity_id: &EntityId) -> Result<Option<SentimentCounts>, RepositoryError> {
            Ok(self.counts.lock().unwrap().get(entity_id).cloned())
        }
    }

    /// Labels by leading word; text starting with "ERR" fails.
    #[derive(Default)]
    struct PrefixClassifier {
        calls: AtomicUsize,
    }

    impl SentimentClassifier for PrefixClassifier {
        fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.starts_with("ERR") {
                return Err(ClassifierError::Failed("model exploded".into()));
            }
            let label = SentimentLabel::from_model_label(text.split(':').next().unwrap_or_default());
            Ok(Classification::new(label, 0.9))
        }
    }

    struct Fixture {
        repo: Arc<MemoryRepo>,
        classifier: Arc<PrefixClassifier>,
        aggregator: AnalyticsAggregator,
    }

    fn fixture() -> Fixture {
        fixture_with(AggregatorConfig::default())
    }

    fn fixture_with(config: AggregatorConfig) -> Fixture {
        let repo = Arc::new(MemoryRepo::default());
        let classifier = Arc::new(PrefixClassifier::default());
        let aggregator = AnalyticsAggregator::new(
            repo.clone(),
            classifier.clone(),
            CacheManager::arc(CacheConfig::default()),
            config,
        );
        Fixture {
            repo,
            classifier,
            aggregator,
        }
    }

    fn vid() -> EntityId {
        EntityId::parse("video-1").unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn comment(id: usize, text: &str) -> Comment {
        Comment {
            id: format!("c{id}"),
            video_id: vid(),
            author: "viewer".into(),
            text: text.to_string(),
            like_count: 0,
            published_at: at(9, 0),
        }
    }

    /// 600 positive, 300 neutral, 100 negative, interleaved.
    fn thousand_comments() -> Vec<Comment> {
        (0..1000)
            .map(|i| {
                let label = match i % 10 {
                    0..=5 => "positive",
                    6..=8 => "neutral",
                    _ => "negative",
                };
                comment(i, &format!("{label}: comment number {i}"))
            })
            .collect()
    }

    #[test]
    fn split_batches_sum_to_the_same_counts() {
        let f = fixture();
        let comments = thousand_comments();

        let first = f.aggregator.ingest_comments(&vid(), &comments[..400], at(10, 0)).unwrap();
        let second = f.aggregator.ingest_comments(&vid(), &comments[400..], at(10, 5)).unwrap();
        assert_eq!(first.classified + second.classified, 1000);

        let counts = f.aggregator.sentiment(&vid()).unwrap();
        assert_eq!((counts.positive, counts.negative, counts.neutral), (600, 100, 300));
        assert_eq!(f.repo.counts.lock().unwrap()[&vid()], counts);
        assert_eq!(f.aggregator.open_value(&vid(), Metric::SentimentPositive), Some(600.0));
    }

    #[test]
    fn identical_text_is_classified_once() {
        let f = fixture();
        let comments: Vec<_> = (0..5).map(|i| comment(i, "positive: same words")).collect();

        let report = f.aggregator.ingest_comments(&vid(), &comments, at(10, 0)).unwrap();

        assert_eq!(report.classified, 5);
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.aggregator.sentiment(&vid()).unwrap().positive, 5);
    }

    #[test]
    fn failing_comment_is_excluded_and_batch_continues() {
        let f = fixture();
        let comments = vec![
            comment(1, "positive: great"),
            comment(2, "ERR: unparseable"),
            comment(3, "negative: meh"),
        ];

        let report = f.aggregator.ingest_comments(&vid(), &comments, at(10, 0)).unwrap();

        assert_eq!(report.classified, 2);
        assert_eq!(report.failed, 1);
        let counts = f.aggregator.sentiment(&vid()).unwrap();
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn redelivered_batch_is_not_double_counted() {
        let f = fixture();
        let comments = thousand_comments();

        f.aggregator.ingest_comments(&vid(), &comments[..100], at(10, 0)).unwrap();
        let again = f.aggregator.ingest_comments(&vid(), &comments[..100], at(10, 1)).unwrap();

        assert_eq!(again.classified, 0);
        assert_eq!(again.skipped_duplicates, 100);
        assert_eq!(f.aggregator.sentiment(&vid()).unwrap().total(), 100);
    }

    #[test]
    fn recompute_resets_counts() {
        let f = fixture();
        let comments = thousand_comments();
        f.aggregator.ingest_comments(&vid(), &comments[..10], at(10, 0)).unwrap();

        let report = f
            .aggregator
            .recompute_sentiment(&vid(), &comments[..4], at(10, 30))
            .unwrap();

        assert_eq!(report.classified, 4);
        assert_eq!(f.aggregator.sentiment(&vid()).unwrap().total(), 4);
    }

    #[test]
    fn remembered_comment_ids_stay_within_window() {
        let f = fixture_with(AggregatorConfig {
            seen_comments_per_entity: 100,
            ..AggregatorConfig::default()
        });
        let comments = thousand_comments();

        let report = f.aggregator.ingest_comments(&vid(), &comments, at(10, 0)).unwrap();
        assert_eq!(report.classified, 1000);
        let entity = f.aggregator.existing(&vid()).unwrap();
        assert_eq!(lock(&entity).seen_comments.len(), 100);

        // The newest ids are still recognised.
        let again = f.aggregator.ingest_comments(&vid(), &comments[900..], at(10, 5)).unwrap();
        assert_eq!(again.skipped_duplicates, 100);
        assert_eq!(f.aggregator.sentiment(&vid()).unwrap().total(), 1000);
    }

    #[test]
    fn idle_entities_are_evicted_and_totals_resume() {
        let f = fixture_with(AggregatorConfig {
            entity_idle_ttl: Duration::from_secs(3600),
            ..AggregatorConfig::default()
        });
        let comments = thousand_comments();
        f.aggregator.ingest_comments(&vid(), &comments[..400], at(10, 0)).unwrap();

        // Sentiment bucket still open.
        f.aggregator.close_elapsed(at(10, 30)).unwrap();
        assert_eq!(f.aggregator.tracked_entities(), 1);

        f.aggregator.close_elapsed(at(11, 0)).unwrap();
        assert_eq!(f.aggregator.tracked_entities(), 0);
        assert!(f.aggregator.sentiment(&vid()).is_none());

        f.aggregator.ingest_comments(&vid(), &comments[400..], at(11, 30)).unwrap();
        let counts = f.aggregator.sentiment(&vid()).unwrap();
        assert_eq!((counts.positive, counts.negative, counts.neutral), (600, 100, 300));
        assert_eq!(f.repo.counts.lock().unwrap()[&vid()], counts);
    }

    #[test]
    fn recent_activity_keeps_entity_tracked() {
        let f = fixture_with(AggregatorConfig {
            entity_idle_ttl: Duration::from_secs(2 * 3600),
            ..AggregatorConfig::default()
        });
        f.aggregator.ingest_comments(&vid(), &thousand_comments()[..10], at(10, 0)).unwrap();

        f.aggregator.close_elapsed(at(11, 0)).unwrap();
        assert_eq!(f.aggregator.tracked_entities(), 1);
        f.aggregator.close_elapsed(at(12, 0)).unwrap();
        assert_eq!(f.aggregator.tracked_entities(), 0);
    }

    fn views(value: f64, observed: DateTime<Utc>) -> MetricReading {
        MetricReading::new(vid(), Metric::Views, value, observed)
    }

    #[test]
    fn closed_buckets_are_persisted_with_trend_score() {
        let f = fixture();
        f.aggregator.record_metrics(&[views(100.0, at(10, 10))], at(10, 10)).unwrap();
        f.aggregator.record_metrics(&[views(250.0, at(11, 10))], at(11, 10)).unwrap();
        let saved = f.aggregator.close_elapsed(at(12, 0)).unwrap();

        // 11:00 views + trend
        assert_eq!(saved, 2);
        let snapshots = f.repo.snapshots.lock().unwrap().clone();
        let views_saved: Vec<f64> = snapshots
            .iter()
            .filter(|s| s.metric == Metric::Views)
            .map(|s| s.value)
            .collect();
        assert_eq!(views_saved, vec![100.0, 250.0]);
        assert_eq!(f.aggregator.trend_score(&vid(), Metric::Views), Some(150.0));
        let trend = snapshots.iter().rfind(|s| s.metric == Metric::TrendScore).unwrap();
        assert_eq!(trend.value, 150.0);
    }

    #[test]
    fn frozen_bucket_ignores_late_readings() {
        let f = fixture();
        f.aggregator.record_metrics(&[views(100.0, at(10, 10))], at(10, 10)).unwrap();
        f.aggregator.close_elapsed(at(11, 0)).unwrap();

        let report = f.aggregator.record_metrics(&[views(999.0, at(10, 50))], at(11, 2)).unwrap();

        assert_eq!(report.late, 1);
        let frozen: Vec<_> = f
            .repo
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.metric == Metric::Views)
            .map(|s| s.value)
            .collect();
        assert_eq!(frozen, vec![100.0]);
    }

    #[test]
    fn unavailable_repository_keeps_writes_pending() {
        let f = fixture();
        f.aggregator.record_metrics(&[views(100.0, at(10, 10))], at(10, 10)).unwrap();

        f.repo.offline.store(true, Ordering::SeqCst);
        let err = f.aggregator.close_elapsed(at(11, 0)).unwrap_err();
        assert!(err.is_transient());
        // views bucket plus its trend score
        assert_eq!(f.aggregator.pending_writes(), 2);

        f.repo.offline.store(false, Ordering::SeqCst);
        assert_eq!(f.aggregator.close_elapsed(at(11, 1)).unwrap(), 2);
        assert_eq!(f.aggregator.pending_writes(), 0);
    }

    #[test]
    fn warm_start_resumes_trend_from_repository() {
        let f = fixture();
        f.repo
            .save_snapshot(&AnalyticsSnapshot {
                entity_id: vid(),
                bucket_start: at(9, 0),
                bucket_width: Duration::from_secs(3600),
                metric: Metric::Views,
                value: 40.0,
            })
            .unwrap();

        f.aggregator.record_metrics(&[views(100.0, at(10, 10))], at(10, 10)).unwrap();
        f.aggregator.close_elapsed(at(11, 0)).unwrap();

        assert_eq!(f.aggregator.trend_score(&vid(), Metric::Views), Some(60.0));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn counts_do_not_depend_on_batch_split(split in 0usize..=1000) {
            let f = fixture();
            let comments = thousand_comments();

            f.aggregator.ingest_comments(&vid(), &comments[..split], at(10, 0)).unwrap();
            f.aggregator.ingest_comments(&vid(), &comments[split..], at(10, 1)).unwrap();

            let counts = f.aggregator.sentiment(&vid()).unwrap();
            prop_assert_eq!((counts.positive, counts.negative, counts.neutral), (600, 100, 300));
        }
    }
}
