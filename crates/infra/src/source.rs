//! Content source adapters: a fixture-backed source and a rate-limited wrapper.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use tubewatch_core::{Channel, Comment, ContentSource, EntityId, SourceError, Video};

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to read fixtures {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid fixture catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything a [`FixtureSource`] can serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureCatalog {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub videos: Vec<Video>,
    /// Comments keyed by video id
    #[serde(default)]
    pub comments: HashMap<EntityId, Vec<Comment>>,
    /// Trending video ids keyed by region code
    #[serde(default)]
    pub trending: HashMap<String, Vec<EntityId>>,
}

/// Serves a static catalog as if it were the live platform.
///
/// Every successful fetch restamps `fetched_at` with the current time. Fetches
/// are counted per target so callers can assert how often the platform was hit.
#[derive(Debug, Default)]
pub struct FixtureSource {
    channels: HashMap<EntityId, Channel>,
    videos: HashMap<EntityId, Video>,
    comments: HashMap<EntityId, Vec<Comment>>,
    trending: HashMap<String, Vec<EntityId>>,
    latency: Duration,
    fetches: Mutex<HashMap<String, u64>>,
    total_fetches: AtomicU64,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
}

impl FixtureSource {
    pub fn new(catalog: FixtureCatalog) -> Self {
        Self {
            channels: catalog.channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
            videos: catalog.videos.into_iter().map(|v| (v.id.clone(), v)).collect(),
            comments: catalog.comments,
            trending: catalog.trending,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, FixtureError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Simulated round-trip time per fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next fetch of `target` (an entity id or region) with `error`.
    /// Queued failures are consumed in order.
    pub fn fail_next(&self, target: &str, error: SourceError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fetch attempts that reached `target`, failed ones included.
    pub fn fetch_count(&self, target: &str) -> u64 {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::Relaxed)
    }

    fn begin(&self, target: &str) -> Result<(), SourceError> {
        *self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.to_string())
            .or_default() += 1;
        self.total_fetches.fetch_add(1, Ordering::Relaxed);

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn video_now(&self, id: &EntityId) -> Option<Video> {
        self.videos.get(id).map(|v| Video {
            fetched_at: Utc::now(),
            ..v.clone()
        })
    }
}

impl ContentSource for FixtureSource {
    fn fetch_channel(&self, channel_id: &EntityId) -> Result<Channel, SourceError> {
        self.begin(channel_id.as_str())?;
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| SourceError::NotFound(format!("channel {channel_id}")))?;
        Ok(Channel {
            fetched_at: Utc::now(),
            ..channel.clone()
        })
    }

    fn fetch_video(&self, video_id: &EntityId) -> Result<Video, SourceError> {
        self.begin(video_id.as_str())?;
        self.video_now(video_id)
            .ok_or_else(|| SourceError::NotFound(format!("video {video_id}")))
    }

    fn fetch_comments(&self, video_id: &EntityId, limit: usize) -> Result<Vec<Comment>, SourceError> {
        self.begin(&format!("comments:{video_id}"))?;
        if !self.videos.contains_key(video_id) {
            return Err(SourceError::NotFound(format!("video {video_id}")));
        }
        let mut comments = self.comments.get(video_id).cloned().unwrap_or_default();
        comments.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        comments.truncate(limit);
        Ok(comments)
    }

    fn fetch_trending(&self, region: &str, limit: usize) -> Result<Vec<Video>, SourceError> {
        self.begin(&format!("trending:{region}"))?;
        let ids = self
            .trending
            .get(region)
            .ok_or_else(|| SourceError::NotFound(format!("trending list for {region}")))?;
        Ok(ids.iter().filter_map(|id| self.video_now(id)).take(limit).collect())
    }
}

/// Permit budget for a content source: a burst of `capacity`, refilled at `refill_per_sec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size
    pub capacity: u32,
    pub refill_per_sec: f64,
    /// Longest a caller waits for a token before failing with `RateLimited`
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 5.0,
            max_wait: Duration::from_secs(2),
        }
    }
}

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

fn quota_for(config: &RateLimitConfig) -> Quota {
    let burst = NonZeroU32::new(config.capacity).unwrap_or(NonZeroU32::MIN);
    let period = if config.refill_per_sec.is_finite() && config.refill_per_sec > 0.0 {
        Duration::from_secs_f64((1.0 / config.refill_per_sec).min(MAX_REFILL_PERIOD_SECS))
    } else {
        Duration::from_secs_f64(MAX_REFILL_PERIOD_SECS)
    };
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst)
}

/// Slowest refill accepted; anything slower is clamped to one permit a day.
const MAX_REFILL_PERIOD_SECS: f64 = 86_400.0;

/// Wraps a source so every fetch needs a permit from a direct (unkeyed) limiter.
pub struct RateLimitedSource<S> {
    inner: S,
    limiter: DirectLimiter,
    clock: DefaultClock,
    max_wait: Duration,
}

impl<S: core::fmt::Debug> core::fmt::Debug for RateLimitedSource<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimitedSource")
            .field("inner", &self.inner)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl<S: ContentSource> RateLimitedSource<S> {
    pub fn new(inner: S, config: &RateLimitConfig) -> Self {
        Self {
            inner,
            limiter: GovernorRateLimiter::direct(quota_for(config)),
            clock: DefaultClock::default(),
            max_wait: config.max_wait,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Take one permit, sleeping up to `max_wait` for it.
    fn acquire(&self) -> Result<(), Duration> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let wait = match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            };
            let wait = wait.max(Duration::from_millis(1));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || wait > remaining {
                return Err(wait);
            }
            thread::sleep(wait);
        }
    }

    fn permit(&self, operation: &str) -> Result<(), SourceError> {
        self.acquire().map_err(|retry_after| {
            warn!(operation, retry_after_ms = retry_after.as_millis() as u64, "content source rate limited");
            SourceError::RateLimited {
                retry_after: Some(retry_after),
            }
        })?;
        debug!(operation, "content source permit granted");
        Ok(())
    }
}

impl<S: ContentSource> ContentSource for RateLimitedSource<S> {
    fn fetch_channel(&self, channel_id: &EntityId) -> Result<Channel, SourceError> {
        self.permit("fetch_channel")?;
        self.inner.fetch_channel(channel_id)
    }

    fn fetch_video(&self, video_id: &EntityId) -> Result<Video, SourceError> {
        self.permit("fetch_video")?;
        self.inner.fetch_video(video_id)
    }

    fn fetch_comments(&self, video_id: &EntityId, limit: usize) -> Result<Vec<Comment>, SourceError> {
        self.permit("fetch_comments")?;
        self.inner.fetch_comments(video_id, limit)
    }

    fn fetch_trending(&self, region: &str, limit: usize) -> Result<Vec<Video>, SourceError> {
        self.permit("fetch_trending")?;
        self.inner.fetch_trending(region, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "channels": [{"id": "ch1", "title": "Channel", "subscriber_count": 10, "recent_video_ids": ["v1", "v2"]}],
        "videos": [
            {"id": "v1", "channel_id": "ch1", "title": "One", "view_count": 100},
            {"id": "v2", "channel_id": "ch1", "title": "Two", "view_count": 50}
        ],
        "comments": {
            "v1": [
                {"id": "c1", "video_id": "v1", "text": "old", "published_at": "2024-01-01T00:00:00Z"},
                {"id": "c2", "video_id": "v1", "text": "new", "published_at": "2024-01-02T00:00:00Z"}
            ]
        },
        "trending": {"US": ["v2", "v1", "missing"]}
    }"#;

    fn id(raw: &str) -> EntityId {
        EntityId::parse(raw).unwrap()
    }

    #[test]
    fn fixture_serves_catalog_and_counts_fetches() {
        let source = FixtureSource::from_json_str(CATALOG).unwrap();

        let channel = source.fetch_channel(&id("ch1")).unwrap();
        assert_eq!(channel.recent_video_ids, vec![id("v1"), id("v2")]);

        let comments = source.fetch_comments(&id("v1"), 1).unwrap();
        assert_eq!(comments[0].id, "c2");

        let trending = source.fetch_trending("US", 10).unwrap();
        let ids: Vec<&str> = trending.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v2", "v1"]);

        source.fetch_video(&id("v1")).unwrap();
        source.fetch_video(&id("v1")).unwrap();
        assert_eq!(source.fetch_count("v1"), 2);
        assert_eq!(source.total_fetches(), 5);
    }

    #[test]
    fn unknown_entities_are_not_found() {
        let source = FixtureSource::from_json_str(CATALOG).unwrap();
        let err = source.fetch_video(&id("nope")).unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let source = FixtureSource::from_json_str(CATALOG).unwrap();
        source.fail_next("v1", SourceError::Timeout("slow".into()));
        source.fail_next("v1", SourceError::Unavailable("503".into()));

        assert!(matches!(source.fetch_video(&id("v1")), Err(SourceError::Timeout(_))));
        assert!(matches!(source.fetch_video(&id("v1")), Err(SourceError::Unavailable(_))));
        assert!(source.fetch_video(&id("v1")).is_ok());
    }

    #[test]
    fn burst_is_spent_then_refilled() {
        let source = RateLimitedSource::new(
            FixtureSource::from_json_str(CATALOG).unwrap(),
            &RateLimitConfig {
                capacity: 2,
                refill_per_sec: 50.0,
                max_wait: Duration::ZERO,
            },
        );
        assert!(source.fetch_video(&id("v1")).is_ok());
        assert!(source.fetch_video(&id("v1")).is_ok());
        match source.fetch_video(&id("v1")) {
            Err(SourceError::RateLimited { retry_after: Some(wait) }) => assert!(wait <= Duration::from_millis(20)),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // A bounded wait covers one refill period.
        let patient = RateLimitedSource::new(
            FixtureSource::from_json_str(CATALOG).unwrap(),
            &RateLimitConfig {
                capacity: 1,
                refill_per_sec: 50.0,
                max_wait: Duration::from_millis(200),
            },
        );
        assert!(patient.fetch_video(&id("v1")).is_ok());
        assert!(patient.fetch_video(&id("v1")).is_ok());
        assert_eq!(patient.inner().fetch_count("v1"), 2);
    }

    #[test]
    fn rate_limited_source_fails_transiently_when_drained() {
        let source = RateLimitedSource::new(
            FixtureSource::from_json_str(CATALOG).unwrap(),
            &RateLimitConfig {
                capacity: 1,
                refill_per_sec: 0.01,
                max_wait: Duration::from_millis(10),
            },
        );
        assert!(source.fetch_video(&id("v1")).is_ok());

        let err = source.fetch_video(&id("v1")).unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { retry_after: Some(_) }));
        assert!(err.is_transient());
        assert_eq!(source.inner().fetch_count("v1"), 1);
    }
}
