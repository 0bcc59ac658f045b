//! Handlers for the four ingestion job kinds.
//!
//! Every external fetch goes through the pool-wide cache keyed on what is
//! fetched, so duplicate jobs inside the TTL share one request. Handler
//! outputs are built from the fetched data only; two jobs served by the same
//! cached fetch report identical payloads.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use tubewatch_analytics::AnalyticsAggregator;
use tubewatch_cache::ComputeError;
use tubewatch_core::{Channel, Comment, ContentSource, EntityId, Fingerprint, Repository, SourceError, Video};

use crate::jobs::{HandlerRegistry, JobContext, JobEnvelope, JobError, JobKind};

fn default_video_limit() -> usize {
    5
}

fn default_comment_limit() -> usize {
    100
}

fn default_region() -> String {
    "US".to_string()
}

fn default_trending_limit() -> usize {
    50
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeChannelPayload {
    pub channel_id: EntityId,
    /// How many recent uploads get a follow-up `scrape_video`
    #[serde(default = "default_video_limit")]
    pub video_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeVideoPayload {
    pub video_id: EntityId,
    /// Enqueue `analyze_comments` after the fetch
    #[serde(default = "default_true")]
    pub include_comments: bool,
    #[serde(default = "default_comment_limit")]
    pub comment_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeCommentsPayload {
    pub video_id: EntityId,
    #[serde(default = "default_comment_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTrendingPayload {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_trending_limit")]
    pub limit: usize,
    /// Enqueue `scrape_video` (with comments) for every trending video
    #[serde(default)]
    pub scrape_videos: bool,
}

impl Default for RefreshTrendingPayload {
    fn default() -> Self {
        Self {
            region: default_region(),
            limit: default_trending_limit(),
            scrape_videos: false,
        }
    }
}

/// Collaborators shared by all handlers.
#[derive(Clone)]
pub struct HandlerDeps {
    pub source: Arc<dyn ContentSource>,
    pub repository: Arc<dyn Repository>,
    pub aggregator: Arc<AnalyticsAggregator>,
    /// Memo lifetime for channel, video and trending fetches
    pub fetch_ttl: Duration,
    pub comments_ttl: Duration,
}

/// Build the dispatch table for every [`JobKind`].
pub fn registry(deps: HandlerDeps) -> HandlerRegistry {
    let deps = Arc::new(deps);
    let mut registry = HandlerRegistry::new();

    let d = deps.clone();
    registry.register(JobKind::ScrapeChannel, move |ctx| scrape_channel(&d, ctx));
    let d = deps.clone();
    registry.register(JobKind::ScrapeVideo, move |ctx| scrape_video(&d, ctx));
    let d = deps.clone();
    registry.register(JobKind::AnalyzeComments, move |ctx| analyze_comments(&d, ctx));
    let d = deps;
    registry.register(JobKind::RefreshTrending, move |ctx| refresh_trending(&d, ctx));

    registry
}

fn compute_error(e: SourceError) -> ComputeError {
    if e.is_transient() {
        ComputeError::transient(e.to_string())
    } else {
        ComputeError::permanent(e.to_string())
    }
}

fn fetch_key(what: &str, target: &str) -> Fingerprint {
    Fingerprint::for_job(what, target.as_bytes())
}

fn scrape_channel(deps: &HandlerDeps, ctx: &JobContext<'_>) -> Result<Value, JobError> {
    let payload: ScrapeChannelPayload = ctx.payload()?;
    let id = &payload.channel_id;
    ctx.checkpoint()?;

    let channel: Channel = ctx.memoize(&fetch_key("fetch_channel", id.as_str()), deps.fetch_ttl, || {
        deps.source.fetch_channel(id).map_err(compute_error)
    })?;
    ctx.checkpoint()?;

    deps.repository.save_channel(&channel)?;
    deps.aggregator.record_metrics(&channel.readings(), Utc::now())?;

    let mut enqueued = Vec::new();
    for video_id in channel.recent_video_ids.iter().take(payload.video_limit) {
        let follow_up = JobEnvelope::json(
            JobKind::ScrapeVideo,
            &ScrapeVideoPayload {
                video_id: video_id.clone(),
                include_comments: true,
                comment_limit: default_comment_limit(),
            },
        )?;
        ctx.enqueue(follow_up)?;
        enqueued.push(video_id.clone());
    }

    info!(channel_id = %id, videos_enqueued = enqueued.len(), "channel scraped");
    Ok(json!({ "channel": channel, "videos_enqueued": enqueued }))
}

fn scrape_video(deps: &HandlerDeps, ctx: &JobContext<'_>) -> Result<Value, JobError> {
    let payload: ScrapeVideoPayload = ctx.payload()?;
    let id = &payload.video_id;
    ctx.checkpoint()?;

    let video: Video = ctx.memoize(&fetch_key("fetch_video", id.as_str()), deps.fetch_ttl, || {
        deps.source.fetch_video(id).map_err(compute_error)
    })?;
    ctx.checkpoint()?;

    deps.repository.save_video(&video)?;
    deps.aggregator.record_metrics(&video.readings(), Utc::now())?;

    if payload.include_comments {
        let follow_up = JobEnvelope::json(
            JobKind::AnalyzeComments,
            &AnalyzeCommentsPayload {
                video_id: id.clone(),
                limit: payload.comment_limit,
            },
        )?;
        ctx.enqueue(follow_up)?;
    }

    debug!(video_id = %id, views = video.view_count, "video scraped");
    Ok(json!({ "video": video, "comments_requested": payload.include_comments }))
}

fn analyze_comments(deps: &HandlerDeps, ctx: &JobContext<'_>) -> Result<Value, JobError> {
    let payload: AnalyzeCommentsPayload = ctx.payload()?;
    let id = &payload.video_id;
    ctx.checkpoint()?;

    let target = format!("{id}:{}", payload.limit);
    let comments: Vec<Comment> = ctx.memoize(&fetch_key("fetch_comments", &target), deps.comments_ttl, || {
        deps.source.fetch_comments(id, payload.limit).map_err(compute_error)
    })?;
    ctx.checkpoint()?;

    for comment in &comments {
        deps.repository.save_comment(comment)?;
    }
    let report = deps.aggregator.ingest_comments(id, &comments, Utc::now())?;

    info!(
        video_id = %id,
        fetched = comments.len(),
        classified = report.classified,
        failed = report.failed,
        "comments analyzed"
    );
    Ok(json!({ "video_id": id, "fetched": comments.len(), "report": report }))
}

fn refresh_trending(deps: &HandlerDeps, ctx: &JobContext<'_>) -> Result<Value, JobError> {
    let payload: RefreshTrendingPayload = ctx.payload()?;
    ctx.checkpoint()?;

    let target = format!("{}:{}", payload.region, payload.limit);
    let videos: Vec<Video> = ctx.memoize(&fetch_key("fetch_trending", &target), deps.fetch_ttl, || {
        deps.source
            .fetch_trending(&payload.region, payload.limit)
            .map_err(compute_error)
    })?;

    let now = Utc::now();
    for video in &videos {
        ctx.checkpoint()?;
        deps.repository.save_video(video)?;
        deps.aggregator.record_metrics(&video.readings(), now)?;
        if payload.scrape_videos {
            let follow_up = JobEnvelope::json(
                JobKind::ScrapeVideo,
                &ScrapeVideoPayload {
                    video_id: video.id.clone(),
                    include_comments: true,
                    comment_limit: default_comment_limit(),
                },
            )?;
            ctx.enqueue(follow_up)?;
        }
    }

    let ids: Vec<&EntityId> = videos.iter().map(|v| &v.id).collect();
    info!(region = %payload.region, videos = videos.len(), "trending list refreshed");
    Ok(json!({ "region": payload.region, "videos": ids }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use tubewatch_analytics::AggregatorConfig;
    use tubewatch_cache::{CacheConfig, CacheManager};
    use tubewatch_core::{Metric, SentimentLabel};

    use super::*;
    use crate::classifier::LexiconClassifier;
    use crate::jobs::{InMemoryBroker, InMemoryCompletionSink, JobState, QueueBroker, QueueName, Settlement, WorkerPool};
    use crate::repository::InMemoryRepository;
    use crate::source::FixtureSource;

    const CATALOG: &str = r#"{
        "channels": [{"id": "ch1", "title": "Channel", "subscriber_count": 10, "view_count": 150,
                      "recent_video_ids": ["v1", "v2", "v3"]}],
        "videos": [
            {"id": "v1", "channel_id": "ch1", "title": "One", "view_count": 100, "like_count": 7},
            {"id": "v2", "channel_id": "ch1", "title": "Two", "view_count": 50}
        ],
        "comments": {
            "v1": [
                {"id": "c1", "video_id": "v1", "text": "great video, love it"},
                {"id": "c2", "video_id": "v1", "text": "terrible audio"},
                {"id": "c3", "video_id": "v1", "text": "first"}
            ]
        },
        "trending": {"US": ["v2", "v1"]}
    }"#;

    struct Harness {
        broker: Arc<InMemoryBroker>,
        source: Arc<FixtureSource>,
        repository: Arc<InMemoryRepository>,
        aggregator: Arc<AnalyticsAggregator>,
        pool: WorkerPool,
    }

    impl Harness {
        fn new() -> Self {
            let broker = Arc::new(InMemoryBroker::default());
            let cache = CacheManager::arc(CacheConfig::default());
            let source = Arc::new(FixtureSource::from_json_str(CATALOG).unwrap());
            let repository = Arc::new(InMemoryRepository::new());
            let aggregator = Arc::new(AnalyticsAggregator::new(
                repository.clone(),
                Arc::new(LexiconClassifier::new()),
                cache.clone(),
                AggregatorConfig::default(),
            ));
            let registry = registry(HandlerDeps {
                source: source.clone(),
                repository: repository.clone(),
                aggregator: aggregator.clone(),
                fetch_ttl: Duration::from_secs(60),
                comments_ttl: Duration::from_secs(60),
            });
            let pool = WorkerPool::new(broker.clone(), cache, registry, Arc::new(InMemoryCompletionSink::default()));
            Self {
                broker,
                source,
                repository,
                aggregator,
                pool,
            }
        }

        fn run(&self, envelope: JobEnvelope) -> Settlement {
            self.broker.enqueue(envelope).unwrap();
            self.run_next().unwrap()
        }

        fn run_next(&self) -> Option<Settlement> {
            let job = self
                .broker
                .lease(&QueueName::ALL, "test", Duration::from_secs(30), Duration::ZERO)
                .unwrap()?;
            Some(self.pool.execute_one(&job, "test"))
        }
    }

    fn id(raw: &str) -> EntityId {
        EntityId::parse(raw).unwrap()
    }

    #[test]
    fn registry_covers_every_kind() {
        let h = Harness::new();
        assert_eq!(h.pool.registry().kinds(), JobKind::ALL.to_vec());
    }

    #[test]
    fn channel_scrape_fans_out_to_videos_and_comments() {
        let h = Harness::new();
        let env = JobEnvelope::json(JobKind::ScrapeChannel, &json!({"channel_id": "ch1", "video_limit": 2})).unwrap();
        assert_eq!(h.run(env), Settlement::Succeeded);
        assert!(h.repository.channel(&id("ch1")).is_some());
        assert_eq!(h.broker.depth(QueueName::Scraping).unwrap(), 2);

        // Drain the fan-out: two video scrapes, two comment analyses.
        let mut settled = Vec::new();
        while let Some(s) = h.run_next() {
            settled.push(s);
        }
        assert_eq!(settled.len(), 4);
        assert!(settled.iter().all(|s| *s == Settlement::Succeeded));

        let counts = h.repository.sentiment(&id("v1")).unwrap();
        assert_eq!(counts.get(SentimentLabel::Positive), 1);
        assert_eq!(counts.get(SentimentLabel::Negative), 1);
        assert_eq!(counts.get(SentimentLabel::Neutral), 1);
        assert_eq!(h.repository.comments_for(&id("v1")).len(), 3);
        assert_eq!(h.aggregator.open_value(&id("v1"), Metric::Likes), Some(7.0));
    }

    #[test]
    fn missing_video_is_permanent() {
        let h = Harness::new();
        let env = JobEnvelope::json(JobKind::ScrapeVideo, &json!({"video_id": "ghost"})).unwrap();
        assert_eq!(h.run(env), Settlement::DeadLettered);
    }

    #[test]
    fn source_timeout_is_retried() {
        let h = Harness::new();
        h.source.fail_next("v2", SourceError::Timeout("upstream".into()));
        let env = JobEnvelope::json(
            JobKind::ScrapeVideo,
            &ScrapeVideoPayload {
                video_id: id("v2"),
                include_comments: false,
                comment_limit: 10,
            },
        )
        .unwrap();
        let job_id = env.id();

        assert_eq!(h.run(env), Settlement::Requeued { attempt: 1 });
        assert_eq!(h.broker.job_state(job_id).unwrap(), Some(JobState::Delayed));
    }

    #[test]
    fn trending_refresh_saves_videos_without_fan_out_by_default() {
        let h = Harness::new();
        let env = JobEnvelope::json(JobKind::RefreshTrending, &RefreshTrendingPayload::default()).unwrap();
        assert_eq!(h.run(env), Settlement::Succeeded);

        assert_eq!(h.repository.video_count(), 2);
        assert_eq!(h.source.fetch_count("trending:US"), 1);
        assert!(h.run_next().is_none());
    }

    #[test]
    fn repeated_fetches_hit_the_cache() {
        let h = Harness::new();
        for _ in 0..3 {
            let env = JobEnvelope::json(
                JobKind::ScrapeVideo,
                &json!({"video_id": "v1", "include_comments": false}),
            )
            .unwrap();
            assert_eq!(h.run(env), Settlement::Succeeded);
        }
        assert_eq!(h.source.fetch_count("v1"), 1);
    }
}
