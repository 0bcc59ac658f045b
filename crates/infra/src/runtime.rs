//! Process wiring: one broker, one cache, one aggregator, shared by every component.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use tubewatch_analytics::{AnalyticsAggregator, BucketSweeper, BucketSweeperHandle};
use tubewatch_cache::{CacheManager, CacheStats, CacheSweeper, SweeperHandle};
use tubewatch_core::{ContentSource, JobId};

use crate::classifier::LexiconClassifier;
use crate::config::{AppConfig, ConfigError};
use crate::handlers::{self, HandlerDeps};
use crate::jobs::{
    BrokerError, BrokerStats, ExecutorStats, InMemoryBroker, InMemoryCompletionSink, JobEnvelope, JobScheduler,
    QueueBroker, ScheduleError, ScheduleStats, SchedulerHandle, WorkerPool, WorkerPoolHandle,
};
use crate::repository::InMemoryRepository;
use crate::source::{FixtureError, FixtureSource, RateLimitedSource};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fixtures(#[from] FixtureError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("failed to spawn background thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Point-in-time view of every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub pool: ExecutorStats,
    pub broker: BrokerStats,
    pub cache: CacheStats,
    pub schedules: BTreeMap<String, ScheduleStats>,
}

/// Running system. Dropping it without [`Runtime::shutdown`] leaves threads detached.
pub struct Runtime {
    broker: Arc<InMemoryBroker>,
    cache: Arc<CacheManager>,
    repository: Arc<InMemoryRepository>,
    aggregator: Arc<AnalyticsAggregator>,
    completions: Arc<InMemoryCompletionSink>,
    pool: WorkerPoolHandle,
    scheduler: SchedulerHandle,
    bucket_sweeper: BucketSweeperHandle,
    cache_sweeper: SweeperHandle,
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl Runtime {
    /// Start with the content source described by `config.source`.
    pub fn start(config: &AppConfig) -> Result<Self, RuntimeError> {
        let fixture = match &config.source.fixtures {
            Some(path) => {
                info!(path = %path.display(), "loading fixture catalog");
                FixtureSource::from_path(path)?
            }
            None => {
                warn!("no fixture catalog configured; content source is empty");
                FixtureSource::default()
            }
        }
        .with_latency(Duration::from_millis(config.source.latency_ms));

        let source: Arc<dyn ContentSource> = match config.rate_limit() {
            Some(limits) => Arc::new(RateLimitedSource::new(fixture, &limits)),
            None => Arc::new(fixture),
        };
        Self::with_source(config, source)
    }

    /// Start with an explicit content source.
    pub fn with_source(config: &AppConfig, source: Arc<dyn ContentSource>) -> Result<Self, RuntimeError> {
        config.validate()?;

        let broker = Arc::new(InMemoryBroker::new(config.broker_config()));
        let cache = CacheManager::arc(config.cache_config());
        let repository = Arc::new(InMemoryRepository::new());
        let aggregator = Arc::new(AnalyticsAggregator::new(
            repository.clone(),
            Arc::new(LexiconClassifier::new()),
            cache.clone(),
            config.aggregator_config(),
        ));
        let completions = Arc::new(InMemoryCompletionSink::default());

        let registry = handlers::registry(HandlerDeps {
            source,
            repository: repository.clone(),
            aggregator: aggregator.clone(),
            fetch_ttl: cache.default_ttl(),
            comments_ttl: Duration::from_secs(config.source.comments_ttl_secs),
        });
        let scheduler = JobScheduler::new(broker.clone(), config.schedule_definitions(), Instant::now())?;

        let cache_sweeper = CacheSweeper::spawn(cache.clone(), Duration::from_secs(config.cache.sweep_interval_secs.max(1)))?;
        let bucket_sweeper = BucketSweeper::spawn(
            aggregator.clone(),
            Duration::from_secs(config.analytics.sweep_interval_secs.max(1)),
        )?;
        let pool = WorkerPool::new(broker.clone(), cache.clone(), registry, completions.clone())
            .spawn(config.pool_config())?;
        let scheduler = scheduler.spawn()?;

        info!(
            workers = config.workers.count,
            schedules = config.schedules.len(),
            cache_capacity = config.cache.capacity,
            "runtime started"
        );
        Ok(Self {
            broker,
            cache,
            repository,
            aggregator,
            completions,
            pool,
            scheduler,
            bucket_sweeper,
            cache_sweeper,
        })
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    pub fn aggregator(&self) -> &Arc<AnalyticsAggregator> {
        &self.aggregator
    }

    pub fn completions(&self) -> &Arc<InMemoryCompletionSink> {
        &self.completions
    }

    /// Enqueue an on-demand job.
    pub fn submit(&self, envelope: JobEnvelope) -> Result<JobId, BrokerError> {
        self.broker.enqueue(envelope)
    }

    pub fn stats(&self) -> Result<RuntimeStats, BrokerError> {
        Ok(RuntimeStats {
            pool: self.pool.stats(),
            broker: self.broker.stats()?,
            cache: self.cache.stats(),
            schedules: self.scheduler.stats(),
        })
    }

    /// Stop producers first, then consumers, then the sweepers.
    pub fn shutdown(self) {
        info!("runtime shutting down");
        self.scheduler.shutdown();
        self.pool.shutdown();
        self.bucket_sweeper.shutdown();
        self.cache_sweeper.shutdown();
        info!("runtime stopped");
    }
}
