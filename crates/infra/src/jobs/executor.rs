//! Worker pool: lease, dispatch by kind, settle with the broker.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use tubewatch_cache::{CacheManager, ComputeError};
use tubewatch_core::{Fingerprint, JobId};

use super::broker::{AckOutcome, BrokerError, CancelOutcome, NackOutcome, QueueBroker};
use super::types::{JobEnvelope, JobError, JobKind, LeasedJob, QueueName};

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&JobContext<'_>) -> Result<Value, JobError> + Send + Sync>;

/// Static dispatch table from job kind to handler, fixed before the pool starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, JobHandler>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry").field("kinds", &self.kinds()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job kind, replacing any previous one.
    pub fn register<F>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(&JobContext<'_>) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn with<F>(mut self, kind: JobKind, handler: F) -> Self
    where
        F: Fn(&JobContext<'_>) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&JobHandler> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// What a handler sees while it runs one leased job.
pub struct JobContext<'a> {
    job: &'a LeasedJob,
    cache: &'a CacheManager,
    broker: &'a dyn QueueBroker,
    worker_id: &'a str,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a LeasedJob, cache: &'a CacheManager, broker: &'a dyn QueueBroker, worker_id: &'a str) -> Self {
        Self {
            job,
            cache,
            broker,
            worker_id,
        }
    }

    pub fn job(&self) -> &LeasedJob {
        self.job
    }

    pub fn envelope(&self) -> &JobEnvelope {
        &self.job.envelope
    }

    pub fn worker_id(&self) -> &str {
        self.worker_id
    }

    pub fn cache(&self) -> &CacheManager {
        self.cache
    }

    /// Decode the JSON payload; malformed payloads are permanent failures.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        self.job.envelope.decode()
    }

    /// Cancellation checkpoint. Call between external calls.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        self.job.cancel.check()
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.cancel.is_cancelled()
    }

    /// Run `compute` at most once pool-wide per `key` within `ttl`.
    ///
    /// A cancelled job still waits for a computation other workers share.
    pub fn memoize<T, F>(&self, key: &Fingerprint, ttl: Duration, compute: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, ComputeError>,
    {
        Ok(self.cache.get_or_compute_as(key, ttl, compute)?)
    }

    /// Memoize keyed on this job's own fingerprint with the cache's default TTL.
    pub fn memoize_job<T, F>(&self, compute: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, ComputeError>,
    {
        self.memoize(self.job.envelope.fingerprint(), self.cache.default_ttl(), compute)
    }

    /// Enqueue a follow-up job.
    pub fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, JobError> {
        Ok(self.broker.enqueue(envelope)?)
    }
}

/// Successful completion event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub kind: JobKind,
    pub fingerprint: Fingerprint,
    pub output: Value,
    pub worker_id: String,
    pub attempt: u32,
    pub finished_at: DateTime<Utc>,
}

/// Receives completion events after the broker has acknowledged the job.
pub trait CompletionSink: Send + Sync {
    fn job_completed(&self, completion: &JobCompletion);
}

/// Keeps the most recent completions in memory.
#[derive(Debug)]
pub struct InMemoryCompletionSink {
    capacity: usize,
    completions: Mutex<VecDeque<JobCompletion>>,
}

impl Default for InMemoryCompletionSink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl InMemoryCompletionSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn completions(&self) -> Vec<JobCompletion> {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn for_job(&self, job_id: JobId) -> Option<JobCompletion> {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.job_id == job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.completions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CompletionSink for InMemoryCompletionSink {
    fn job_completed(&self, completion: &JobCompletion) {
        let mut completions = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
        completions.push_back(completion.clone());
        while completions.len() > self.capacity {
            completions.pop_front();
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Jobs allowed to run at once across the pool
    pub max_in_flight: usize,
    pub lease_duration: Duration,
    /// Upper bound on one blocking lease call
    pub poll_wait: Duration,
    pub queues: Vec<QueueName>,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_in_flight: 4,
            lease_duration: Duration::from_secs(300),
            poll_wait: Duration::from_millis(250),
            queues: QueueName::ALL.to_vec(),
            name: "worker-pool".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Deliveries that ended in a nack, requeued or not
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Succeeded,
    Requeued { attempt: u32 },
    DeadLettered,
    Cancelled,
    /// The lease expired before the result was reported; the broker redelivers.
    LeaseLost,
}

/// Bounded count of running jobs. Workers take a permit before leasing.
#[derive(Debug)]
struct InFlightLimiter {
    limit: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

struct Permit<'a> {
    limiter: &'a InFlightLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.limiter.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        self.limiter.released.notify_one();
    }
}

impl InFlightLimiter {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Wait up to `wait` for a free slot.
    fn acquire(&self, wait: Duration) -> Option<Permit<'_>> {
        let deadline = Instant::now() + wait;
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.limit {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            in_use = self
                .released
                .wait_timeout(in_use, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *in_use += 1;
        Some(Permit { limiter: self })
    }
}

/// Executes leased jobs with the registered handlers.
pub struct WorkerPool {
    broker: Arc<dyn QueueBroker>,
    cache: Arc<CacheManager>,
    registry: HandlerRegistry,
    sink: Arc<dyn CompletionSink>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        cache: Arc<CacheManager>,
        registry: HandlerRegistry,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            broker,
            cache,
            registry,
            sink,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Spawn `config.workers` threads.
    pub fn spawn(self, config: WorkerPoolConfig) -> std::io::Result<WorkerPoolHandle> {
        let shared = Arc::new(Shared {
            pool: self,
            limiter: InFlightLimiter::new(config.max_in_flight),
            stop: AtomicBool::new(false),
            stats: Mutex::new(ExecutorStats::default()),
            started: Instant::now(),
            config,
        });

        let mut joins = Vec::with_capacity(shared.config.workers.max(1));
        for index in 0..shared.config.workers.max(1) {
            let worker_id = format!("{}-{index}", shared.config.name);
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker_loop(&worker_shared, &worker_id));
            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    shared.stop.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            pool = %shared.config.name,
            workers = joins.len(),
            max_in_flight = shared.limiter.limit,
            handlers = ?shared.pool.registry.kinds(),
            "worker pool started"
        );
        Ok(WorkerPoolHandle { shared, joins })
    }

    /// Dispatch one leased job and settle it with the broker.
    pub fn execute_one(&self, job: &LeasedJob, worker_id: &str) -> Settlement {
        let outcome = self.run_handler(job, worker_id);
        self.settle(job, worker_id, outcome)
    }

    fn run_handler(&self, job: &LeasedJob, worker_id: &str) -> Result<Value, JobError> {
        let Some(handler) = self.registry.get(job.kind()) else {
            return Err(JobError::permanent(format!("no handler registered for job kind {}", job.kind())));
        };
        if job.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let ctx = JobContext::new(job, &self.cache, self.broker.as_ref(), worker_id);
        match panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))) {
            Ok(result) => result,
            Err(_) => Err(JobError::permanent(format!("handler for {} panicked", job.kind()))),
        }
    }

    fn settle(&self, job: &LeasedJob, worker_id: &str, outcome: Result<Value, JobError>) -> Settlement {
        let settled = match outcome {
            Ok(output) => self.broker.ack(job.lease_id).map(|ack| match ack {
                AckOutcome::Completed => {
                    debug!(job_id = %job.id(), kind = %job.kind(), worker = %worker_id, "job completed");
                    self.sink.job_completed(&JobCompletion {
                        job_id: job.id(),
                        kind: job.kind(),
                        fingerprint: job.envelope.fingerprint().clone(),
                        output,
                        worker_id: worker_id.to_string(),
                        attempt: job.envelope.attempt(),
                        finished_at: Utc::now(),
                    });
                    Settlement::Succeeded
                }
                AckOutcome::Cancelled => Settlement::Cancelled,
            }),
            Err(JobError::Cancelled) => {
                info!(job_id = %job.id(), kind = %job.kind(), worker = %worker_id, "job stopped at cancellation checkpoint");
                let flagged = if job.cancel.is_cancelled() {
                    Ok(CancelOutcome::Signalled)
                } else {
                    // Handler gave up without the flag; record the cancellation first.
                    self.broker.cancel(job.id())
                };
                flagged.and_then(|_| self.broker.ack(job.lease_id)).map(|ack| match ack {
                    AckOutcome::Cancelled => Settlement::Cancelled,
                    AckOutcome::Completed => {
                        warn!(job_id = %job.id(), worker = %worker_id, "broker completed a job its handler cancelled");
                        Settlement::Succeeded
                    }
                })
            }
            Err(err) => {
                let requeue = err.is_transient();
                if requeue {
                    warn!(
                        job_id = %job.id(),
                        kind = %job.kind(),
                        worker = %worker_id,
                        attempt = job.envelope.attempt() + 1,
                        max_attempts = job.envelope.max_attempts(),
                        error = %err,
                        "transient job failure"
                    );
                } else {
                    warn!(job_id = %job.id(), kind = %job.kind(), worker = %worker_id, error = %err, "permanent job failure");
                }
                self.broker
                    .nack(job.lease_id, requeue, &err.to_string())
                    .map(|nack| match nack {
                        NackOutcome::Requeued { attempt, .. } => Settlement::Requeued { attempt },
                        NackOutcome::DeadLettered => Settlement::DeadLettered,
                        NackOutcome::Cancelled => Settlement::Cancelled,
                    })
            }
        };

        match settled {
            Ok(settlement) => settlement,
            Err(BrokerError::UnknownLease(lease_id)) => {
                warn!(job_id = %job.id(), lease_id = %lease_id, worker = %worker_id, "lease expired before settlement; job will be redelivered");
                Settlement::LeaseLost
            }
            Err(e) => {
                error!(job_id = %job.id(), worker = %worker_id, error = %e, "failed to settle job");
                Settlement::LeaseLost
            }
        }
    }
}

struct Shared {
    pool: WorkerPool,
    config: WorkerPoolConfig,
    limiter: InFlightLimiter,
    stop: AtomicBool,
    stats: Mutex<ExecutorStats>,
    started: Instant,
}

impl Shared {
    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    shared: Arc<Shared>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl core::fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPoolHandle")
            .field("name", &self.shared.config.name)
            .field("workers", &self.joins.len())
            .finish()
    }
}

impl WorkerPoolHandle {
    /// Stop leasing and wait for running jobs to finish.
    pub fn shutdown(self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for join in self.joins {
            let _ = join.join();
        }
        info!(pool = %self.shared.config.name, "worker pool stopped");
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.shared.started.elapsed().as_secs();
        stats
    }
}

fn worker_loop(shared: &Shared, worker_id: &str) {
    debug!(worker = %worker_id, "worker started");
    let config = &shared.config;

    while !shared.stop.load(Ordering::SeqCst) {
        // No permit, no lease: saturation holds jobs in the broker.
        let Some(permit) = shared.limiter.acquire(config.poll_wait) else {
            continue;
        };

        let leased = shared
            .pool
            .broker
            .lease(&config.queues, worker_id, config.lease_duration, config.poll_wait);
        let job = match leased {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = %worker_id, error = %e, "failed to lease job");
                drop(permit);
                thread::sleep(config.poll_wait);
                continue;
            }
        };

        shared.update_stats(|s| s.current_running += 1);
        let settlement = shared.pool.execute_one(&job, worker_id);
        drop(permit);

        shared.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match settlement {
                Settlement::Succeeded => s.jobs_succeeded += 1,
                Settlement::Requeued { .. } | Settlement::LeaseLost => s.jobs_failed += 1,
                Settlement::DeadLettered => {
                    s.jobs_failed += 1;
                    s.jobs_dead_lettered += 1;
                }
                Settlement::Cancelled => s.jobs_cancelled += 1,
            }
        });
    }

    debug!(worker = %worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::jobs::broker::{BrokerConfig, InMemoryBroker};
    use crate::jobs::types::{DeadLetterReason, JobState, RetryPolicy};
    use tubewatch_cache::CacheConfig;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        cache: Arc<CacheManager>,
        sink: Arc<InMemoryCompletionSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                broker: Arc::new(InMemoryBroker::new(BrokerConfig {
                    retry: RetryPolicy::fixed(Duration::from_millis(10)),
                    ..BrokerConfig::default()
                })),
                cache: CacheManager::arc(CacheConfig::default()),
                sink: Arc::new(InMemoryCompletionSink::default()),
            }
        }

        fn pool(&self, registry: HandlerRegistry) -> WorkerPool {
            WorkerPool::new(self.broker.clone(), self.cache.clone(), registry, self.sink.clone())
        }

        fn lease(&self) -> LeasedJob {
            self.broker
                .lease(&QueueName::ALL, "test", Duration::from_secs(30), Duration::from_secs(1))
                .unwrap()
                .unwrap()
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn success_acks_and_reports_completion() {
        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, |_| Ok(json!({"ok": true}))));
        let id = fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec())).unwrap();

        let settlement = pool.execute_one(&fx.lease(), "w1");

        assert_eq!(settlement, Settlement::Succeeded);
        assert_eq!(fx.broker.job_state(id).unwrap(), Some(JobState::Completed));
        assert_eq!(fx.sink.for_job(id).unwrap().output, json!({"ok": true}));
    }

    #[test]
    fn unregistered_kind_dead_letters_without_retry() {
        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new());
        let id = fx.broker.enqueue(JobEnvelope::new(JobKind::RefreshTrending, b"{}".to_vec())).unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::DeadLettered);
        let dead = fx.broker.dead_letters(10).unwrap();
        assert_eq!(dead[0].envelope.id(), id);
        assert_eq!(dead[0].reason, DeadLetterReason::Permanent);
    }

    #[test]
    fn malformed_payload_is_permanent() {
        #[derive(serde::Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            video_id: String,
        }

        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, |ctx| {
            let _: Payload = ctx.payload()?;
            Ok(Value::Null)
        }));
        fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"not json".to_vec())).unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::DeadLettered);
    }

    #[test]
    fn transient_failure_requeues_then_dead_letters() {
        let fx = Fixture::new();
        let pool = fx.pool(
            HandlerRegistry::new().with(JobKind::ScrapeVideo, |_| Err(JobError::transient("upstream timeout"))),
        );
        let id = fx
            .broker
            .enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec()).with_max_attempts(3))
            .unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::Requeued { attempt: 1 });
        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::Requeued { attempt: 2 });
        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::DeadLettered);

        assert_eq!(fx.broker.job_state(id).unwrap(), Some(JobState::DeadLettered));
        let dead = fx.broker.dead_letters(10).unwrap();
        assert_eq!(dead[0].reason, DeadLetterReason::Exhausted);
        assert_eq!(dead[0].history.len(), 3);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, |_| panic!("handler bug")));
        fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec())).unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::DeadLettered);
    }

    #[test]
    fn cancelled_job_stops_at_checkpoint() {
        let fx = Fixture::new();
        let broker = fx.broker.clone();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, move |ctx| {
            broker.cancel(ctx.envelope().id()).map_err(JobError::from)?;
            ctx.checkpoint()?;
            Ok(json!("unreachable"))
        }));
        let id = fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec())).unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::Cancelled);
        assert_eq!(fx.broker.job_state(id).unwrap(), Some(JobState::Cancelled));
        assert!(fx.sink.is_empty());
    }

    #[test]
    fn handler_cancelling_itself_is_recorded_as_cancelled() {
        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, |_| Err(JobError::Cancelled)));
        let id = fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec())).unwrap();

        assert_eq!(pool.execute_one(&fx.lease(), "w1"), Settlement::Cancelled);
        assert_eq!(fx.broker.job_state(id).unwrap(), Some(JobState::Cancelled));
        let stats = fx.broker.stats().unwrap();
        assert_eq!((stats.cancelled, stats.acked), (1, 0));
        assert!(fx.sink.is_empty());
    }

    #[test]
    fn expired_lease_is_not_settled_twice() {
        let fx = Fixture::new();
        let pool = fx.pool(HandlerRegistry::new().with(JobKind::ScrapeVideo, |_| {
            thread::sleep(Duration::from_millis(60));
            Ok(Value::Null)
        }));
        let id = fx.broker.enqueue(JobEnvelope::new(JobKind::ScrapeVideo, b"v".to_vec())).unwrap();
        let job = fx
            .broker
            .lease(&QueueName::ALL, "w1", Duration::from_millis(20), Duration::ZERO)
            .unwrap()
            .unwrap();

        assert_eq!(pool.execute_one(&job, "w1"), Settlement::LeaseLost);
        assert_eq!(fx.broker.job_state(id).unwrap(), Some(JobState::Queued));
    }

    #[test]
    fn pool_respects_in_flight_limit() {
        let fx = Fixture::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let registry = HandlerRegistry::new().with(JobKind::AnalyzeComments, move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        });

        for i in 0..12 {
            fx.broker
                .enqueue(JobEnvelope::new(JobKind::AnalyzeComments, format!("batch-{i}").into_bytes()))
                .unwrap();
        }
        let handle = fx
            .pool(registry)
            .spawn(WorkerPoolConfig::default().with_workers(6).with_max_in_flight(2))
            .unwrap();

        wait_until(|| handle.stats().jobs_processed == 12);
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_succeeded, 12);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
        assert_eq!(fx.sink.len(), 12);
    }

    #[test]
    fn memoize_runs_once_per_key_across_workers() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let registry = HandlerRegistry::new().with(JobKind::ScrapeVideo, move |ctx| {
            let key = Fingerprint::for_job("fetch_video", b"same-video");
            let title: String = ctx.memoize(&key, Duration::from_secs(60), || {
                c.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                Ok("title".to_string())
            })?;
            Ok(json!({ "title": title }))
        });

        for i in 0..4 {
            fx.broker
                .enqueue(JobEnvelope::new(JobKind::ScrapeVideo, format!("req-{i}").into_bytes()))
                .unwrap();
        }
        let handle = fx
            .pool(registry)
            .spawn(WorkerPoolConfig::default().with_workers(4).with_max_in_flight(4))
            .unwrap();
        wait_until(|| handle.stats().jobs_processed == 4);
        handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let outputs: Vec<Value> = fx.sink.completions().into_iter().map(|c| c.output).collect();
        assert_eq!(outputs.len(), 4);
        assert!(outputs.iter().all(|o| *o == json!({"title": "title"})));
    }
}
