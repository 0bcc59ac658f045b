//! Job envelopes, leases and retry policy.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tubewatch_analytics::AggregationError;
use tubewatch_cache::CacheError;
use tubewatch_core::{Fingerprint, JobId, LeaseId, RepositoryError, SourceError};

use super::cancel::CancellationToken;

/// Kind of work a job performs; selects its handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ScrapeChannel,
    ScrapeVideo,
    AnalyzeComments,
    RefreshTrending,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ScrapeChannel,
        JobKind::ScrapeVideo,
        JobKind::AnalyzeComments,
        JobKind::RefreshTrending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ScrapeChannel => "scrape_channel",
            JobKind::ScrapeVideo => "scrape_video",
            JobKind::AnalyzeComments => "analyze_comments",
            JobKind::RefreshTrending => "refresh_trending",
        }
    }

    /// Queue a job of this kind lands on unless the producer picks one.
    pub fn default_queue(&self) -> QueueName {
        match self {
            JobKind::ScrapeChannel | JobKind::ScrapeVideo => QueueName::Scraping,
            JobKind::AnalyzeComments => QueueName::Analysis,
            JobKind::RefreshTrending => QueueName::Default,
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown job kind: {s}"))
    }
}

/// Named broker queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Default,
    Scraping,
    Analysis,
    /// Always drained before any other queue.
    Priority,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Default,
        QueueName::Scraping,
        QueueName::Analysis,
        QueueName::Priority,
    ];

    /// Queues served round-robin once `priority` is empty.
    pub const ROUND_ROBIN: [QueueName; 3] = [QueueName::Default, QueueName::Scraping, QueueName::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Default => "default",
            QueueName::Scraping => "scraping",
            QueueName::Analysis => "analysis",
            QueueName::Priority => "priority",
        }
    }

    /// Priority assigned to jobs that do not set one.
    pub fn default_priority(&self) -> i32 {
        match self {
            QueueName::Default => 5,
            QueueName::Scraping => 3,
            QueueName::Analysis => 7,
            QueueName::Priority => 10,
        }
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay schedule applied when a job is requeued after a transient failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before redelivery after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// A unit of work as held by the broker.
///
/// Everything except `attempt` (and the `not_before` the broker sets on
/// requeue) is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    id: JobId,
    kind: JobKind,
    queue: QueueName,
    priority: i32,
    payload: Vec<u8>,
    fingerprint: Fingerprint,
    attempt: u32,
    max_attempts: u32,
    enqueued_at: DateTime<Utc>,
    not_before: DateTime<Utc>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl JobEnvelope {
    /// New envelope on the kind's default queue with that queue's default priority.
    pub fn new(kind: JobKind, payload: Vec<u8>) -> Self {
        let queue = kind.default_queue();
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            queue,
            priority: queue.default_priority(),
            fingerprint: Fingerprint::for_job(kind.as_str(), &payload),
            payload,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: now,
            not_before: now,
        }
    }

    /// New envelope with a JSON-encoded payload.
    pub fn json<T: Serialize>(kind: JobKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_vec(payload)?))
    }

    pub fn on_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// At least one delivery is always allowed.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = at;
        self
    }

    pub fn delayed(self, delay: Duration) -> Self {
        let at = self.enqueued_at + chrono::Duration::from_std(delay).unwrap_or_default();
        self.not_before(at)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Failed deliveries so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn earliest_start(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Decode the payload as JSON; a malformed payload can never succeed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| JobError::permanent(format!("malformed {} payload: {e}", self.kind)))
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempt = (self.attempt + 1).min(self.max_attempts);
        self.attempt
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn set_not_before(&mut self, at: DateTime<Utc>) {
        self.not_before = at;
    }
}

/// A job owned by one worker until acked, nacked, or the lease expires.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub envelope: JobEnvelope,
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub leased_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl LeasedJob {
    pub fn id(&self) -> JobId {
        self.envelope.id()
    }

    pub fn kind(&self) -> JobKind {
        self.envelope.kind()
    }
}

/// How one delivery of a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Failed { error: String, transient: bool },
    LeaseExpired,
}

/// One failed delivery, kept for dead-letter inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt count after this delivery
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Used up `max_attempts` on transient failures or lease expiries
    Exhausted,
    /// Failed in a way retrying cannot fix
    Permanent,
}

/// Job parked after exhausting its attempts or failing permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: JobEnvelope,
    pub reason: DeadLetterReason,
    pub last_error: String,
    pub history: Vec<AttemptRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Where a job currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    /// Waiting for `not_before` (new delayed job or retry backoff)
    Delayed,
    Leased,
    Completed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    /// Queued, delayed or leased.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Delayed | JobState::Leased)
    }
}

/// Handler failure, classified for the broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Requeue with backoff while attempts remain.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Dead-letter immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

impl From<SourceError> for JobError {
    fn from(value: SourceError) -> Self {
        if value.is_transient() {
            JobError::Transient(value.to_string())
        } else {
            JobError::Permanent(value.to_string())
        }
    }
}

impl From<RepositoryError> for JobError {
    fn from(value: RepositoryError) -> Self {
        if value.is_transient() {
            JobError::Transient(value.to_string())
        } else {
            JobError::Permanent(value.to_string())
        }
    }
}

impl From<CacheError> for JobError {
    fn from(value: CacheError) -> Self {
        if value.is_transient() {
            JobError::Transient(value.to_string())
        } else {
            JobError::Permanent(value.to_string())
        }
    }
}

impl From<AggregationError> for JobError {
    fn from(value: AggregationError) -> Self {
        if value.is_transient() {
            JobError::Transient(value.to_string())
        } else {
            JobError::Permanent(value.to_string())
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(value: serde_json::Error) -> Self {
        JobError::Permanent(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_route_to_their_queues() {
        assert_eq!(JobKind::ScrapeChannel.default_queue(), QueueName::Scraping);
        assert_eq!(JobKind::ScrapeVideo.default_queue(), QueueName::Scraping);
        assert_eq!(JobKind::AnalyzeComments.default_queue(), QueueName::Analysis);
        assert_eq!(JobKind::RefreshTrending.default_queue(), QueueName::Default);
        assert_eq!("analyze_comments".parse::<JobKind>().unwrap(), JobKind::AnalyzeComments);
        assert!("transcode".parse::<JobKind>().is_err());
        assert_eq!("priority".parse::<QueueName>().unwrap(), QueueName::Priority);
    }

    #[test]
    fn fingerprint_ignores_identity_and_timing() {
        let a = JobEnvelope::new(JobKind::ScrapeVideo, br#"{"video_id":"v1"}"#.to_vec());
        let b = JobEnvelope::new(JobKind::ScrapeVideo, br#"{"video_id":"v1"}"#.to_vec())
            .with_priority(99)
            .delayed(Duration::from_secs(30));

        assert_ne!(a.id(), b.id());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn attempts_never_exceed_max() {
        let mut env = JobEnvelope::new(JobKind::ScrapeVideo, vec![]).with_max_attempts(2);
        assert_eq!(env.record_failure(), 1);
        assert!(!env.is_exhausted());
        assert_eq!(env.record_failure(), 2);
        assert_eq!(env.record_failure(), 2);
        assert!(env.is_exhausted());

        let zero = JobEnvelope::new(JobKind::ScrapeVideo, vec![]).with_max_attempts(0);
        assert_eq!(zero.max_attempts(), 1);
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500))
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn malformed_payload_is_permanent() {
        let env = JobEnvelope::new(JobKind::ScrapeVideo, b"not json".to_vec());
        let err = env.decode::<serde_json::Value>().unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err, JobError::Permanent(_)));
    }

    #[test]
    fn error_taxonomy() {
        assert!(JobError::from(SourceError::Timeout("5s".into())).is_transient());
        assert!(JobError::from(SourceError::RateLimited { retry_after: None }).is_transient());
        assert!(!JobError::from(SourceError::NotFound("v9".into())).is_transient());
        assert!(JobError::from(RepositoryError::Unavailable("db".into())).is_transient());
        assert!(!JobError::from(RepositoryError::Rejected("bad".into())).is_transient());
    }
}
