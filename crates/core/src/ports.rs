//! Contracts consumed by the orchestration core.
//!
//! The core depends only on these signatures. Storage engines, platform API
//! clients and models live behind them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::EntityId;
use crate::model::{AnalyticsSnapshot, Channel, Comment, Video};
use crate::sentiment::{Classification, SentimentCounts};

/// Failure while talking to the content platform.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout(_) | SourceError::RateLimited { .. } | SourceError::Unavailable(_)
        )
    }
}

/// Failure while persisting or loading data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Storage is temporarily unreachable or contended.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    /// The write would modify frozen data.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("nothing to classify")]
    EmptyText,
    #[error("classification failed: {0}")]
    Failed(String),
}

/// Persistence boundary for entities and closed analytics buckets.
pub trait Repository: Send + Sync {
    /// Persist one closed bucket value. Re-saving an identical snapshot is a no-op.
    fn save_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<(), RepositoryError>;

    fn save_comment(&self, comment: &Comment) -> Result<(), RepositoryError>;

    /// Snapshots for `entity_id` whose bucket starts in `[until - window, until)`,
    /// ordered by bucket start.
    fn load_recent_snapshots(
        &self,
        entity_id: &EntityId,
        window: Duration,
        until: DateTime<Utc>,
    ) -> Result<Vec<AnalyticsSnapshot>, RepositoryError>;

    fn save_channel(&self, channel: &Channel) -> Result<(), RepositoryError>;

    fn save_video(&self, video: &Video) -> Result<(), RepositoryError>;

    fn save_sentiment_counts(&self, counts: &SentimentCounts) -> Result<(), RepositoryError>;

    /// Last totals saved for `entity_id`, if any.
    fn load_sentiment_counts(&self, entity_id: &EntityId) -> Result<Option<SentimentCounts>, RepositoryError>;
}

/// Sentiment model boundary. Assumed synchronous and side-effect free.
pub trait SentimentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

/// Content platform boundary (API client or scraper).
pub trait ContentSource: Send + Sync {
    fn fetch_channel(&self, channel_id: &EntityId) -> Result<Channel, SourceError>;

    fn fetch_video(&self, video_id: &EntityId) -> Result<Video, SourceError>;

    /// Up to `limit` top-level comments, newest first.
    fn fetch_comments(&self, video_id: &EntityId, limit: usize) -> Result<Vec<Comment>, SourceError>;

    /// Up to `limit` currently trending videos for a region code.
    fn fetch_trending(&self, region: &str, limit: usize) -> Result<Vec<Video>, SourceError>;
}

impl<R> Repository for Arc<R>
where
    R: Repository + ?Sized,
{
    fn save_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<(), RepositoryError> {
        (**self).save_snapshot(snapshot)
    }

    fn save_comment(&self, comment: &Comment) -> Result<(), RepositoryError> {
        (**self).save_comment(comment)
    }

    fn load_recent_snapshots(
        &self,
        entity_id: &EntityId,
        window: Duration,
        until: DateTime<Utc>,
    ) -> Result<Vec<AnalyticsSnapshot>, RepositoryError> {
        (**self).load_recent_snapshots(entity_id, window, until)
    }

    fn save_channel(&self, channel: &Channel) -> Result<(), RepositoryError> {
        (**self).save_channel(channel)
    }

    fn save_video(&self, video: &Video) -> Result<(), RepositoryError> {
        (**self).save_video(video)
    }

    fn save_sentiment_counts(&self, counts: &SentimentCounts) -> Result<(), RepositoryError> {
        (**self).save_sentiment_counts(counts)
    }

    fn load_sentiment_counts(&self, entity_id: &EntityId) -> Result<Option<SentimentCounts>, RepositoryError> {
        (**self).load_sentiment_counts(entity_id)
    }
}

impl<C> SentimentClassifier for Arc<C>
where
    C: SentimentClassifier + ?Sized,
{
    fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        (**self).classify(text)
    }
}

impl<S> ContentSource for Arc<S>
where
    S: ContentSource + ?Sized,
{
    fn fetch_channel(&self, channel_id: &EntityId) -> Result<Channel, SourceError> {
        (**self).fetch_channel(channel_id)
    }

    fn fetch_video(&self, video_id: &EntityId) -> Result<Video, SourceError> {
        (**self).fetch_video(video_id)
    }

    fn fetch_comments(&self, video_id: &EntityId, limit: usize) -> Result<Vec<Comment>, SourceError> {
        (**self).fetch_comments(video_id, limit)
    }

    fn fetch_trending(&self, region: &str, limit: usize) -> Result<Vec<Video>, SourceError> {
        (**self).fetch_trending(region, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_taxonomy() {
        assert!(SourceError::Timeout("x".into()).is_transient());
        assert!(SourceError::RateLimited { retry_after: None }.is_transient());
        assert!(SourceError::Unavailable("x".into()).is_transient());
        assert!(!SourceError::NotFound("x".into()).is_transient());
        assert!(!SourceError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn repository_error_taxonomy() {
        assert!(RepositoryError::Unavailable("db".into()).is_transient());
        assert!(!RepositoryError::Conflict("frozen".into()).is_transient());
    }
}
