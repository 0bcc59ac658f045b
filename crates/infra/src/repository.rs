use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tubewatch_core::{
    AnalyticsSnapshot, Channel, Comment, EntityId, Metric, Repository, RepositoryError, SentimentCounts, Video,
};

type SnapshotKey = (EntityId, DateTime<Utc>, Metric);

#[derive(Debug, Default)]
struct Tables {
    channels: HashMap<EntityId, Channel>,
    videos: HashMap<EntityId, Video>,
    comments: HashMap<String, Comment>,
    snapshots: BTreeMap<SnapshotKey, AnalyticsSnapshot>,
    sentiment: HashMap<EntityId, SentimentCounts>,
}

/// In-memory repository.
///
/// Intended for tests/dev. Closed snapshots are write-once: saving a different
/// value for an existing `(entity, bucket, metric)` is a conflict.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("repository offline".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.check_online()?;
        self.tables
            .read()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.check_online()?;
        self.tables
            .write()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".to_string()))
    }

    pub fn channel(&self, id: &EntityId) -> Option<Channel> {
        self.read().ok()?.channels.get(id).cloned()
    }

    pub fn video(&self, id: &EntityId) -> Option<Video> {
        self.read().ok()?.videos.get(id).cloned()
    }

    pub fn video_count(&self) -> usize {
        self.read().map(|t| t.videos.len()).unwrap_or(0)
    }

    pub fn comments_for(&self, video_id: &EntityId) -> Vec<Comment> {
        let Ok(tables) = self.read() else {
            return Vec::new();
        };
        let mut comments: Vec<Comment> = tables
            .comments
            .values()
            .filter(|c| &c.video_id == video_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.published_at.cmp(&b.published_at).then_with(|| a.id.cmp(&b.id)));
        comments
    }

    pub fn sentiment(&self, id: &EntityId) -> Option<SentimentCounts> {
        self.read().ok()?.sentiment.get(id).cloned()
    }

    /// Closed buckets of one metric, oldest first.
    pub fn snapshots(&self, entity_id: &EntityId, metric: Metric) -> Vec<AnalyticsSnapshot> {
        let Ok(tables) = self.read() else {
            return Vec::new();
        };
        tables
            .snapshots
            .values()
            .filter(|s| &s.entity_id == entity_id && s.metric == metric)
            .cloned()
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.read().map(|t| t.snapshots.len()).unwrap_or(0)
    }
}

impl Repository for InMemoryRepository {
    fn save_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let key = (snapshot.entity_id.clone(), snapshot.bucket_start, snapshot.metric);
        match tables.snapshots.get(&key) {
            Some(existing) if existing == snapshot => Ok(()),
            Some(existing) => Err(RepositoryError::Conflict(format!(
                "{} {} bucket {} already closed at {}",
                snapshot.entity_id, snapshot.metric, snapshot.bucket_start, existing.value
            ))),
            None => {
                tables.snapshots.insert(key, snapshot.clone());
                Ok(())
            }
        }
    }

    fn save_comment(&self, comment: &Comment) -> Result<(), RepositoryError> {
        if comment.id.is_empty() {
            return Err(RepositoryError::Rejected("comment without id".to_string()));
        }
        self.write()?.comments.insert(comment.id.clone(), comment.clone());
        Ok(())
    }

    fn load_recent_snapshots(
        &self,
        entity_id: &EntityId,
        window: Duration,
        until: DateTime<Utc>,
    ) -> Result<Vec<AnalyticsSnapshot>, RepositoryError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| RepositoryError::Rejected(format!("window out of range: {e}")))?;
        let from = until - window;
        let tables = self.read()?;
        Ok(tables
            .snapshots
            .values()
            .filter(|s| &s.entity_id == entity_id && s.bucket_start >= from && s.bucket_start < until)
            .cloned()
            .collect())
    }

    fn save_channel(&self, channel: &Channel) -> Result<(), RepositoryError> {
        self.write()?.channels.insert(channel.id.clone(), channel.clone());
        Ok(())
    }

    fn save_video(&self, video: &Video) -> Result<(), RepositoryError> {
        self.write()?.videos.insert(video.id.clone(), video.clone());
        Ok(())
    }

    fn save_sentiment_counts(&self, counts: &SentimentCounts) -> Result<(), RepositoryError> {
        self.write()?.sentiment.insert(counts.entity_id.clone(), counts.clone());
        Ok(())
    }

    fn load_sentiment_counts(&self, entity_id: &EntityId) -> Result<Option<SentimentCounts>, RepositoryError> {
        Ok(self.read()?.sentiment.get(entity_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn id(raw: &str) -> EntityId {
        EntityId::parse(raw).unwrap()
    }

    fn snap(hour: u32, metric: Metric, value: f64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            entity_id: id("v1"),
            bucket_start: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            bucket_width: Duration::from_secs(3600),
            metric,
            value,
        }
    }

    #[test]
    fn closed_snapshots_are_write_once() {
        let repo = InMemoryRepository::new();
        repo.save_snapshot(&snap(10, Metric::Views, 5.0)).unwrap();
        repo.save_snapshot(&snap(10, Metric::Views, 5.0)).unwrap();

        let err = repo.save_snapshot(&snap(10, Metric::Views, 6.0)).unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.snapshots(&id("v1"), Metric::Views)[0].value, 5.0);
    }

    #[test]
    fn recent_snapshots_cover_half_open_window() {
        let repo = InMemoryRepository::new();
        for hour in 0..6 {
            repo.save_snapshot(&snap(hour, Metric::Views, f64::from(hour))).unwrap();
        }
        repo.save_snapshot(&snap(3, Metric::Likes, 1.0)).unwrap();

        let until = Utc.with_ymd_and_hms(2024, 5, 1, 5, 0, 0).unwrap();
        let recent = repo
            .load_recent_snapshots(&id("v1"), Duration::from_secs(3 * 3600), until)
            .unwrap();
        let values: Vec<u32> = recent
            .iter()
            .filter(|s| s.metric == Metric::Views)
            .map(|s| s.value as u32)
            .collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert_eq!(recent.len(), 4);
        assert!(recent.windows(2).all(|w| w[0].bucket_start <= w[1].bucket_start));
    }

    #[test]
    fn offline_repository_is_transiently_unavailable() {
        let repo = InMemoryRepository::new();
        repo.set_offline(true);
        let err = repo.save_sentiment_counts(&SentimentCounts::new(id("v1"))).unwrap_err();
        assert!(err.is_transient());
        assert!(repo.sentiment(&id("v1")).is_none());

        repo.set_offline(false);
        repo.save_sentiment_counts(&SentimentCounts::new(id("v1"))).unwrap();
        assert!(repo.sentiment(&id("v1")).is_some());
        assert_eq!(repo.load_sentiment_counts(&id("v1")).unwrap(), Some(SentimentCounts::new(id("v1"))));
        assert_eq!(repo.load_sentiment_counts(&id("v2")).unwrap(), None);
    }
}
