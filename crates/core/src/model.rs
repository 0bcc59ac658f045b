//! Content model: the entities ingestion jobs fetch and the analytics they feed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::id::EntityId;
use crate::sentiment::SentimentLabel;

/// A channel as last fetched from the content platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub subscriber_count: u64,
    #[serde(default)]
    pub video_count: u64,
    #[serde(default)]
    pub view_count: u64,
    /// Most recent uploads, newest first.
    #[serde(default)]
    pub recent_video_ids: Vec<EntityId>,
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl Channel {
    /// Metric readings carried by this fetch.
    pub fn readings(&self) -> Vec<MetricReading> {
        vec![
            MetricReading::new(self.id.clone(), Metric::Subscribers, self.subscriber_count as f64, self.fetched_at),
            MetricReading::new(self.id.clone(), Metric::Views, self.view_count as f64, self.fetched_at),
            MetricReading::new(self.id.clone(), Metric::VideoCount, self.video_count as f64, self.fetched_at),
        ]
    }
}

/// A video as last fetched from the content platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: EntityId,
    pub channel_id: EntityId,
    pub title: String,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl Video {
    pub fn readings(&self) -> Vec<MetricReading> {
        vec![
            MetricReading::new(self.id.clone(), Metric::Views, self.view_count as f64, self.fetched_at),
            MetricReading::new(self.id.clone(), Metric::Likes, self.like_count as f64, self.fetched_at),
            MetricReading::new(self.id.clone(), Metric::CommentCount, self.comment_count as f64, self.fetched_at),
        ]
    }
}

/// A top-level comment on a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub video_id: EntityId,
    #[serde(default)]
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

impl Comment {
    /// Content hash used to share classifications between identical texts.
    pub fn content_fingerprint(&self) -> Fingerprint {
        Fingerprint::for_text(&self.text)
    }
}

/// Named time series tracked per entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Views,
    Likes,
    CommentCount,
    Subscribers,
    VideoCount,
    TrendScore,
    SentimentPositive,
    SentimentNegative,
    SentimentNeutral,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Views => "views",
            Metric::Likes => "likes",
            Metric::CommentCount => "comment_count",
            Metric::Subscribers => "subscribers",
            Metric::VideoCount => "video_count",
            Metric::TrendScore => "trend_score",
            Metric::SentimentPositive => "sentiment_positive",
            Metric::SentimentNegative => "sentiment_negative",
            Metric::SentimentNeutral => "sentiment_neutral",
        }
    }

    /// Per-bucket counter metric for a sentiment label.
    pub fn sentiment(label: SentimentLabel) -> Self {
        match label {
            SentimentLabel::Positive => Metric::SentimentPositive,
            SentimentLabel::Negative => Metric::SentimentNegative,
            SentimentLabel::Neutral => Metric::SentimentNeutral,
        }
    }

    /// Whether trend scoring applies to this metric.
    pub fn is_trend_source(&self) -> bool {
        matches!(
            self,
            Metric::Views | Metric::Likes | Metric::CommentCount | Metric::Subscribers
        )
    }
}

impl core::fmt::Display for Metric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    pub entity_id: EntityId,
    pub metric: Metric,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl MetricReading {
    pub fn new(entity_id: EntityId, metric: Metric, value: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            metric,
            value,
            observed_at,
        }
    }
}

/// Value of one metric over one fixed-width time bucket.
///
/// Snapshots handed to a [`crate::Repository`] are always closed: the bucket
/// window has elapsed and the value will not change again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub entity_id: EntityId,
    pub bucket_start: DateTime<Utc>,
    pub bucket_width: Duration,
    pub metric: Metric,
    pub value: f64,
}

impl AnalyticsSnapshot {
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + chrono::Duration::from_std(self.bucket_width).unwrap_or_default()
    }

    /// A bucket accepts writes only while `now < bucket_start + bucket_width`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now < self.bucket_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> EntityId {
        EntityId::parse(raw).unwrap()
    }

    #[test]
    fn video_readings_cover_counters() {
        let video = Video {
            id: id("v1"),
            channel_id: id("c1"),
            title: "t".to_string(),
            view_count: 10,
            like_count: 2,
            comment_count: 1,
            published_at: None,
            fetched_at: Utc::now(),
        };

        let readings = video.readings();
        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|r| r.entity_id == video.id));
        assert_eq!(readings[0].metric, Metric::Views);
        assert_eq!(readings[0].value, 10.0);
    }

    #[test]
    fn snapshot_window_is_half_open() {
        let start = Utc::now();
        let snap = AnalyticsSnapshot {
            entity_id: id("v1"),
            bucket_start: start,
            bucket_width: Duration::from_secs(60),
            metric: Metric::Views,
            value: 1.0,
        };

        assert!(snap.is_open_at(start));
        assert!(snap.is_open_at(start + chrono::Duration::seconds(59)));
        assert!(!snap.is_open_at(start + chrono::Duration::seconds(60)));
    }

    #[test]
    fn comment_fixture_defaults_apply() {
        let json = r#"{"id":"c-1","video_id":"v1","text":"great video"}"#;
        let comment: Comment = serde_json::from_str(json).unwrap();
        assert_eq!(comment.like_count, 0);
        assert_eq!(comment.content_fingerprint(), Fingerprint::for_text("great video"));
    }
}
