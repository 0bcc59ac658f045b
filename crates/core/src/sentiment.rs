//! Sentiment labels and per-entity counters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::EntityId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Negative,
        SentimentLabel::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }

    /// Map a classifier's raw label onto the three tracked labels.
    ///
    /// Anything that is not recognisably positive or negative counts as neutral.
    pub fn from_model_label(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" | "pos" => SentimentLabel::Positive,
            "negative" | "neg" => SentimentLabel::Negative,
            _ => SentimentLabel::Neutral,
        }
    }
}

impl core::fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a sentiment classifier for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: SentimentLabel,
    /// Confidence in \[0, 1\] (classifier convention; not enforced).
    pub confidence: f64,
}

impl Classification {
    pub fn new(label: SentimentLabel, confidence: f64) -> Self {
        Self { label, confidence }
    }
}

/// Running sentiment totals for one entity.
///
/// Counters only grow; the aggregator resets them solely on explicit recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentCounts {
    pub entity_id: EntityId,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

/// Share of one label within a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelShare {
    pub count: u64,
    pub percentage: f64,
}

pub type SentimentDistribution = BTreeMap<SentimentLabel, LabelShare>;

impl SentimentCounts {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            positive: 0,
            negative: 0,
            neutral: 0,
        }
    }

    pub fn record(&mut self, label: SentimentLabel) {
        self.record_n(label, 1);
    }

    pub fn record_n(&mut self, label: SentimentLabel, n: u64) {
        match label {
            SentimentLabel::Positive => self.positive += n,
            SentimentLabel::Negative => self.negative += n,
            SentimentLabel::Neutral => self.neutral += n,
        }
    }

    /// Fold another entity-agnostic set of counts into this one.
    pub fn absorb(&mut self, other: &SentimentCounts) {
        self.positive += other.positive;
        self.negative += other.negative;
        self.neutral += other.neutral;
    }

    pub fn get(&self, label: SentimentLabel) -> u64 {
        match label {
            SentimentLabel::Positive => self.positive,
            SentimentLabel::Negative => self.negative,
            SentimentLabel::Neutral => self.neutral,
        }
    }

    pub fn total(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    /// `(positive - negative) / total`, rounded to 3 places; 0 when empty.
    pub fn average(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let raw = (self.positive as f64 - self.negative as f64) / total as f64;
        (raw * 1000.0).round() / 1000.0
    }

    /// Count and percentage (2 places) for every label.
    pub fn distribution(&self) -> SentimentDistribution {
        let total = self.total();
        SentimentLabel::ALL
            .iter()
            .map(|label| {
                let count = self.get(*label);
                let percentage = if total == 0 {
                    0.0
                } else {
                    (count as f64 / total as f64 * 10_000.0).round() / 100.0
                };
                (*label, LabelShare { count, percentage })
            })
            .collect()
    }
}
