//! Deterministic word-list sentiment classifier.

use std::collections::HashSet;

use tubewatch_core::{Classification, ClassifierError, SentimentClassifier, SentimentLabel};

/// Only the first characters of a comment are scored.
const MAX_CHARS: usize = 512;

const POSITIVE: &[&str] = &[
    "amazing", "awesome", "beautiful", "best", "brilliant", "enjoyed", "excellent", "fantastic", "fun", "good",
    "great", "helpful", "incredible", "interesting", "like", "love", "loved", "nice", "perfect", "thanks",
    "useful", "wonderful", "wow",
];

const NEGATIVE: &[&str] = &[
    "annoying", "awful", "bad", "boring", "broken", "clickbait", "disappointing", "dislike", "hate", "horrible",
    "misleading", "poor", "sad", "scam", "terrible", "useless", "waste", "worse", "worst", "wrong",
];

/// Counts positive and negative words; the larger side wins, ties are neutral.
#[derive(Debug, Clone)]
pub struct LexiconClassifier {
    positive: HashSet<String>,
    negative: HashSet<String>,
}

impl Default for LexiconClassifier {
    fn default() -> Self {
        Self {
            positive: POSITIVE.iter().map(|w| w.to_string()).collect(),
            negative: NEGATIVE.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl LexiconClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positive(mut self, words: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.positive.extend(words.into_iter().map(|w| w.into().to_lowercase()));
        self
    }

    pub fn with_negative(mut self, words: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.negative.extend(words.into_iter().map(|w| w.into().to_lowercase()));
        self
    }
}

impl SentimentClassifier for LexiconClassifier {
    fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let text: String = text.chars().take(MAX_CHARS).collect::<String>().to_lowercase();
        if text.trim().is_empty() {
            return Err(ClassifierError::EmptyText);
        }

        let (mut pos, mut neg) = (0u32, 0u32);
        for word in text.split(|c: char| !c.is_alphanumeric() && c != '\'') {
            if self.positive.contains(word) {
                pos += 1;
            } else if self.negative.contains(word) {
                neg += 1;
            }
        }

        let matched = pos + neg;
        if matched == 0 || pos == neg {
            return Ok(Classification::new(SentimentLabel::Neutral, 0.5));
        }
        let label = if pos > neg {
            SentimentLabel::Positive
        } else {
            SentimentLabel::Negative
        };
        let confidence = 0.5 + 0.5 * f64::from(pos.abs_diff(neg)) / f64::from(matched);
        Ok(Classification::new(label, confidence))
    }
}
