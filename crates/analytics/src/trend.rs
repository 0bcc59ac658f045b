//! Incremental trend scoring over a sliding window of bucket deltas.
//!
//! For closed buckets `b_1 < b_2 < ... < b_n` with values `v_i`, the delta at
//! `b_i` is `d_i = v_i - v_{i-1}`. The score at `t = b_n` is
//!
//! ```text
//! score(t) = Σ d_i * (1 - (t - b_i) / W)    over deltas with t - b_i < W
//! ```
//!
//! Expanding the weight gives `S0 * (1 - t / W) + S1 / W` with running sums
//! `S0 = Σ d_i` and `S1 = Σ d_i * b_i`. Each delta is added once and evicted
//! once, so folding a new bucket costs O(1) amortized.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

const REBASE_AFTER_WINDOWS: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
struct Delta {
    /// Seconds since the accumulator's anchor.
    at: f64,
    value: f64,
}

/// Running trend score for one metric of one entity.
#[derive(Debug, Clone)]
pub struct TrendAccumulator {
    window_secs: f64,
    anchor: Option<DateTime<Utc>>,
    deltas: VecDeque<Delta>,
    s0: f64,
    s1: f64,
    last_bucket: Option<DateTime<Utc>>,
    last_value: Option<f64>,
    score: f64,
}

impl TrendAccumulator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs_f64().max(1.0),
            anchor: None,
            deltas: VecDeque::new(),
            s0: 0.0,
            s1: 0.0,
            last_bucket: None,
            last_value: None,
            score: 0.0,
        }
    }

    /// Score as of the newest folded bucket.
    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn last_bucket(&self) -> Option<DateTime<Utc>> {
        self.last_bucket
    }

    /// Number of deltas currently inside the window.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Fold the closed value of the bucket starting at `bucket_start`.
    ///
    /// Buckets must arrive in increasing order; anything at or before the
    /// newest folded bucket is ignored and `None` is returned.
    pub fn fold(&mut self, bucket_start: DateTime<Utc>, value: f64) -> Option<f64> {
        if self.last_bucket.is_some_and(|last| bucket_start <= last) {
            return None;
        }
        let anchor = *self.anchor.get_or_insert(bucket_start);
        let mut t = (bucket_start - anchor).num_milliseconds() as f64 / 1000.0;

        if let Some(previous) = self.last_value {
            let delta = Delta {
                at: t,
                value: value - previous,
            };
            self.s0 += delta.value;
            self.s1 += delta.value * delta.at;
            self.deltas.push_back(delta);
        }
        self.last_bucket = Some(bucket_start);
        self.last_value = Some(value);

        while let Some(oldest) = self.deltas.front().copied() {
            if t - oldest.at < self.window_secs {
                break;
            }
            self.deltas.pop_front();
            self.s0 -= oldest.value;
            self.s1 -= oldest.value * oldest.at;
        }
        if self.deltas.is_empty() {
            // Drop accumulated rounding error.
            self.s0 = 0.0;
            self.s1 = 0.0;
        }
        if t > REBASE_AFTER_WINDOWS * self.window_secs {
            self.rebase(bucket_start, t);
            t = 0.0;
        }

        self.score = self.s0 * (1.0 - t / self.window_secs) + self.s1 / self.window_secs;
        Some(self.score)
    }

    /// Move the anchor to `bucket_start` so offsets (and `S1`) stay small.
    ///
    /// Runs at most once per few windows of elapsed time and touches only the
    /// deltas still inside the window.
    fn rebase(&mut self, bucket_start: DateTime<Utc>, shift: f64) {
        self.anchor = Some(bucket_start);
        self.s0 = 0.0;
        self.s1 = 0.0;
        for delta in self.deltas.iter_mut() {
            delta.at -= shift;
            self.s0 += delta.value;
            self.s1 += delta.value * delta.at;
        }
    }
}

/// Reference implementation: recompute the score from the full history.
///
/// `points` are `(bucket_start, value)` pairs in increasing bucket order.
pub fn naive_trend_score(points: &[(DateTime<Utc>, f64)], window: Duration) -> f64 {
    let Some(&(now, _)) = points.last() else {
        return 0.0;
    };
    let window_secs = window.as_secs_f64().max(1.0);

    points
        .windows(2)
        .map(|pair| {
            let (at, value) = pair[1];
            let delta = value - pair[0].1;
            let age = (now - at).num_milliseconds() as f64 / 1000.0;
            if age < window_secs {
                delta * (1.0 - age / window_secs)
            } else {
                0.0
            }
        })
        .sum()
}
