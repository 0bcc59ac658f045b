//! Deterministic deduplication keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest identifying a unit of work or a piece of content.
///
/// Two requests with the same fingerprint are interchangeable: whichever runs
/// first may answer for both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a job: a pure function of its kind tag and payload bytes.
    pub fn for_job(kind: &str, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"job:");
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload);
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a text body (comment classification cache key).
    pub fn for_text(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"text:");
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_fingerprint_depends_on_kind_and_payload() {
        let a = Fingerprint::for_job("scrape_video", br#"{"video_id":"v1"}"#);
        let b = Fingerprint::for_job("scrape_video", br#"{"video_id":"v1"}"#);
        let c = Fingerprint::for_job("scrape_video", br#"{"video_id":"v2"}"#);
        let d = Fingerprint::for_job("analyze_comments", br#"{"video_id":"v1"}"#);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn kind_and_payload_boundary_is_unambiguous() {
        assert_ne!(Fingerprint::for_job("ab", b"c"), Fingerprint::for_job("a", b"bc"));
    }

    #[test]
    fn text_and_job_namespaces_do_not_collide() {
        assert_ne!(Fingerprint::for_text("x"), Fingerprint::for_job("", b"x"));
        assert_eq!(Fingerprint::for_text("x").short().len(), 12);
    }
}
