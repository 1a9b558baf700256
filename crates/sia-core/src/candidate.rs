use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a candidate revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Proposed,
    Validated,
    Evaluated,
    Promoted,
    Rejected,
    Quarantined,
}

/// One immutable revision of the optimized artifact.
///
/// The id embeds the creation round and a content-hash prefix, so two
/// candidates with differing content never share an id and window results
/// keyed by (candidate_id, window_id) never collide across revisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub parent_id: Option<String>,
    pub round: u32,
    pub content: String,
    pub content_hash: String,
    pub status: CandidateStatus,
}

impl Candidate {
    pub fn new(round: u32, content: String, parent_id: Option<String>) -> Self {
        let content_hash = content_sha256(&content);
        let id = format!("r{:03}-{}", round, &content_hash[..8]);
        Self {
            id,
            parent_id,
            round,
            content,
            content_hash,
            status: CandidateStatus::Proposed,
        }
    }

    /// Wrap the initial artifact as the round-0 baseline.
    pub fn seed(content: String) -> Self {
        let mut c = Self::new(0, content, None);
        c.status = CandidateStatus::Promoted;
        c
    }
}

/// Lowercase hex SHA-256 of the artifact text.
pub fn content_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
