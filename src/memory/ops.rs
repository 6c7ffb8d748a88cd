//! Typed memory operations and their dedupe fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Seconds per dedupe-hash time bucket. Two identical payloads enqueued in
/// the same hour hash identically.
const BUCKET_SECS: u64 = 3_600;

/// The kinds of writes the memory subsystem performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOpKind {
    /// One conversation turn (user text + reply text).
    Conversation,
    /// A scaffold profile snapshot.
    ScaffoldUpdate,
    /// A background-analysis cycle summary.
    RelationshipEvolution,
    /// An edge in the relationship graph.
    GraphRelationship,
}

impl MemoryOpKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::ScaffoldUpdate => "scaffold_update",
            Self::RelationshipEvolution => "relationship_evolution",
            Self::GraphRelationship => "graph_relationship",
        }
    }
}

/// One queued write toward the memory store.
///
/// Delivered at-least-once to the writer, applied at-most-once per dedupe
/// hash within the writer's observation window.
#[derive(Debug, Clone)]
pub struct MemoryOperation {
    pub id: String,
    pub kind: MemoryOpKind,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub dedupe_hash: [u8; 32],
    pub enqueued_at: tokio::time::Instant,
    pub attempts: u32,
}

impl MemoryOperation {
    /// Build an operation, stamping its dedupe hash from the current hour
    /// bucket.
    #[must_use]
    pub fn new(kind: MemoryOpKind, user_id: &str, payload: serde_json::Value) -> Self {
        let dedupe_hash = dedupe_hash(user_id, kind, &payload, epoch_secs());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user_id: user_id.to_owned(),
            payload,
            dedupe_hash,
            enqueued_at: tokio::time::Instant::now(),
            attempts: 0,
        }
    }
}

/// Deterministic fingerprint over `(user_id, kind, normalized payload,
/// hour bucket)`.
///
/// `serde_json`'s map type keeps keys sorted, so serializing the payload
/// yields a normalized byte sequence without extra work.
#[must_use]
pub fn dedupe_hash(
    user_id: &str,
    kind: MemoryOpKind,
    payload: &serde_json::Value,
    now_epoch_secs: u64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update((now_epoch_secs / BUCKET_SECS).to_le_bytes());
    hasher.finalize().into()
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
