//! Per-user scaffold cache.
//!
//! A scaffold is the psychological profile consumed by prompt assembly.
//! Two writers race on it: the session (realtime updates extracted from the
//! turn) and the background analyzer. The cache serializes them with a
//! per-user mutex and arbitrates with the freshness guard: a realtime entry
//! younger than the freshness window is merged with, never overwritten by,
//! a background update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ScaffoldConfig;

/// Categorical background values that override a fresh realtime value
/// during a merge. Everything else defers to realtime inside the freshness
/// window.
const CRITICAL_TRANSITIONS: &[&str] = &["crisis", "acute_distress", "withdrawal", "dissociation"];

/// Which write path produced the cached scaffold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldOrigin {
    Realtime,
    Background,
    Merged,
}

/// One profile field value. The field set is opaque to the core; only the
/// value shape matters for merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldValue {
    /// Categorical field, e.g. an emotional undercurrent label.
    Text(String),
    /// Numeric field, merged by weighted average.
    Number(f64),
    /// List field, e.g. support needs, merged by set union.
    List(BTreeSet<String>),
}

/// Per-user psychological profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scaffold {
    /// Opaque profile fields.
    pub fields: BTreeMap<String, ScaffoldValue>,
    /// Relationship intimacy score in `0..1`.
    pub intimacy: f64,
}

impl Scaffold {
    /// The profile used when nothing is cached for the user.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A read-path copy of the cached entry.
#[derive(Debug, Clone)]
pub struct ScaffoldSnapshot {
    pub scaffold: Scaffold,
    pub origin: ScaffoldOrigin,
    pub updated_at: Instant,
}

struct CacheSlot {
    scaffold: Scaffold,
    origin: ScaffoldOrigin,
    updated_at: Instant,
}

type UserEntry = Arc<Mutex<Option<CacheSlot>>>;

/// Process-wide scaffold cache. Keys are always user ids; per-user mutexes
/// keep users from contending with each other.
pub struct ScaffoldCache {
    config: ScaffoldConfig,
    users: StdMutex<HashMap<String, UserEntry>>,
}

impl ScaffoldCache {
    #[must_use]
    pub fn new(config: ScaffoldConfig) -> Self {
        Self {
            config,
            users: StdMutex::new(HashMap::new()),
        }
    }

    fn user_entry(&self, user_id: &str) -> UserEntry {
        let mut users = match self.users.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        users
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Read the cached scaffold for the hot path. Bounded by the
    /// configured lookup timeout; returns `None` on a cold cache or when
    /// the per-user lock cannot be acquired in time.
    pub async fn get_for_session(&self, user_id: &str) -> Option<ScaffoldSnapshot> {
        let entry = self.user_entry(user_id);
        let timeout = Duration::from_millis(self.config.lookup_timeout_ms);
        let guard = tokio::time::timeout(timeout, entry.lock()).await.ok()?;
        guard.as_ref().map(|slot| ScaffoldSnapshot {
            scaffold: slot.scaffold.clone(),
            origin: slot.origin,
            updated_at: slot.updated_at,
        })
    }

    /// Whether any entry exists for the user (without the read timeout).
    pub async fn has_entry(&self, user_id: &str) -> bool {
        let entry = self.user_entry(user_id);
        let result = entry.lock().await.is_some();
        result
    }

    /// Realtime write path. A realtime update always wins: it is newer
    /// than any cached realtime and newer than any background.
    pub async fn apply_realtime(&self, user_id: &str, scaffold: Scaffold) {
        let entry = self.user_entry(user_id);
        let mut guard = entry.lock().await;
        let now = Instant::now();
        let updated_at = match guard.as_ref() {
            // Monotonic: never move updated_at backwards.
            Some(slot) if slot.updated_at > now => slot.updated_at,
            _ => now,
        };
        *guard = Some(CacheSlot {
            scaffold,
            origin: ScaffoldOrigin::Realtime,
            updated_at,
        });
        debug!(user = user_id, "realtime scaffold applied");
    }

    /// Background write path, subject to the freshness guard. Returns the
    /// origin of the resulting entry.
    pub async fn apply_background(&self, user_id: &str, incoming: Scaffold) -> ScaffoldOrigin {
        let entry = self.user_entry(user_id);
        let mut guard = entry.lock().await;
        let now = Instant::now();
        let freshness = Duration::from_secs(self.config.freshness_window_secs);

        let origin = match guard.as_ref() {
            Some(slot)
                if slot.origin == ScaffoldOrigin::Realtime
                    && now.duration_since(slot.updated_at) < freshness =>
            {
                let merged = merge_scaffolds(
                    &slot.scaffold,
                    &incoming,
                    self.config.background_weight,
                );
                let updated_at = slot.updated_at.max(now);
                *guard = Some(CacheSlot {
                    scaffold: merged,
                    origin: ScaffoldOrigin::Merged,
                    updated_at,
                });
                ScaffoldOrigin::Merged
            }
            _ => {
                *guard = Some(CacheSlot {
                    scaffold: incoming,
                    origin: ScaffoldOrigin::Background,
                    updated_at: now,
                });
                ScaffoldOrigin::Background
            }
        };
        debug!(user = user_id, ?origin, "background scaffold applied");
        origin
    }

    /// Drop the per-user mutex entry when it was never populated. Called
    /// on session detach; purely an allocation optimization.
    pub async fn reclaim_if_empty(&self, user_id: &str) {
        let entry = self.user_entry(user_id);
        if entry.lock().await.is_some() {
            return;
        }
        let mut users = match self.users.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        users.remove(user_id);
    }
}

/// Field-level merge of a background update into a fresh realtime entry.
///
/// Fixed policy table:
/// - numeric fields and the intimacy score: weighted average, background
///   weight `w` (realtime keeps `1 - w`);
/// - list fields: set union;
/// - categorical fields: realtime wins unless the background value is in
///   [`CRITICAL_TRANSITIONS`];
/// - type mismatch: realtime wins;
/// - fields present on one side only are kept.
fn merge_scaffolds(realtime: &Scaffold, background: &Scaffold, w: f64) -> Scaffold {
    let mut fields = BTreeMap::new();
    let keys: BTreeSet<&String> = realtime
        .fields
        .keys()
        .chain(background.fields.keys())
        .collect();

    for key in keys {
        let merged = match (realtime.fields.get(key), background.fields.get(key)) {
            (Some(ScaffoldValue::Number(rt)), Some(ScaffoldValue::Number(bg))) => {
                ScaffoldValue::Number(rt * (1.0 - w) + bg * w)
            }
            (Some(ScaffoldValue::List(rt)), Some(ScaffoldValue::List(bg))) => {
                ScaffoldValue::List(rt.union(bg).cloned().collect())
            }
            (Some(ScaffoldValue::Text(rt)), Some(ScaffoldValue::Text(bg))) => {
                if CRITICAL_TRANSITIONS.contains(&bg.as_str()) {
                    ScaffoldValue::Text(bg.clone())
                } else {
                    ScaffoldValue::Text(rt.clone())
                }
            }
            (Some(rt), Some(_)) => rt.clone(),
            (Some(rt), None) => rt.clone(),
            (None, Some(bg)) => bg.clone(),
            (None, None) => continue,
        };
        fields.insert(key.clone(), merged);
    }

    Scaffold {
        fields,
        intimacy: (realtime.intimacy * (1.0 - w) + background.intimacy * w).clamp(0.0, 1.0),
    }
}
