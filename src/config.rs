//! Configuration types for the session orchestration core.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CompanionError, Result};

/// Top-level configuration for the companion core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Per-session controller settings.
    pub session: SessionConfig,
    /// LLM → TTS streaming bridge settings.
    pub pipeline: PipelineConfig,
    /// Scaffold cache settings (freshness guard, merge weights).
    pub scaffold: ScaffoldConfig,
    /// Memory writer settings (dedupe, batching, retry).
    pub writer: WriterConfig,
    /// Background analyzer settings.
    pub analyzer: AnalyzerConfig,
    /// Voice settings passed opaquely to the TTS vendor.
    pub voice: VoiceConfig,
}

impl CompanionConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults, so a partial file is
    /// valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| CompanionError::Config(format!("parse {path:?}: {e}")))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CompanionError::Config(e.to_string()))
    }
}

/// Per-session controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Mailbox capacity: messages queued for the session task.
    pub mailbox_capacity: usize,
    /// Outbound frame channel capacity toward the client sink.
    pub outbound_capacity: usize,
    /// How long an outbound audio/token frame may wait on a full sink
    /// before the turn is failed with `slow_consumer` (ms).
    pub slow_consumer_timeout_ms: u64,
    /// Bound on each cleanup subcall (STT close, TTS close, drain) (ms).
    pub cleanup_step_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            outbound_capacity: 128,
            slow_consumer_timeout_ms: 4_000,
            cleanup_step_timeout_ms: 2_000,
        }
    }
}

/// LLM → TTS streaming bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded channel capacity for LLM tokens.
    pub token_channel_capacity: usize,
    /// Bounded channel capacity for TTS audio chunks.
    pub audio_channel_capacity: usize,
    /// Soft threshold (bytes) past which clause punctuation also flushes
    /// the boundary buffer.
    pub boundary_soft_limit_bytes: usize,
    /// Idle flush: buffered text is pushed to TTS after this long without
    /// a new token (ms). Avoids audio underruns on slow generations.
    pub boundary_idle_flush_ms: u64,
    /// Timeout for a vendor stream to produce its first event (ms).
    pub request_start_timeout_ms: u64,
    /// Total wall-clock bound on a single vendor stream (ms).
    pub stream_total_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            token_channel_capacity: 64,
            audio_channel_capacity: 32,
            boundary_soft_limit_bytes: 60,
            boundary_idle_flush_ms: 180,
            request_start_timeout_ms: 15_000,
            stream_total_timeout_ms: 60_000,
        }
    }
}

/// Scaffold cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaffoldConfig {
    /// A realtime entry younger than this is protected from background
    /// overwrite; background updates merge instead (seconds).
    pub freshness_window_secs: u64,
    /// Weight of the background value when merging numeric fields.
    /// The realtime value keeps `1 - background_weight`.
    pub background_weight: f64,
    /// Maximum synchronous wait for the per-user scaffold lock on the
    /// prompt-assembly hot path (ms). Exceeding it falls back to the
    /// empty profile.
    pub lookup_timeout_ms: u64,
}

impl Default for ScaffoldConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 120,
            background_weight: 0.4,
            lookup_timeout_ms: 150,
        }
    }
}

/// Memory writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Capacity of the multi-producer operation queue.
    pub queue_capacity: usize,
    /// An operation whose dedupe hash was observed within this window is
    /// dropped (seconds).
    pub dedupe_window_secs: u64,
    /// Operations of the same `(user, kind)` arriving within this window
    /// are coalesced into one vendor call (ms).
    pub batch_window_ms: u64,
    /// Maximum operations per coalesced batch.
    pub batch_max: usize,
    /// Initial retry backoff (ms).
    pub retry_initial_ms: u64,
    /// Backoff multiplier per attempt.
    pub retry_factor: f64,
    /// Backoff ceiling (ms).
    pub retry_cap_ms: u64,
    /// Attempts before an operation is logged and dropped.
    pub retry_max_attempts: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            dedupe_window_secs: 600,
            batch_window_ms: 250,
            batch_max: 16,
            retry_initial_ms: 500,
            retry_factor: 2.0,
            retry_cap_ms: 30_000,
            retry_max_attempts: 5,
        }
    }
}

/// Background analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Shortest cycle interval (seconds). Used when the user converses
    /// frequently.
    pub min_interval_secs: u64,
    /// Longest cycle interval (seconds). Used for quiet users.
    pub max_interval_secs: u64,
    /// A cycle is skipped when the user had a turn finish within this
    /// window (seconds).
    pub recent_turn_guard_secs: u64,
    /// The analyzer task exits after the user has had no sessions for
    /// this long (seconds).
    pub grace_period_secs: u64,
    /// Window over which turn frequency is measured for the adaptive
    /// interval (seconds).
    pub frequency_window_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 300,
            recent_turn_guard_secs: 5,
            grace_period_secs: 900,
            frequency_window_secs: 600,
        }
    }
}

/// Voice settings handed opaquely to the TTS vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Vendor voice identifier.
    pub voice_id: String,
    /// Output encoding requested from the vendor.
    pub encoding: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: "companion-warm-1".to_owned(),
            encoding: "mp3".to_owned(),
            sample_rate: 24_000,
        }
    }
}
