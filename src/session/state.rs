//! Per-session lifecycle states.
//!
//! The state is the single source of truth for which outbound event types
//! and inbound operations are legal. Transitions happen only inside the
//! session task, so no lock is needed beyond the mailbox itself.

/// Lifecycle of one session.
///
/// ```text
/// Idle ──start_audio──▶ Recording
/// Recording ──speech_final (non-empty, non-duplicate)──▶ Finalizing
/// Recording ──cancel──▶ Idle
/// Finalizing ──prompt_built──▶ Generating
/// Generating ──first_tts_chunk──▶ Speaking
/// Speaking ──stream_end & queue_drained──▶ Idle
/// {Generating, Speaking} ──barge_in / fatal──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client to start an audio stream.
    Idle,
    /// Client audio is flowing to STT.
    Recording,
    /// A final transcript was accepted; the prompt is being assembled.
    Finalizing,
    /// LLM tokens are streaming; no TTS audio yet.
    Generating,
    /// TTS audio is streaming (or draining after the LLM finished).
    Speaking,
}

impl SessionState {
    /// Whether the session belongs in the process-wide active set.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Whether a turn is generating or speaking. At most one turn per
    /// session may be in this range.
    #[must_use]
    pub fn in_turn(self) -> bool {
        matches!(self, Self::Generating | Self::Speaking)
    }

    /// Whether client audio is accepted right now. Chunks arriving in any
    /// other state are dropped with a warning.
    #[must_use]
    pub fn accepts_audio(self) -> bool {
        matches!(self, Self::Recording)
    }

    /// Whether `audio_stream_start` is legal.
    #[must_use]
    pub fn can_start_recording(self) -> bool {
        matches!(self, Self::Idle)
    }
}
