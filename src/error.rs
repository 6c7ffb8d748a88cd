//! Error types for the solace session core.

/// Top-level error type for the voice companion core.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Malformed frame or out-of-sequence control from the client.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Transient vendor failure (timeout, disconnect, 5xx). Retryable.
    #[error("vendor transient error: {0}")]
    VendorTransient(String),

    /// Permanent vendor failure (auth, quota). Not retryable.
    #[error("vendor fatal error: {0}")]
    VendorFatal(String),

    /// Outbound sink cannot keep up; the current turn is failed.
    #[error("slow_consumer: outbound sink stalled")]
    SlowConsumer,

    /// User-initiated barge-in. Not a failure.
    #[error("turn interrupted")]
    Interrupted,

    /// Speech-to-text bridge error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model stream error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech stream error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Memory subsystem error. Never surfaced to a client mid-turn.
    #[error("memory error: {0}")]
    Memory(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error between session tasks.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompanionError {
    /// Whether this error should tear the whole session down rather than
    /// just failing the current turn.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VendorFatal(_) | Self::Io(_))
    }

    /// The message placed in an outbound `error` frame.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::SlowConsumer => "slow_consumer".to_owned(),
            Self::VendorTransient(m) => format!("vendor_timeout: {m}"),
            other => other.to_string(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;
