//! Framed client transport messages.
//!
//! The transport is bidirectional, reliable, and ordered; each frame is a
//! tagged JSON object. The core consumes [`InboundFrame`]s and emits
//! [`OutboundFrame`]s on the session's event sink as a single totally
//! ordered sequence per session.

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client audio encoding accepted by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Raw interleaved signed 16-bit little-endian PCM.
    #[default]
    #[serde(rename = "raw_pcm_s16le")]
    RawPcmS16le,
}

/// Frames received from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Begin a microphone stream.
    AudioStreamStart {
        sample_rate: u32,
        channels: u8,
        format: AudioFormat,
    },
    /// A chunk of microphone audio, base64-encoded.
    AudioChunk { audio_data: String },
    /// End of the microphone stream.
    AudioStreamEnd,
    /// Barge-in: stop the assistant mid-reply.
    InterruptSpeech,
    /// Keepalive.
    Ping,
}

/// Session status values surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    ScaffoldWarming,
    ScaffoldReady,
    Recording,
    RecordingComplete,
    TranscriptionComplete,
    LlmTtsStreaming,
    StreamingComplete,
}

/// Frames emitted to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Pipeline stage notification.
    Status { status: SessionStatus },
    /// Cumulative partial transcript of the current utterance.
    TranscriptToken { content: String },
    /// Incremental reply token(s) from the LLM.
    TokenStream { content: String },
    /// Incremental synthesized audio, base64-encoded MP3-compatible bytes.
    AudioChunk { audio_data: String },
    /// Terminal turn summary. Carries text only; audio is delivered
    /// exclusively via `audio_chunk` frames.
    Result {
        transcript: String,
        ai_response: String,
    },
    /// An error that terminated the current turn or session.
    Error { message: String },
    /// Acknowledgement of barge-in.
    SpeechInterrupted,
}

impl OutboundFrame {
    /// Build an audio frame from raw synthesized bytes.
    #[must_use]
    pub fn audio(bytes: &Bytes) -> Self {
        Self::AudioChunk {
            audio_data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// Decode the base64 payload of an inbound `audio_chunk`.
///
/// # Errors
///
/// Returns a `ClientProtocol` error when the payload is not valid base64.
pub fn decode_audio_payload(audio_data: &str) -> crate::error::Result<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(audio_data)
        .map(Bytes::from)
        .map_err(|e| crate::error::CompanionError::ClientProtocol(format!("bad audio_data: {e}")))
}
