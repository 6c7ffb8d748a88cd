//! Message types passed between session tasks.
//!
//! Vendor callbacks and pipeline stages never mutate session state; they
//! post these messages into the session's mailbox (data) or control
//! channel (preemptive signals) and the session task applies them.

use bytes::Bytes;

use crate::error::CompanionError;
use crate::frames::OutboundFrame;
use crate::vendor::AudioStreamConfig;

/// Transport-initiated operations, posted by the controller facade.
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin a microphone stream.
    OpenAudioStream(AudioStreamConfig),
    /// One chunk of client audio.
    PushAudioChunk(Bytes),
    /// Client closed the microphone stream.
    CloseAudioStream,
    /// Keepalive.
    Ping,
}

/// Events from the STT ingress task.
#[derive(Debug)]
pub enum SttBridgeEvent {
    /// Cumulative partial transcript, unfiltered.
    Partial(String),
    /// Raw final transcript. The session task applies the final filter.
    Final(String),
    /// The vendor event stream closed. `error` is set when it closed with
    /// a reported failure rather than a clean end.
    Closed { error: Option<SttFailure> },
}

/// A reported STT vendor failure.
#[derive(Debug)]
pub struct SttFailure {
    pub message: String,
    pub fatal: bool,
}

/// Events from the per-turn LLM → TTS bridge task. Tagged with the turn's
/// playback id so a late event from a cancelled turn is ignored.
#[derive(Debug)]
pub enum TurnEvent {
    /// Reply token(s) in LLM order.
    Token { text: String },
    /// First TTS chunk is about to arrive; the session enters `Speaking`.
    SpeakingStarted,
    /// One synthesized audio chunk in TTS order.
    Audio { chunk: Bytes },
    /// TTS closed and everything the bridge produced has been posted.
    Finished { reply: String },
    /// The turn failed; `reply` holds whatever was generated before.
    Failed {
        error: CompanionError,
        reply: String,
    },
}

/// Everything the session task consumes from its mailbox.
#[derive(Debug)]
pub enum SessionMessage {
    Command(SessionCommand),
    Stt(SttBridgeEvent),
    Turn { playback_id: u64, event: TurnEvent },
}

/// Preemptive signals, delivered on the unbounded control channel so they
/// jump ahead of queued data.
#[derive(Debug)]
pub enum ControlMsg {
    /// User barge-in (or transport-local interrupt).
    Interrupt,
    /// The outbound writer gave up delivering a turn frame.
    SlowConsumer { playback_id: u64 },
    /// The scaffold warm requested at attach has completed.
    ScaffoldReady,
    /// A malformed frame was received; report it without changing state.
    ClientProtocol { message: String },
}

/// A frame on its way to the client. Turn frames carry the playback id so
/// the outbound writer can drop chunks orphaned by barge-in.
#[derive(Debug)]
pub struct OutboundEvent {
    pub frame: OutboundFrame,
    pub playback_id: Option<u64>,
}

impl OutboundEvent {
    #[must_use]
    pub fn frame(frame: OutboundFrame) -> Self {
        Self {
            frame,
            playback_id: None,
        }
    }

    #[must_use]
    pub fn turn_frame(frame: OutboundFrame, playback_id: u64) -> Self {
        Self {
            frame,
            playback_id: Some(playback_id),
        }
    }
}
