//! Solace: real-time voice companion session orchestration core.
//!
//! A user streams microphone audio in; the core transcribes it, obtains a
//! streaming language-model reply, synthesizes audio, and streams frames
//! back incrementally, so the first sound plays within about a second of
//! end-of-utterance.
//!
//! # Architecture
//!
//! The core is built from per-session tasks connected by bounded async
//! channels:
//! - **Session controller**: owns the state machine; the only emitter of
//!   outbound frames
//! - **STT bridge**: forwards client audio upstream and filters finals
//! - **LLM → TTS bridge**: boundary-buffered token-to-audio coupling
//! - **Outbound writer**: per-session ordered delivery with stale-playback
//!   filtering
//!
//! Beside the sessions runs the asynchronous memory subsystem: a writer
//! queue draining typed operations to the memory store, a per-user
//! scaffold cache guarded against background/realtime races, and a gated
//! background analyzer that keeps each user's profile current.

pub mod analyzer;
pub mod config;
pub mod core;
pub mod error;
pub mod frames;
pub mod memory;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod scaffold;
pub mod session;
pub mod telemetry;
pub mod vendor;

pub use crate::config::CompanionConfig;
pub use crate::core::{Core, VendorSet};
pub use crate::error::{CompanionError, Result};
pub use crate::frames::{InboundFrame, OutboundFrame, SessionStatus};
pub use crate::session::{SessionController, SessionState};
