//! The latency-critical streaming pipeline: boundary-buffered token flow
//! from the LLM into the TTS, and the typed messages session tasks
//! exchange.

pub mod boundary;
pub mod bridge;
pub mod messages;
