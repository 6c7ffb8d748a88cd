//! Per-turn LLM → TTS bridge.
//!
//! One task per turn couples the LLM token stream to the TTS stream
//! through the boundary buffer and posts everything it produces to the
//! session mailbox. Two bounded channels join the three cooperating tasks:
//! the token channel between the LLM pump and the bridge, and the audio
//! channel between the TTS pump and the bridge. The TTS upstream opens
//! lazily on the first flush, so a reply that dies in the LLM never
//! touches the TTS vendor.
//!
//! Backpressure is structural: mailbox, token, and audio channels are all
//! bounded, so a stalled outbound sink backs up through here and pauses
//! the LLM subscription at the channel boundary. The outbound writer
//! converts a sustained stall into a `slow_consumer` turn failure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, VoiceConfig};
use crate::error::CompanionError;
use crate::pipeline::boundary::BoundaryBuffer;
use crate::pipeline::messages::{SessionMessage, TurnEvent};
use crate::prompt::Prompt;
use crate::vendor::{LlmClient, LlmEvent, TtsClient};

/// Everything a turn bridge needs, bundled the way stage tasks take their
/// control state.
pub struct TurnBridge {
    pub playback_id: u64,
    pub prompt: Prompt,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub voice: VoiceConfig,
    pub config: PipelineConfig,
    pub mailbox: mpsc::Sender<SessionMessage>,
    pub cancel: CancellationToken,
}

enum Outcome {
    Finished,
    Cancelled,
    Failed,
}

impl TurnBridge {
    /// Run the turn to completion, cancellation, or failure.
    pub async fn run(self) {
        let playback_id = self.playback_id;
        match self.drive().await {
            Outcome::Finished => debug!(playback_id, "turn bridge finished"),
            Outcome::Cancelled => debug!(playback_id, "turn bridge cancelled"),
            Outcome::Failed => {}
        }
    }

    async fn drive(self) -> Outcome {
        let TurnBridge {
            playback_id,
            prompt,
            llm,
            tts,
            voice,
            config,
            mailbox,
            cancel,
        } = self;

        let post = Poster {
            playback_id,
            mailbox,
            cancel: cancel.clone(),
        };

        let request_start = Duration::from_millis(config.request_start_timeout_ms);
        let stream_total = Duration::from_millis(config.stream_total_timeout_ms);
        let idle_flush = Duration::from_millis(config.boundary_idle_flush_ms);

        let llm_rx = match tokio::time::timeout(request_start, llm.stream_reply(&prompt)).await {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => return post.fail(e, String::new()).await,
            Err(_) => {
                return post
                    .fail(
                        CompanionError::VendorTransient("LLM request start timed out".into()),
                        String::new(),
                    )
                    .await
            }
        };

        // Token channel: LLM pump → bridge.
        let (token_tx, mut token_rx) = mpsc::channel::<LlmEvent>(config.token_channel_capacity);
        spawn_llm_pump(llm_rx, token_tx, cancel.clone());

        let mut tts_feed = TtsFeed {
            tts,
            voice,
            open_timeout: request_start,
            audio_capacity: config.audio_channel_capacity,
            cancel: cancel.clone(),
            text: None,
            audio: None,
        };

        let mut boundary = BoundaryBuffer::new(config.boundary_soft_limit_bytes);
        let mut reply = String::new();
        let mut llm_done = false;
        let mut speaking = false;
        let deadline = Instant::now() + stream_total;
        let mut idle_deadline = Instant::now() + idle_flush;

        loop {
            let recv_token = async {
                if llm_done {
                    std::future::pending().await
                } else {
                    token_rx.recv().await
                }
            };
            let recv_audio = async {
                match tts_feed.audio.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            let idle_tick = async {
                if llm_done || boundary.is_empty() {
                    std::future::pending().await
                } else {
                    tokio::time::sleep_until(idle_deadline).await;
                }
            };

            enum Step {
                Token(Option<LlmEvent>),
                Audio(Option<Bytes>),
                IdleFlush,
                Deadline,
                Cancelled,
            }

            let step = tokio::select! {
                () = cancel.cancelled() => Step::Cancelled,
                () = tokio::time::sleep_until(deadline) => Step::Deadline,
                ev = recv_token => Step::Token(ev),
                chunk = recv_audio => Step::Audio(chunk),
                () = idle_tick => Step::IdleFlush,
            };

            match step {
                Step::Cancelled => return Outcome::Cancelled,
                Step::Deadline => {
                    return post
                        .fail(
                            CompanionError::VendorTransient(
                                "vendor stream exceeded total timeout".into(),
                            ),
                            reply,
                        )
                        .await
                }
                Step::Token(Some(LlmEvent::Token { text })) => {
                    if text.is_empty() {
                        continue;
                    }
                    reply.push_str(&text);
                    if !post.send(TurnEvent::Token { text: text.clone() }).await {
                        return Outcome::Cancelled;
                    }
                    idle_deadline = Instant::now() + idle_flush;
                    for segment in boundary.push(&text) {
                        match tts_feed.send(segment).await {
                            SegmentSent::Ok => {}
                            SegmentSent::Cancelled => return Outcome::Cancelled,
                            SegmentSent::Failed(e) => return post.fail(e, reply).await,
                        }
                    }
                }
                Step::Token(Some(LlmEvent::Error { message, fatal })) => {
                    let error = if fatal {
                        CompanionError::VendorFatal(message)
                    } else {
                        CompanionError::VendorTransient(message)
                    };
                    return post.fail(error, reply).await;
                }
                Step::Token(None) => {
                    llm_done = true;
                    if let Some(tail) = boundary.drain() {
                        match tts_feed.send(tail).await {
                            SegmentSent::Ok => {}
                            SegmentSent::Cancelled => return Outcome::Cancelled,
                            SegmentSent::Failed(e) => return post.fail(e, reply).await,
                        }
                    }
                    // Close the TTS upstream; the vendor finishes what it
                    // has and then closes the audio stream.
                    tts_feed.text = None;
                    if tts_feed.audio.is_none() {
                        // Nothing was ever flushed (empty reply).
                        if !post.send(TurnEvent::Finished { reply }).await {
                            return Outcome::Cancelled;
                        }
                        return Outcome::Finished;
                    }
                }
                Step::Audio(Some(chunk)) => {
                    if !speaking {
                        speaking = true;
                        if !post.send(TurnEvent::SpeakingStarted).await {
                            return Outcome::Cancelled;
                        }
                    }
                    if !post.send(TurnEvent::Audio { chunk }).await {
                        return Outcome::Cancelled;
                    }
                }
                Step::Audio(None) => {
                    if llm_done {
                        // TTS drained after the LLM finished. The session
                        // processes the queued audio ahead of this event,
                        // so stream end is emitted only after drain.
                        if !post.send(TurnEvent::Finished { reply }).await {
                            return Outcome::Cancelled;
                        }
                        return Outcome::Finished;
                    }
                    warn!(playback_id, "TTS stream closed mid-generation");
                    return post
                        .fail(
                            CompanionError::Tts("stream closed before reply finished".into()),
                            reply,
                        )
                        .await;
                }
                Step::IdleFlush => {
                    if let Some(segment) = boundary.drain() {
                        match tts_feed.send(segment).await {
                            SegmentSent::Ok => {}
                            SegmentSent::Cancelled => return Outcome::Cancelled,
                            SegmentSent::Failed(e) => return post.fail(e, reply).await,
                        }
                    }
                    idle_deadline = Instant::now() + idle_flush;
                }
            }
        }
    }
}

/// Forward LLM events into the bounded token channel. A full channel
/// pauses the subscription here, at the vendor boundary.
fn spawn_llm_pump(
    mut llm_rx: mpsc::Receiver<LlmEvent>,
    token_tx: mpsc::Sender<LlmEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                ev = llm_rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let send = tokio::select! {
                () = cancel.cancelled() => Err(()),
                sent = token_tx.send(event) => sent.map_err(|_| ()),
            };
            if send.is_err() {
                break;
            }
        }
    });
}

enum SegmentSent {
    Ok,
    Cancelled,
    Failed(CompanionError),
}

/// Lazily opened TTS upstream plus the bounded audio channel its pump
/// feeds.
struct TtsFeed {
    tts: Arc<dyn TtsClient>,
    voice: VoiceConfig,
    open_timeout: Duration,
    audio_capacity: usize,
    cancel: CancellationToken,
    text: Option<mpsc::Sender<String>>,
    audio: Option<mpsc::Receiver<Bytes>>,
}

impl TtsFeed {
    /// Push one text segment, opening the upstream on first use.
    async fn send(&mut self, segment: String) -> SegmentSent {
        if self.text.is_none() {
            match tokio::time::timeout(self.open_timeout, self.tts.open_stream(&self.voice)).await
            {
                Ok(Ok(handle)) => {
                    let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(self.audio_capacity);
                    spawn_tts_pump(handle.audio, audio_tx, self.cancel.clone());
                    self.text = Some(handle.text);
                    self.audio = Some(audio_rx);
                }
                Ok(Err(e)) => return SegmentSent::Failed(e),
                Err(_) => {
                    return SegmentSent::Failed(CompanionError::VendorTransient(
                        "TTS open timed out".into(),
                    ))
                }
            }
        }
        let Some(tx) = self.text.as_ref() else {
            return SegmentSent::Failed(CompanionError::Tts("upstream already closed".into()));
        };
        tokio::select! {
            () = self.cancel.cancelled() => SegmentSent::Cancelled,
            sent = tx.send(segment) => match sent {
                Ok(()) => SegmentSent::Ok,
                Err(_) => SegmentSent::Failed(CompanionError::Tts("upstream rejected text".into())),
            },
        }
    }
}

/// Forward vendor audio into the bounded audio channel. A full channel
/// blocks TTS ingestion, which is exactly the backpressure order the
/// pipeline wants.
fn spawn_tts_pump(
    mut vendor_rx: mpsc::Receiver<Bytes>,
    audio_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => break,
                chunk = vendor_rx.recv() => match chunk {
                    Some(c) => c,
                    None => break,
                },
            };
            let send = tokio::select! {
                () = cancel.cancelled() => Err(()),
                sent = audio_tx.send(chunk) => sent.map_err(|_| ()),
            };
            if send.is_err() {
                break;
            }
        }
    });
}

/// Cancel-aware mailbox poster for turn events.
struct Poster {
    playback_id: u64,
    mailbox: mpsc::Sender<SessionMessage>,
    cancel: CancellationToken,
}

impl Poster {
    /// Post an event. Returns `false` when the turn was cancelled or the
    /// session is gone; the bridge stops quietly in either case.
    async fn send(&self, event: TurnEvent) -> bool {
        let msg = SessionMessage::Turn {
            playback_id: self.playback_id,
            event,
        };
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.mailbox.send(msg) => sent.is_ok(),
        }
    }

    /// Post a failure and resolve the bridge outcome.
    async fn fail(&self, error: CompanionError, reply: String) -> Outcome {
        let _ = self.send(TurnEvent::Failed { error, reply }).await;
        Outcome::Failed
    }
}
