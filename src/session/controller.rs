//! The per-session controller.
//!
//! One session task owns the state machine and is the only emitter of
//! outbound frames, which makes the per-session total order structural.
//! The transport facade posts commands into the bounded mailbox;
//! preemptive signals (barge-in, slow consumer) ride the unbounded control
//! channel so they jump queued data. An outbound writer task forwards
//! frames to the client sink, dropping audio orphaned by barge-in and
//! converting a sustained sink stall into a `slow_consumer` turn failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::AnalyzerManager;
use crate::config::CompanionConfig;
use crate::error::CompanionError;
use crate::frames::{InboundFrame, OutboundFrame, SessionStatus, decode_audio_payload};
use crate::memory::ops::{MemoryOpKind, MemoryOperation};
use crate::memory::writer::MemoryWriter;
use crate::pipeline::bridge::TurnBridge;
use crate::pipeline::messages::{
    ControlMsg, OutboundEvent, SessionCommand, SessionMessage, SttBridgeEvent, TurnEvent,
};
use crate::prompt;
use crate::registry::SessionRegistry;
use crate::scaffold::{Scaffold, ScaffoldCache, ScaffoldValue};
use crate::session::state::SessionState;
use crate::session::stt_bridge::{FinalFilter, run_stt_pump};
use crate::vendor::{AudioStreamConfig, LlmClient, SttClient, TtsClient};

/// Intimacy gained per completed turn on the realtime path.
const TURN_INTIMACY_GAIN: f64 = 0.02;

/// How long the attach-time scaffold watcher polls before giving up.
const SCAFFOLD_WATCH_LIMIT: Duration = Duration::from_secs(10);
const SCAFFOLD_WATCH_TICK: Duration = Duration::from_millis(50);

/// Process-wide collaborators handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<CompanionConfig>,
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub scaffolds: Arc<ScaffoldCache>,
    pub writer: MemoryWriter,
    pub registry: Arc<SessionRegistry>,
    pub analyzers: Arc<AnalyzerManager>,
}

/// Transport-facing handle to one live session.
pub struct SessionController {
    session_id: String,
    user_id: String,
    mailbox: mpsc::Sender<SessionMessage>,
    control: mpsc::UnboundedSender<ControlMsg>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Attach a new session for `user_id`, emitting outbound frames on
    /// `sink`. Spawns the session task and the outbound writer.
    #[must_use]
    pub fn attach(deps: SessionDeps, user_id: &str, sink: mpsc::Sender<OutboundFrame>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (mailbox_tx, mailbox_rx) =
            mpsc::channel::<SessionMessage>(deps.config.session.mailbox_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlMsg>();
        let (outbound_tx, outbound_rx) =
            mpsc::channel::<OutboundEvent>(deps.config.session.outbound_capacity);

        let current_playback = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_outbound_writer(
            outbound_rx,
            sink,
            current_playback.clone(),
            control_tx.clone(),
            Duration::from_millis(deps.config.session.slow_consumer_timeout_ms),
        ));

        let task = SessionTask {
            deps,
            session_id: session_id.clone(),
            user_id: user_id.to_owned(),
            state: SessionState::Idle,
            outbound: outbound_tx,
            mailbox_tx: mailbox_tx.clone(),
            control_tx: control_tx.clone(),
            cancel: cancel.clone(),
            current_playback,
            playback_seq: 0,
            final_filter: FinalFilter::new(),
            partial_text: String::new(),
            utterance_seq: 0,
            utterance_saw_final: false,
            stt_audio: None,
            stt_pump: None,
            turn: None,
            last_activity: Instant::now(),
            cleaned: false,
            scaffold_ready_emitted: false,
        };
        let handle = tokio::spawn(task.run(mailbox_rx, control_rx));

        Self {
            session_id,
            user_id: user_id.to_owned(),
            mailbox: mailbox_tx,
            control: control_tx,
            cancel,
            task: StdMutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Dispatch one decoded transport frame.
    pub async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::AudioStreamStart {
                sample_rate,
                channels,
                format,
            } => {
                self.open_audio_stream(AudioStreamConfig {
                    sample_rate,
                    channels,
                    format,
                })
                .await;
            }
            InboundFrame::AudioChunk { audio_data } => match decode_audio_payload(&audio_data) {
                Ok(bytes) => self.push_audio_chunk(bytes).await,
                Err(e) => {
                    let _ = self.control.send(ControlMsg::ClientProtocol {
                        message: e.client_message(),
                    });
                }
            },
            InboundFrame::AudioStreamEnd => self.close_audio_stream().await,
            InboundFrame::InterruptSpeech => self.interrupt(),
            InboundFrame::Ping => self.post(SessionCommand::Ping).await,
        }
    }

    /// Begin a microphone stream.
    pub async fn open_audio_stream(&self, config: AudioStreamConfig) {
        self.post(SessionCommand::OpenAudioStream(config)).await;
    }

    /// Forward one chunk of client audio.
    pub async fn push_audio_chunk(&self, bytes: Bytes) {
        self.post(SessionCommand::PushAudioChunk(bytes)).await;
    }

    /// Close the microphone stream; STT will deliver its final.
    pub async fn close_audio_stream(&self) {
        self.post(SessionCommand::CloseAudioStream).await;
    }

    /// Barge-in. Idempotent; a no-op outside `Generating`/`Speaking`.
    pub fn interrupt(&self) {
        let _ = self.control.send(ControlMsg::Interrupt);
    }

    /// Tear the session down and wait for its task to finish.
    pub async fn detach(&self) {
        self.cancel.cancel();
        let handle = {
            let mut guard = match self.task.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn post(&self, command: SessionCommand) {
        if self
            .mailbox
            .send(SessionMessage::Command(command))
            .await
            .is_err()
        {
            debug!(session = %self.session_id, "session task gone, command dropped");
        }
    }
}

/// One active turn owned by the session task.
struct ActiveTurn {
    playback_id: u64,
    user_text: String,
    reply: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionTask {
    deps: SessionDeps,
    session_id: String,
    user_id: String,
    state: SessionState,
    outbound: mpsc::Sender<OutboundEvent>,
    mailbox_tx: mpsc::Sender<SessionMessage>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    cancel: CancellationToken,
    current_playback: Arc<AtomicU64>,
    playback_seq: u64,
    final_filter: FinalFilter,
    partial_text: String,
    utterance_seq: u64,
    utterance_saw_final: bool,
    stt_audio: Option<mpsc::Sender<Bytes>>,
    stt_pump: Option<JoinHandle<()>>,
    turn: Option<ActiveTurn>,
    last_activity: Instant,
    cleaned: bool,
    scaffold_ready_emitted: bool,
}

impl SessionTask {
    async fn run(
        mut self,
        mut mailbox_rx: mpsc::Receiver<SessionMessage>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) {
        self.startup().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.cleanup("session cancelled").await;
                    break;
                }
                msg = control_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_control(msg).await;
                    if self.cleaned {
                        break;
                    }
                }
                msg = mailbox_rx.recv() => {
                    match msg {
                        Some(SessionMessage::Command(cmd)) => self.handle_command(cmd).await,
                        Some(SessionMessage::Stt(ev)) => self.handle_stt(ev).await,
                        Some(SessionMessage::Turn { playback_id, event }) => {
                            self.handle_turn(playback_id, event).await;
                        }
                        None => {
                            self.cleanup("transport closed").await;
                            break;
                        }
                    }
                    if self.cleaned {
                        break;
                    }
                }
            }
        }
    }

    async fn startup(&mut self) {
        let first_for_user = self
            .deps
            .registry
            .register(&self.session_id, &self.user_id);
        if first_for_user {
            self.deps.analyzers.ensure_started(&self.user_id);
        }
        info!(session = %self.session_id, user = %self.user_id, "session attached");

        if self.deps.scaffolds.has_entry(&self.user_id).await {
            self.scaffold_ready_emitted = true;
            self.emit(OutboundFrame::Status {
                status: SessionStatus::ScaffoldReady,
            })
            .await;
        } else {
            self.emit(OutboundFrame::Status {
                status: SessionStatus::ScaffoldWarming,
            })
            .await;
            self.deps.analyzers.request_warm(&self.user_id);
            tokio::spawn(run_scaffold_watcher(
                self.deps.scaffolds.clone(),
                self.user_id.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            ));
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        self.last_activity = Instant::now();
        match command {
            SessionCommand::OpenAudioStream(config) => self.open_audio_stream(config).await,
            SessionCommand::PushAudioChunk(bytes) => self.push_audio_chunk(bytes).await,
            SessionCommand::CloseAudioStream => self.close_audio_stream(),
            SessionCommand::Ping => {}
        }
    }

    async fn open_audio_stream(&mut self, config: AudioStreamConfig) {
        if !self.state.can_start_recording() {
            warn!(
                session = %self.session_id,
                state = ?self.state,
                "audio_stream_start out of sequence"
            );
            self.emit(OutboundFrame::Error {
                message: "audio stream not allowed in current state".into(),
            })
            .await;
            return;
        }

        let open_timeout =
            Duration::from_millis(self.deps.config.pipeline.request_start_timeout_ms);
        let handle =
            match tokio::time::timeout(open_timeout, self.deps.stt.open_stream(&config)).await {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => {
                    warn!(session = %self.session_id, "STT open failed: {e}");
                    self.emit(OutboundFrame::Error {
                        message: e.client_message(),
                    })
                    .await;
                    return;
                }
                Err(_) => {
                    self.emit(OutboundFrame::Error {
                        message: CompanionError::VendorTransient("STT open timed out".into())
                            .client_message(),
                    })
                    .await;
                    return;
                }
            };

        self.stt_audio = Some(handle.audio);
        self.stt_pump = Some(tokio::spawn(run_stt_pump(
            handle.events,
            self.mailbox_tx.clone(),
            self.cancel.clone(),
        )));
        self.utterance_seq += 1;
        self.utterance_saw_final = false;
        self.partial_text.clear();
        self.state = SessionState::Recording;
        self.deps.registry.mark_active(&self.session_id);
        self.emit(OutboundFrame::Status {
            status: SessionStatus::Recording,
        })
        .await;
    }

    async fn push_audio_chunk(&mut self, bytes: Bytes) {
        if !self.state.accepts_audio() {
            warn!(
                session = %self.session_id,
                state = ?self.state,
                "audio chunk outside Recording, dropped"
            );
            return;
        }
        let Some(audio) = self.stt_audio.as_ref() else {
            warn!(session = %self.session_id, "audio chunk with no open STT stream, dropped");
            return;
        };
        let sent = tokio::select! {
            () = self.cancel.cancelled() => return,
            sent = audio.send(bytes) => sent,
        };
        if sent.is_err() {
            debug!(session = %self.session_id, "STT upstream closed while forwarding audio");
        }
    }

    fn close_audio_stream(&mut self) {
        if self.state != SessionState::Recording {
            debug!(session = %self.session_id, "audio_stream_end outside Recording ignored");
            return;
        }
        // Dropping the sender closes the vendor upstream; the final (if
        // any) arrives on the event stream.
        self.stt_audio = None;
    }

    async fn handle_stt(&mut self, event: SttBridgeEvent) {
        match event {
            SttBridgeEvent::Partial(text) => {
                if self.state != SessionState::Recording {
                    return;
                }
                self.partial_text = text;
                let content = self.partial_text.clone();
                self.emit(OutboundFrame::TranscriptToken { content }).await;
            }
            SttBridgeEvent::Final(text) => {
                if self.state != SessionState::Recording {
                    debug!(session = %self.session_id, "final transcript outside Recording dropped");
                    return;
                }
                self.utterance_saw_final = true;
                let Some(accepted) = self.final_filter.accept(&text) else {
                    return;
                };
                self.start_turn(accepted).await;
            }
            SttBridgeEvent::Closed { error } => {
                self.stt_pump = None;
                self.stt_audio = None;
                match error {
                    Some(failure) if failure.fatal => {
                        self.emit(OutboundFrame::Error {
                            message: failure.message,
                        })
                        .await;
                        self.cleanup("STT vendor fatal").await;
                    }
                    Some(failure) => {
                        if self.state == SessionState::Recording {
                            self.emit(OutboundFrame::Error {
                                message: failure.message,
                            })
                            .await;
                            self.to_idle();
                        } else {
                            warn!(session = %self.session_id, "STT error after recording: {}", failure.message);
                        }
                    }
                    None => {
                        if self.state == SessionState::Recording {
                            if !self.utterance_saw_final {
                                // Disconnect without any final: close the
                                // utterance with no turn.
                                self.emit(OutboundFrame::Error {
                                    message: "speech stream ended without transcript".into(),
                                })
                                .await;
                            }
                            self.to_idle();
                        }
                    }
                }
            }
        }
    }

    async fn start_turn(&mut self, user_text: String) {
        self.state = SessionState::Finalizing;
        self.emit(OutboundFrame::Status {
            status: SessionStatus::RecordingComplete,
        })
        .await;
        self.emit(OutboundFrame::Status {
            status: SessionStatus::TranscriptionComplete,
        })
        .await;

        let assembled =
            prompt::assemble(&self.deps.scaffolds, &self.user_id, &user_text, None).await;
        if assembled.scaffold_missing {
            self.deps.analyzers.request_warm(&self.user_id);
        }

        debug!(
            session = %self.session_id,
            utterance = self.utterance_seq,
            "final transcript accepted, starting turn"
        );
        self.playback_seq += 1;
        let playback_id = self.playback_seq;
        self.current_playback.store(playback_id, Ordering::SeqCst);

        let turn_cancel = self.cancel.child_token();
        let bridge = TurnBridge {
            playback_id,
            prompt: assembled.prompt,
            llm: self.deps.llm.clone(),
            tts: self.deps.tts.clone(),
            voice: self.deps.config.voice.clone(),
            config: self.deps.config.pipeline.clone(),
            mailbox: self.mailbox_tx.clone(),
            cancel: turn_cancel.clone(),
        };
        let handle = tokio::spawn(bridge.run());

        self.turn = Some(ActiveTurn {
            playback_id,
            user_text,
            reply: String::new(),
            cancel: turn_cancel,
            handle,
        });
        self.state = SessionState::Generating;
        self.emit(OutboundFrame::Status {
            status: SessionStatus::LlmTtsStreaming,
        })
        .await;
    }

    async fn handle_turn(&mut self, playback_id: u64, event: TurnEvent) {
        if self.turn.as_ref().map(|t| t.playback_id) != Some(playback_id) {
            debug!(
                session = %self.session_id,
                playback_id,
                "event from stale turn dropped"
            );
            return;
        }
        match event {
            TurnEvent::Token { text } => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.reply.push_str(&text);
                }
                self.emit_turn(OutboundFrame::TokenStream { content: text }, playback_id)
                    .await;
            }
            TurnEvent::SpeakingStarted => {
                self.state = SessionState::Speaking;
            }
            TurnEvent::Audio { chunk } => {
                self.emit_turn(OutboundFrame::audio(&chunk), playback_id)
                    .await;
            }
            TurnEvent::Finished { reply } => self.finish_turn(reply).await,
            TurnEvent::Failed { error, reply } => {
                warn!(session = %self.session_id, "turn failed: {error}");
                self.emit(OutboundFrame::Error {
                    message: error.client_message(),
                })
                .await;
                debug!(
                    session = %self.session_id,
                    partial_len = reply.len(),
                    "discarding partial reply of failed turn"
                );
                self.abandon_turn();
                if error.is_fatal() {
                    self.cleanup("vendor fatal").await;
                } else {
                    self.to_idle();
                }
            }
        }
    }

    async fn finish_turn(&mut self, reply: String) {
        let Some(turn) = self.turn.take() else { return };
        self.emit(OutboundFrame::Status {
            status: SessionStatus::StreamingComplete,
        })
        .await;
        self.emit(OutboundFrame::Result {
            transcript: turn.user_text.clone(),
            ai_response: reply.clone(),
        })
        .await;
        self.to_idle();
        self.persist_turn(&turn.user_text, &reply, false).await;
        self.deps.registry.note_turn_finished(&self.user_id);
    }

    /// Drop the active turn after cancellation/failure and invalidate its
    /// playback id so queued audio is discarded by the outbound writer.
    fn abandon_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            drop(turn.handle);
        }
        self.playback_seq += 1;
        self.current_playback
            .store(self.playback_seq, Ordering::SeqCst);
    }

    /// Record the finished (or interrupted) turn: a conversation operation
    /// plus a realtime scaffold refresh, both off the hot path.
    async fn persist_turn(&mut self, user_text: &str, reply: &str, interrupted: bool) {
        self.deps.writer.enqueue(MemoryOperation::new(
            MemoryOpKind::Conversation,
            &self.user_id,
            json!({
                "session_id": self.session_id,
                "user_text": user_text,
                "ai_response": reply,
                "interrupted": interrupted,
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        ));

        let mut scaffold = self
            .deps
            .scaffolds
            .get_for_session(&self.user_id)
            .await
            .map_or_else(Scaffold::empty, |snap| snap.scaffold);
        scaffold.intimacy = (scaffold.intimacy + TURN_INTIMACY_GAIN).clamp(0.0, 1.0);
        let mut topic = String::with_capacity(user_text.len().min(80));
        for ch in user_text.chars() {
            if topic.len() + ch.len_utf8() > 80 {
                break;
            }
            topic.push(ch);
        }
        scaffold
            .fields
            .insert("recent_topic".into(), ScaffoldValue::Text(topic));
        self.deps
            .scaffolds
            .apply_realtime(&self.user_id, scaffold.clone())
            .await;

        if let Ok(payload) = serde_json::to_value(&scaffold) {
            self.deps.writer.enqueue(MemoryOperation::new(
                MemoryOpKind::ScaffoldUpdate,
                &self.user_id,
                payload,
            ));
        }
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Interrupt => {
                if !self.state.in_turn() || self.turn.is_none() {
                    debug!(session = %self.session_id, "interrupt outside turn is a no-op");
                    return;
                }
                let (user_text, reply) = self
                    .turn
                    .as_ref()
                    .map(|t| (t.user_text.clone(), t.reply.clone()))
                    .unwrap_or_default();
                self.abandon_turn();
                self.emit(OutboundFrame::SpeechInterrupted).await;
                self.to_idle();
                self.persist_turn(&user_text, &reply, true).await;
                self.deps.registry.note_turn_finished(&self.user_id);
            }
            ControlMsg::SlowConsumer { playback_id } => {
                if self.turn.as_ref().map(|t| t.playback_id) != Some(playback_id) {
                    return;
                }
                warn!(session = %self.session_id, "outbound sink stalled, failing turn");
                self.abandon_turn();
                self.emit(OutboundFrame::Error {
                    message: CompanionError::SlowConsumer.client_message(),
                })
                .await;
                self.to_idle();
            }
            ControlMsg::ScaffoldReady => {
                if !self.scaffold_ready_emitted {
                    self.scaffold_ready_emitted = true;
                    self.emit(OutboundFrame::Status {
                        status: SessionStatus::ScaffoldReady,
                    })
                    .await;
                }
            }
            ControlMsg::ClientProtocol { message } => {
                self.emit(OutboundFrame::Error { message }).await;
            }
        }
    }

    fn to_idle(&mut self) {
        self.state = SessionState::Idle;
        self.deps.registry.mark_idle(&self.session_id);
    }

    /// Idempotent teardown. Every potentially blocking subcall is bounded;
    /// expiry logs and proceeds.
    async fn cleanup(&mut self, reason: &str) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        info!(
            session = %self.session_id,
            reason,
            idle_secs = self.last_activity.elapsed().as_secs(),
            "session cleanup"
        );

        let step = Duration::from_millis(self.deps.config.session.cleanup_step_timeout_ms);

        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            if tokio::time::timeout(step, turn.handle).await.is_err() {
                warn!(session = %self.session_id, "turn bridge did not stop in time");
            }
        }
        self.playback_seq += 1;
        self.current_playback
            .store(self.playback_seq, Ordering::SeqCst);

        // Closing the audio sender tears the STT upstream down; the pump
        // ends when the vendor closes its events.
        self.stt_audio = None;
        self.cancel.cancel();
        if let Some(pump) = self.stt_pump.take() {
            if tokio::time::timeout(step, pump).await.is_err() {
                warn!(session = %self.session_id, "STT pump did not stop in time");
            }
        }

        self.deps.registry.mark_idle(&self.session_id);
        let last_for_user = self.deps.registry.unregister(&self.session_id);
        if last_for_user {
            self.deps.scaffolds.reclaim_if_empty(&self.user_id).await;
        }
        info!(session = %self.session_id, "session detached");
    }

    async fn emit(&self, frame: OutboundFrame) {
        if self
            .outbound
            .send(OutboundEvent::frame(frame))
            .await
            .is_err()
        {
            debug!(session = %self.session_id, "outbound writer gone");
        }
    }

    async fn emit_turn(&self, frame: OutboundFrame, playback_id: u64) {
        if self
            .outbound
            .send(OutboundEvent::turn_frame(frame, playback_id))
            .await
            .is_err()
        {
            debug!(session = %self.session_id, "outbound writer gone");
        }
    }
}

/// Forward frames to the client sink. Turn frames are dropped when their
/// playback id is stale (barge-in orphans) and bounded by the slow
/// consumer timeout; everything else is delivered unconditionally.
async fn run_outbound_writer(
    mut rx: mpsc::Receiver<OutboundEvent>,
    sink: mpsc::Sender<OutboundFrame>,
    current_playback: Arc<AtomicU64>,
    control: mpsc::UnboundedSender<ControlMsg>,
    slow_timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        match event.playback_id {
            Some(playback_id) => {
                if playback_id != current_playback.load(Ordering::SeqCst) {
                    debug!(playback_id, "dropping frame from invalidated playback");
                    continue;
                }
                match sink.send_timeout(event.frame, slow_timeout).await {
                    Ok(()) => {}
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        let _ = control.send(ControlMsg::SlowConsumer { playback_id });
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => break,
                }
            }
            None => {
                if sink.send(event.frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Poll the cache until the attach-time warm lands, then notify the
/// session. Gives up quietly after the watch limit.
async fn run_scaffold_watcher(
    scaffolds: Arc<ScaffoldCache>,
    user_id: String,
    control: mpsc::UnboundedSender<ControlMsg>,
    cancel: CancellationToken,
) {
    let deadline = Instant::now() + SCAFFOLD_WATCH_LIMIT;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(SCAFFOLD_WATCH_TICK) => {}
        }
        if scaffolds.has_entry(&user_id).await {
            let _ = control.send(ControlMsg::ScaffoldReady);
            return;
        }
        if Instant::now() >= deadline {
            return;
        }
    }
}
