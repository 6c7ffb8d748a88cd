//! End-to-end session scenarios against scripted vendor doubles.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use solace::config::CompanionConfig;
use solace::core::{Core, VendorSet};
use solace::frames::{InboundFrame, OutboundFrame, SessionStatus};
use solace::memory::MemoryOpKind;
use solace::vendor::mock::{EchoTts, RecordingMemoryStore, ScriptedLlm, ScriptedStt, SttAction};

struct Harness {
    core: Core,
    stt: Arc<ScriptedStt>,
    llm: Arc<ScriptedLlm>,
    tts: Arc<EchoTts>,
    store: Arc<RecordingMemoryStore>,
}

fn harness() -> Harness {
    harness_with(CompanionConfig::default())
}

fn harness_with(config: CompanionConfig) -> Harness {
    let stt = Arc::new(ScriptedStt::new());
    let llm = Arc::new(ScriptedLlm::new());
    let tts = Arc::new(EchoTts::new());
    let store = Arc::new(RecordingMemoryStore::new());
    let core = Core::new(
        config,
        VendorSet {
            stt: stt.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
            memory: store.clone(),
        },
    );
    Harness {
        core,
        stt,
        llm,
        tts,
        store,
    }
}

fn start_frame() -> InboundFrame {
    InboundFrame::AudioStreamStart {
        sample_rate: 16_000,
        channels: 1,
        format: solace::frames::AudioFormat::RawPcmS16le,
    }
}

fn chunk_frame() -> InboundFrame {
    use base64::Engine as _;
    InboundFrame::AudioChunk {
        audio_data: base64::engine::general_purpose::STANDARD.encode([0u8; 320]),
    }
}

/// Read frames until the predicate matches (inclusive) or the timeout
/// elapses.
async fn collect_until(
    rx: &mut mpsc::Receiver<OutboundFrame>,
    mut done: impl FnMut(&OutboundFrame) -> bool,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("sink closed before terminal frame");
        let stop = done(&frame);
        frames.push(frame);
        if stop {
            return frames;
        }
    }
}

fn position_of(frames: &[OutboundFrame], mut pred: impl FnMut(&OutboundFrame) -> bool) -> usize {
    frames
        .iter()
        .position(|f| pred(f))
        .unwrap_or_else(|| panic!("expected frame not found in {frames:?}"))
}

fn status_position(frames: &[OutboundFrame], status: SessionStatus) -> usize {
    position_of(frames, |f| {
        matches!(f, OutboundFrame::Status { status: s } if *s == status)
    })
}

#[tokio::test(start_paused = true)]
async fn happy_path_orders_status_tokens_audio_and_result() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitAudio,
        SttAction::Partial("hi"),
        SttAction::AwaitAudio,
        SttAction::Partial("hi the"),
        SttAction::AwaitAudio,
        SttAction::Partial("hi there"),
        SttAction::AwaitClose,
        SttAction::Final("hi there"),
    ]);
    h.llm
        .push_reply_tokens(&["Hey", " there", ", good", " to hear you."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-1", sink_tx);

    session.handle_frame(start_frame()).await;
    for _ in 0..3 {
        session.handle_frame(chunk_frame()).await;
    }
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    let frames = collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;

    let recording = status_position(&frames, SessionStatus::Recording);
    let recording_complete = status_position(&frames, SessionStatus::RecordingComplete);
    let transcription_complete = status_position(&frames, SessionStatus::TranscriptionComplete);
    let streaming = status_position(&frames, SessionStatus::LlmTtsStreaming);
    let streaming_complete = status_position(&frames, SessionStatus::StreamingComplete);
    let first_token = position_of(&frames, |f| matches!(f, OutboundFrame::TokenStream { .. }));
    let first_audio = position_of(&frames, |f| matches!(f, OutboundFrame::AudioChunk { .. }));
    let last_audio = frames.len()
        - 1
        - frames
            .iter()
            .rev()
            .position(|f| matches!(f, OutboundFrame::AudioChunk { .. }))
            .unwrap();
    let result = position_of(&frames, |f| matches!(f, OutboundFrame::Result { .. }));

    assert!(recording < recording_complete);
    assert!(recording_complete < transcription_complete);
    assert!(transcription_complete < streaming);
    assert!(streaming < first_token);
    assert!(first_token < first_audio, "tokens precede audio: {frames:?}");
    assert!(last_audio < streaming_complete, "stream end only after audio drain");
    assert!(streaming_complete < result);

    match &frames[result] {
        OutboundFrame::Result {
            transcript,
            ai_response,
        } => {
            assert_eq!(transcript, "hi there");
            assert!(!ai_response.is_empty());
            assert_eq!(ai_response, "Hey there, good to hear you.");
        }
        other => panic!("expected result frame, got {other:?}"),
    }

    // Cumulative partials were surfaced, never a pipeline trigger.
    let partials: Vec<&str> = frames
        .iter()
        .filter_map(|f| match f {
            OutboundFrame::TranscriptToken { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(partials, ["hi", "hi the", "hi there"]);

    // No error frames anywhere in a clean run.
    assert!(!frames.iter().any(|f| matches!(f, OutboundFrame::Error { .. })));

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_final_produces_exactly_one_turn() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("hi"),
        SttAction::Final("hi"),
    ]);
    h.llm.push_reply_tokens(&["Hello!"]);
    // A second scripted reply would be consumed if a second turn started.
    h.llm.push_reply_tokens(&["Should never stream."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-1", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(chunk_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    let frames = collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;

    // Give any spurious second turn time to surface, then drain.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut extra = Vec::new();
    while let Ok(frame) = sink_rx.try_recv() {
        extra.push(frame);
    }

    let results = frames
        .iter()
        .chain(extra.iter())
        .filter(|f| matches!(f, OutboundFrame::Result { .. }))
        .count();
    assert_eq!(results, 1);
    assert_eq!(h.llm.prompts.lock().unwrap().len(), 1);

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_final_never_triggers_a_turn() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("   "),
        SttAction::Final(""),
    ]);
    h.llm.push_reply_tokens(&["Should never stream."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    let session = h.core.attach("user-1", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut frames = Vec::new();
    while let Ok(frame) = sink_rx.try_recv() {
        frames.push(frame);
    }
    assert!(!frames.iter().any(|f| matches!(
        f,
        OutboundFrame::Result { .. } | OutboundFrame::TokenStream { .. }
    )));
    assert!(h.llm.prompts.lock().unwrap().is_empty());

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn barge_in_stops_old_audio_and_allows_immediate_recording() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("tell me a story"),
    ]);
    // Second stream after the barge-in: only an empty final, so no new
    // turn starts and every audio frame after speech_interrupted would
    // have to come from the old turn.
    h.stt
        .push_script(vec![SttAction::AwaitClose, SttAction::Final("")]);
    h.llm.push_reply_tokens(&["Once upon a time."]);
    // Long, slow synthesis so the barge-in lands mid-Speaking.
    h.tts.set_chunks_per_text(40);
    h.tts.set_chunk_gap(Duration::from_millis(50));

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-1", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(chunk_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    // Wait for the reply to start playing.
    collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::AudioChunk { .. })).await;

    // Barge in, then start recording immediately: no mandatory gap.
    session.handle_frame(InboundFrame::InterruptSpeech).await;
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    let frames = collect_until(&mut sink_rx, |f| {
        matches!(
            f,
            OutboundFrame::Status {
                status: SessionStatus::Recording
            }
        )
    })
    .await;

    let interrupted = position_of(&frames, |f| matches!(f, OutboundFrame::SpeechInterrupted));
    let recording = status_position(&frames, SessionStatus::Recording);
    assert!(interrupted < recording);

    // Nothing from the cancelled turn leaks after the acknowledgement.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut tail = Vec::new();
    while let Ok(frame) = sink_rx.try_recv() {
        tail.push(frame);
    }
    let late_audio = frames[interrupted..]
        .iter()
        .chain(tail.iter())
        .filter(|f| matches!(f, OutboundFrame::AudioChunk { .. }))
        .count();
    assert_eq!(late_audio, 0, "orphaned TTS audio leaked past barge-in");
    assert!(!frames[interrupted..]
        .iter()
        .chain(tail.iter())
        .any(|f| matches!(f, OutboundFrame::Result { .. })));

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn audio_chunk_in_idle_is_dropped_without_error() {
    let h = harness();
    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    let session = h.core.attach("user-1", sink_tx);

    session.handle_frame(chunk_frame()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut frames = Vec::new();
    while let Ok(frame) = sink_rx.try_recv() {
        frames.push(frame);
    }
    // Only the attach-time scaffold status; no error, no STT stream.
    assert!(!frames.iter().any(|f| matches!(f, OutboundFrame::Error { .. })));
    assert_eq!(
        h.stt
            .streams_opened
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interrupt_in_idle_is_a_noop() {
    let h = harness();
    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    let session = h.core.attach("user-1", sink_tx);

    session.handle_frame(InboundFrame::InterruptSpeech).await;
    session.handle_frame(InboundFrame::InterruptSpeech).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut frames = Vec::new();
    while let Ok(frame) = sink_rx.try_recv() {
        frames.push(frame);
    }
    assert!(!frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::SpeechInterrupted)));

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stt_disconnect_during_recording_errors_and_recovers() {
    let h = harness();
    h.stt
        .push_script(vec![SttAction::AwaitAudio, SttAction::Disconnect]);
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("hello again"),
    ]);
    h.llm.push_reply_tokens(&["Welcome back."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-1", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(chunk_frame()).await;

    let frames = collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Error { .. })).await;
    assert!(frames.iter().any(|f| matches!(f, OutboundFrame::Error { .. })));

    // The session is Idle again and a fresh stream works end-to-end.
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;
    let frames = collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;
    assert!(frames.iter().any(
        |f| matches!(f, OutboundFrame::Result { transcript, .. } if transcript == "hello again")
    ));

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_fails_turn_but_keeps_session() {
    let h = harness();
    h.stt
        .push_script(vec![SttAction::AwaitClose, SttAction::Final("talk to me")]);
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("still here"),
    ]);
    h.llm.push_reply_tokens(&["Plenty to say."]);
    h.llm.push_reply_tokens(&["Still works."]);
    // A long, slow reply so the turn is still speaking when the stall
    // detection fires.
    h.tts.set_chunks_per_text(50);
    h.tts.set_chunk_gap(Duration::from_millis(200));

    // Tiny sink: once we stop reading, the outbound writer stalls on turn
    // frames.
    let (sink_tx, mut sink_rx) = mpsc::channel(2);
    let session = h.core.attach("user-1", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;

    // Keep the sink drained until the turn is streaming, then stall.
    collect_until(&mut sink_rx, |f| {
        matches!(
            f,
            OutboundFrame::Status {
                status: SessionStatus::LlmTtsStreaming
            }
        )
    })
    .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let frames = collect_until(&mut sink_rx, |f| {
        matches!(f, OutboundFrame::Error { message } if message == "slow_consumer")
    })
    .await;
    assert!(!frames.iter().any(|f| matches!(f, OutboundFrame::Result { .. })));

    // Back to normal speed for the recovery turn.
    h.tts.set_chunks_per_text(2);
    h.tts.set_chunk_gap(Duration::ZERO);

    // The session still accepts a new stream and completes a turn.
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;
    let frames = collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;
    assert!(frames.iter().any(
        |f| matches!(f, OutboundFrame::Result { transcript, .. } if transcript == "still here")
    ));

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_is_idempotent_across_repeated_detach() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("see you later"),
    ]);
    h.llm.push_reply_tokens(&["Bye for now."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-1", sink_tx);
    let session_id = session.session_id().to_owned();
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;
    collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;

    assert!(h.core.detach(&session_id).await);
    // Second and third teardown are observationally no-ops.
    assert!(!h.core.detach(&session_id).await);
    session.detach().await;
    session.detach().await;

    assert!(h.core.registry().active_session_ids().is_empty());
    assert_eq!(h.core.registry().user_session_count("user-1"), 0);

    // Post-detach traffic is dropped quietly.
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::InterruptSpeech).await;

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn completed_turn_is_persisted_and_scaffold_refreshed() {
    let h = harness();
    h.stt.push_script(vec![
        SttAction::AwaitClose,
        SttAction::Final("i had a rough day"),
    ]);
    h.llm.push_reply_tokens(&["I'm here. Tell me about it."]);

    let (sink_tx, mut sink_rx) = mpsc::channel(256);
    let session = h.core.attach("user-7", sink_tx);
    session.handle_frame(start_frame()).await;
    session.handle_frame(InboundFrame::AudioStreamEnd).await;
    collect_until(&mut sink_rx, |f| matches!(f, OutboundFrame::Result { .. })).await;

    // Realtime scaffold refresh is visible immediately.
    let snap = h.core.scaffolds().get_for_session("user-7").await.unwrap();
    assert!(snap.scaffold.intimacy > 0.0);

    // The conversation operation reaches the store once the writer's
    // batching window passes.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let written = h.store.written();
    let conversation = written
        .iter()
        .find(|(user, kind, _)| user == "user-7" && *kind == MemoryOpKind::Conversation)
        .expect("conversation operation written");
    assert_eq!(conversation.2["user_text"], "i had a rough day");
    assert_eq!(conversation.2["interrupted"], false);
    assert!(written
        .iter()
        .any(|(_, kind, _)| *kind == MemoryOpKind::ScaffoldUpdate));

    h.core.shutdown().await;
}
