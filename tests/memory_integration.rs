//! Memory writer behavior against the recording store double.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use solace::config::WriterConfig;
use solace::memory::{MemoryOpKind, MemoryOperation, MemoryWriter};
use solace::vendor::mock::RecordingMemoryStore;

fn conversation_op(user: &str, text: &str) -> MemoryOperation {
    MemoryOperation::new(MemoryOpKind::Conversation, user, json!({ "text": text }))
}

#[tokio::test(start_paused = true)]
async fn duplicate_operation_within_window_is_written_once() {
    let store = Arc::new(RecordingMemoryStore::new());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "hello"));
    tokio::time::sleep(Duration::from_secs(60)).await;
    writer.enqueue(conversation_op("u1", "hello"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(store.written().len(), 1);
    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_outside_window_is_written_again() {
    let store = Arc::new(RecordingMemoryStore::new());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "hello"));
    tokio::time::sleep(Duration::from_secs(601)).await;
    writer.enqueue(conversation_op("u1", "hello"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(store.written().len(), 2);
    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn same_user_and_kind_coalesce_into_one_batch_call() {
    let store = Arc::new(RecordingMemoryStore::with_batch_support());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "one"));
    writer.enqueue(conversation_op("u1", "two"));
    writer.enqueue(conversation_op("u1", "three"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let written = store.written();
    assert_eq!(written.len(), 3);
    assert_eq!(
        store.batch_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // FIFO within (user, kind).
    let texts: Vec<&str> = written
        .iter()
        .map(|(_, _, p)| p["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["one", "two", "three"]);

    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn different_kinds_do_not_share_a_batch() {
    let store = Arc::new(RecordingMemoryStore::with_batch_support());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "chat"));
    writer.enqueue(MemoryOperation::new(
        MemoryOpKind::GraphRelationship,
        "u1",
        json!({ "edge": "confides_in" }),
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(store.written().len(), 2);
    // Two singleton flushes, no multi-op batch call.
    assert_eq!(
        store.batch_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_before_the_window() {
    let store = Arc::new(RecordingMemoryStore::with_batch_support());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    for i in 0..16 {
        writer.enqueue(conversation_op("u1", &format!("msg {i}")));
    }
    // Well under the 250 ms batching window.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.written().len(), 16);

    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff_until_success() {
    let store = Arc::new(RecordingMemoryStore::new());
    store.fail_next_writes(2);
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "persist me"));
    // 250 ms window + 500 ms + 1 s backoffs.
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(store.written().len(), 1);
    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn operation_is_dropped_after_max_attempts() {
    let store = Arc::new(RecordingMemoryStore::new());
    store.fail_next_writes(5);
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "doomed"));
    // Full backoff schedule: 0.5 + 1 + 2 + 4 seconds between 5 attempts.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(store.written().is_empty());

    // The writer is still healthy afterwards.
    writer.enqueue(conversation_op("u1", "survivor"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    let written = store.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].2["text"], "survivor");

    writer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_operations() {
    let store = Arc::new(RecordingMemoryStore::new());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    writer.enqueue(conversation_op("u1", "about to exit"));
    // No window sleep: shutdown itself must flush.
    writer.shutdown().await;

    assert_eq!(store.written().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn round_trip_payload_is_preserved() {
    let store = Arc::new(RecordingMemoryStore::new());
    let writer = MemoryWriter::spawn(store.clone(), WriterConfig::default());

    let payload = json!({
        "text": "remember the lake house",
        "tags": ["place", "family"],
        "weight": 0.75,
    });
    writer.enqueue(MemoryOperation::new(
        MemoryOpKind::Conversation,
        "u9",
        payload.clone(),
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let written = store.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, "u9");
    assert_eq!(written[0].2, payload);

    writer.shutdown().await;
}
