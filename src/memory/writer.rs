//! Background memory writer.
//!
//! A single long-lived worker drains a multi-producer queue of
//! [`MemoryOperation`]s. It deduplicates by fingerprint, coalesces
//! same-`(user, kind)` operations into batches, and retries with
//! exponential backoff. Failures are logged and dropped; nothing here ever
//! blocks or fails a session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::memory::ops::{MemoryOpKind, MemoryOperation};
use crate::vendor::MemoryVendor;

/// Handle to the writer worker. Cheap to clone; every session and the
/// analyzer hold one.
#[derive(Clone)]
pub struct MemoryWriter {
    tx: mpsc::Sender<MemoryOperation>,
    cancel: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryWriter {
    /// Spawn the writer worker against the given store.
    #[must_use]
    pub fn spawn(store: Arc<dyn MemoryVendor>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            run_writer_worker(store, config, rx, worker_cancel).await;
        });
        Self {
            tx,
            cancel,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Enqueue an operation. Never blocks: when the queue is full the
    /// operation is dropped with a warning.
    pub fn enqueue(&self, op: MemoryOperation) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(op)) => {
                warn!(
                    user = %op.user_id,
                    kind = op.kind.as_str(),
                    "memory queue full, dropping operation"
                );
            }
            Err(mpsc::error::TrySendError::Closed(op)) => {
                warn!(
                    user = %op.user_id,
                    kind = op.kind.as_str(),
                    "memory writer stopped, dropping operation"
                );
            }
        }
    }

    /// Flush pending batches and stop the worker.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = {
            let mut guard = match self.worker.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// A batch of same-`(user, kind)` operations waiting on the coalescing
/// window.
struct PendingBatch {
    ops: Vec<MemoryOperation>,
    opened_at: Instant,
}

async fn run_writer_worker(
    store: Arc<dyn MemoryVendor>,
    config: WriterConfig,
    mut rx: mpsc::Receiver<MemoryOperation>,
    cancel: CancellationToken,
) {
    let batch_window = Duration::from_millis(config.batch_window_ms);
    let dedupe_window = Duration::from_secs(config.dedupe_window_secs);

    let mut seen: HashMap<[u8; 32], Instant> = HashMap::new();
    let mut pending: HashMap<(String, MemoryOpKind), PendingBatch> = HashMap::new();

    info!("memory writer started");
    loop {
        let next_deadline = pending
            .values()
            .map(|b| b.opened_at + batch_window)
            .min();
        let flush_timer = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = flush_timer => {
                let now = Instant::now();
                let due: Vec<(String, MemoryOpKind)> = pending
                    .iter()
                    .filter(|(_, b)| now >= b.opened_at + batch_window)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    if let Some(batch) = pending.remove(&key) {
                        flush_batch(store.as_ref(), &config, batch).await;
                    }
                }
            }
            op = rx.recv() => {
                let Some(op) = op else { break };

                let now = Instant::now();
                seen.retain(|_, at| now.duration_since(*at) < dedupe_window);
                if seen.contains_key(&op.dedupe_hash) {
                    debug!(
                        user = %op.user_id,
                        kind = op.kind.as_str(),
                        "duplicate operation within dedupe window, dropping"
                    );
                    continue;
                }
                seen.insert(op.dedupe_hash, now);

                let key = (op.user_id.clone(), op.kind);
                let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
                    ops: Vec::new(),
                    opened_at: now,
                });
                batch.ops.push(op);
                if batch.ops.len() >= config.batch_max {
                    if let Some(batch) = pending.remove(&key) {
                        flush_batch(store.as_ref(), &config, batch).await;
                    }
                }
            }
        }
    }

    // Drain whatever producers managed to enqueue, then flush all batches.
    rx.close();
    while let Ok(op) = rx.try_recv() {
        let key = (op.user_id.clone(), op.kind);
        pending
            .entry(key)
            .or_insert_with(|| PendingBatch {
                ops: Vec::new(),
                opened_at: Instant::now(),
            })
            .ops
            .push(op);
    }
    for (_, batch) in pending.drain() {
        flush_batch(store.as_ref(), &config, batch).await;
    }
    info!("memory writer stopped");
}

/// Write one coalesced batch, retrying with exponential backoff.
async fn flush_batch(store: &dyn MemoryVendor, config: &WriterConfig, batch: PendingBatch) {
    let Some(first) = batch.ops.first() else {
        return;
    };
    let user_id = first.user_id.clone();
    let kind = first.kind;

    if store.supports_batch() && batch.ops.len() > 1 {
        let payloads: Vec<serde_json::Value> =
            batch.ops.iter().map(|op| op.payload.clone()).collect();
        let written = with_retry(config, || store.upsert_batch(&user_id, kind, &payloads)).await;
        if written {
            debug!(user = %user_id, kind = kind.as_str(), n = payloads.len(), "batch written");
        } else {
            warn!(
                user = %user_id,
                kind = kind.as_str(),
                n = payloads.len(),
                "batch dropped after {} attempts",
                config.retry_max_attempts
            );
        }
        return;
    }

    for op in &batch.ops {
        let written = with_retry(config, || store.upsert(&op.user_id, op.kind, &op.payload)).await;
        if !written {
            warn!(
                user = %op.user_id,
                kind = op.kind.as_str(),
                op_id = %op.id,
                "operation dropped after {} attempts",
                config.retry_max_attempts
            );
        }
    }
}

/// Run a store call with the configured backoff schedule. Returns whether
/// the call eventually succeeded.
async fn with_retry<F, Fut>(config: &WriterConfig, mut call: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(()) => return true,
            Err(e) if attempt >= config.retry_max_attempts => {
                warn!("memory write failed terminally: {e}");
                return false;
            }
            Err(e) => {
                let backoff = backoff_delay(config, attempt);
                debug!("memory write attempt {attempt} failed ({e}), retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Backoff before retry number `attempt + 1` (1-based attempts).
fn backoff_delay(config: &WriterConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    let ms = config.retry_initial_ms as f64 * config.retry_factor.powi(exp as i32);
    Duration::from_millis((ms as u64).min(config.retry_cap_ms))
}
