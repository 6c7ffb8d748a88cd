//! STT ingress: vendor event demultiplexing and final-transcript
//! filtering.
//!
//! The pump task forwards vendor events into the session mailbox. The
//! filter itself is owned by the session task, because "the most recently
//! delivered final" spans utterances and stream reopens within a session.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::messages::{SessionMessage, SttBridgeEvent, SttFailure};
use crate::vendor::SttEvent;

/// Drops spurious finals: empty after trimming, or equal to the last
/// delivered final for this session.
#[derive(Debug, Default)]
pub struct FinalFilter {
    last_delivered: Option<String>,
}

impl FinalFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trimmed final when it should produce a turn.
    pub fn accept(&mut self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            debug!("dropping empty final transcript");
            return None;
        }
        if self.last_delivered.as_deref() == Some(trimmed) {
            debug!("dropping duplicate final transcript");
            return None;
        }
        self.last_delivered = Some(trimmed.to_owned());
        Some(trimmed.to_owned())
    }
}

/// Forward vendor STT events into the session mailbox until the vendor
/// closes or the session is cancelled.
pub async fn run_stt_pump(
    mut events: mpsc::Receiver<SttEvent>,
    mailbox: mpsc::Sender<SessionMessage>,
    cancel: CancellationToken,
) {
    let mut failure: Option<SttFailure> = None;
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            ev = events.recv() => ev,
        };
        let Some(event) = event else { break };
        let msg = match event {
            SttEvent::Partial { text } => SessionMessage::Stt(SttBridgeEvent::Partial(text)),
            SttEvent::Final { text } => SessionMessage::Stt(SttBridgeEvent::Final(text)),
            SttEvent::Error { message, fatal } => {
                failure = Some(SttFailure { message, fatal });
                break;
            }
        };
        let send = tokio::select! {
            () = cancel.cancelled() => Err(()),
            sent = mailbox.send(msg) => sent.map_err(|_| ()),
        };
        if send.is_err() {
            return;
        }
    }

    let closed = SessionMessage::Stt(SttBridgeEvent::Closed { error: failure });
    tokio::select! {
        () = cancel.cancelled() => {}
        _ = mailbox.send(closed) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_finals_are_dropped() {
        let mut filter = FinalFilter::new();
        assert_eq!(filter.accept(""), None);
        assert_eq!(filter.accept("   \n"), None);
    }

    #[test]
    fn duplicate_final_is_dropped() {
        let mut filter = FinalFilter::new();
        assert_eq!(filter.accept("hi there"), Some("hi there".to_owned()));
        assert_eq!(filter.accept("hi there"), None);
        // Trimming is applied before comparison.
        assert_eq!(filter.accept("  hi there  "), None);
    }

    #[test]
    fn distinct_final_passes_after_duplicate() {
        let mut filter = FinalFilter::new();
        assert!(filter.accept("hi").is_some());
        assert!(filter.accept("hi").is_none());
        assert!(filter.accept("bye").is_some());
        // The previous text may repeat once something else intervened.
        assert!(filter.accept("hi").is_some());
    }

    #[tokio::test]
    async fn pump_forwards_and_reports_close() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (mailbox_tx, mut mailbox_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_stt_pump(event_rx, mailbox_tx, cancel));

        event_tx
            .send(SttEvent::Partial { text: "hi".into() })
            .await
            .unwrap();
        event_tx
            .send(SttEvent::Final { text: "hi".into() })
            .await
            .unwrap();
        drop(event_tx);
        pump.await.unwrap();

        assert!(matches!(
            mailbox_rx.recv().await,
            Some(SessionMessage::Stt(SttBridgeEvent::Partial(t))) if t == "hi"
        ));
        assert!(matches!(
            mailbox_rx.recv().await,
            Some(SessionMessage::Stt(SttBridgeEvent::Final(t))) if t == "hi"
        ));
        assert!(matches!(
            mailbox_rx.recv().await,
            Some(SessionMessage::Stt(SttBridgeEvent::Closed { error: None }))
        ));
    }

    #[tokio::test]
    async fn pump_reports_vendor_error_on_close() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (mailbox_tx, mut mailbox_rx) = mpsc::channel(8);
        let pump = tokio::spawn(run_stt_pump(event_rx, mailbox_tx, CancellationToken::new()));

        event_tx
            .send(SttEvent::Error {
                message: "socket reset".into(),
                fatal: false,
            })
            .await
            .unwrap();
        drop(event_tx);
        pump.await.unwrap();

        assert!(matches!(
            mailbox_rx.recv().await,
            Some(SessionMessage::Stt(SttBridgeEvent::Closed { error: Some(f) }))
                if f.message == "socket reset" && !f.fatal
        ));
    }
}
