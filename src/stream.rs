//! Streaming envelope: tagged events with per-query sequence numbers

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Outbound channel bound; a client that cannot drain this eventually
/// blocks synthesis and trips the disconnect path
pub const STREAM_CHANNEL_BOUND: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Token,
    Heartbeat,
    Citation,
    Disagreement,
    Degraded,
    Info,
    Final,
    Error,
}

/// Every emitted event carries the envelope: kind, per-query monotonic
/// sequence number, trace id, payload, and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event: EventKind,
    pub seq: u64,
    pub trace_id: String,
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Consumer half handed to the HTTP layer (or CLI)
pub type EventStream = ReceiverStream<StreamEvent>;

/// Producer half owned by the orchestrator. Cloneable; all clones share
/// the sequence counter so ordering is total per query.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    tx: mpsc::Sender<StreamEvent>,
    trace_id: String,
    seq: AtomicU64,
    started: Instant,
    first_event_ms: Mutex<Option<u64>>,
    last_event: Mutex<Instant>,
}

impl EventSender {
    pub fn channel(trace_id: String) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_BOUND);
        let now = Instant::now();
        let sender = Self {
            inner: Arc::new(SenderInner {
                tx,
                trace_id,
                seq: AtomicU64::new(0),
                started: now,
                first_event_ms: Mutex::new(None),
                last_event: Mutex::new(now),
            }),
        };
        (sender, ReceiverStream::new(rx))
    }

    /// Send one event. Returns false when the client is gone; the caller
    /// must treat that as a disconnect and stop producing.
    pub async fn send(&self, event: EventKind, data: serde_json::Value) -> bool {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let record = StreamEvent {
            event,
            seq,
            trace_id: self.inner.trace_id.clone(),
            data,
            ts: Utc::now(),
        };
        let delivered = self.inner.tx.send(record).await.is_ok();
        if delivered {
            let mut first = self.inner.first_event_ms.lock().expect("ttft lock poisoned");
            if first.is_none() {
                *first = Some(self.inner.started.elapsed().as_millis() as u64);
            }
            *self.inner.last_event.lock().expect("heartbeat lock poisoned") = Instant::now();
        }
        delivered
    }

    /// Milliseconds from stream creation to the first delivered event
    pub fn ttft_ms(&self) -> Option<u64> {
        *self.inner.first_event_ms.lock().expect("ttft lock poisoned")
    }

    pub fn events_sent(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    /// Resolves when the consumer half has been dropped (client disconnect)
    pub async fn closed(&self) {
        self.inner.tx.closed().await;
    }

    fn idle_for(&self) -> Duration {
        self.inner.last_event.lock().expect("heartbeat lock poisoned").elapsed()
    }
}

/// Synthesize a heartbeat whenever the stream has been silent for the
/// full interval. Runs until cancelled or the client disconnects.
pub fn spawn_heartbeat(
    sender: EventSender,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Check a few times per interval so a just-missed beat does not
        // stretch silence to nearly two intervals.
        let tick = interval / 4;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if sender.idle_for() >= interval {
                        let alive = sender
                            .send(EventKind::Heartbeat, serde_json::json!({"idle": true}))
                            .await;
                        if !alive {
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_and_zero_based() {
        let (sender, mut stream) = EventSender::channel("t-1".to_string());
        for _ in 0..3 {
            assert!(sender.send(EventKind::Token, serde_json::json!({"t": "x"})).await);
        }
        drop(sender);
        let mut seqs = Vec::new();
        while let Some(event) = stream.next().await {
            assert_eq!(event.trace_id, "t-1");
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn send_reports_disconnect() {
        let (sender, stream) = EventSender::channel("t-2".to_string());
        drop(stream);
        assert!(!sender.send(EventKind::Token, serde_json::json!({})).await);
    }

    #[tokio::test]
    async fn heartbeat_fires_when_idle() {
        let (sender, mut stream) = EventSender::channel("t-3".to_string());
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(sender.clone(), Duration::from_millis(40), cancel.clone());

        let event = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("heartbeat should arrive")
            .expect("stream open");
        assert_eq!(event.event, EventKind::Heartbeat);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn ttft_is_recorded_once() {
        let (sender, mut stream) = EventSender::channel("t-4".to_string());
        assert!(sender.ttft_ms().is_none());
        sender.send(EventKind::Heartbeat, serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.send(EventKind::Token, serde_json::json!({})).await;
        let first = sender.ttft_ms().unwrap();
        assert!(first < 20, "ttft should reflect the first event, got {}", first);
        let _ = stream.next().await;
    }
}
