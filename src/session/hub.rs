//! Per-session event fan-out.
//!
//! The engine writes into one bounded channel; the hub task forwards each
//! event, in order, to every subscriber's own bounded channel and waits for
//! capacity, so a slow consumer slows the engine instead of losing events.
//! Closed subscribers are pruned after each event. Once the session is
//! cancelled, a subscriber that does not take an event within a short grace
//! period is dropped so the terminal event can go through.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::trace::CancelFlag;
use crate::types::TraceEvent;

/// How long a subscriber may hold up delivery after cancellation.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

pub struct EventHub {
    /// `None` once the session has finished and the hub has shut down.
    subscribers: Mutex<Option<Vec<mpsc::Sender<TraceEvent>>>>,
    recent: Mutex<VecDeque<TraceEvent>>,
    recent_window: usize,
    subscriber_buffer: usize,
    /// Flips to `true` once every event has been forwarded.
    done: watch::Sender<bool>,
}

impl EventHub {
    pub fn new(recent_window: usize, subscriber_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Some(Vec::new())),
            recent: Mutex::new(VecDeque::with_capacity(recent_window.min(1024))),
            recent_window,
            subscriber_buffer: subscriber_buffer.max(1),
            done: watch::channel(false).0,
        })
    }

    /// A stream of every event emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        if let Ok(mut subs) = self.subscribers.lock() {
            if let Some(list) = subs.as_mut() {
                list.push(tx);
            }
        }
        EventStream { rx }
    }

    /// The bounded window of most recent events, oldest first.
    pub fn recent(&self) -> Vec<TraceEvent> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(Vec::len))
            .unwrap_or_default()
    }

    /// Resolves once the engine side has closed and the last event has
    /// been handed to every subscriber.
    pub async fn closed(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn remember(&self, event: &TraceEvent) {
        if self.recent_window == 0 {
            return;
        }
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.recent_window {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
    }

    fn snapshot(&self) -> Vec<mpsc::Sender<TraceEvent>> {
        self.subscribers
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .unwrap_or_default()
    }

    /// Remove closed subscribers and any in `stalled`.
    fn prune(&self, stalled: &[mpsc::Sender<TraceEvent>]) {
        if let Ok(mut subs) = self.subscribers.lock() {
            if let Some(list) = subs.as_mut() {
                list.retain(|s| !s.is_closed() && !stalled.iter().any(|d| d.same_channel(s)));
            }
        }
    }

    /// Hand one event to a subscriber. Returns `false` if it is gone or
    /// stalled past cancellation.
    async fn deliver(sub: &mpsc::Sender<TraceEvent>, event: &TraceEvent, cancel: &CancelFlag) -> bool {
        if cancel.is_cancelled() {
            return sub.send_timeout(event.clone(), CANCEL_GRACE).await.is_ok();
        }
        tokio::select! {
            biased;
            sent = sub.send(event.clone()) => sent.is_ok(),
            _ = cancel.cancelled() => sub.send_timeout(event.clone(), CANCEL_GRACE).await.is_ok(),
        }
    }

    /// Forward engine events until the engine side closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TraceEvent>, cancel: CancelFlag) {
        while let Some(event) = events.recv().await {
            self.remember(&event);

            let mut dropped = Vec::new();
            for sub in self.snapshot() {
                if !Self::deliver(&sub, &event, &cancel).await {
                    dropped.push(sub);
                }
            }
            if !dropped.is_empty() {
                let stalled: Vec<_> = dropped.into_iter().filter(|s| !s.is_closed()).collect();
                if !stalled.is_empty() {
                    warn!(session = %event.session_id, count = stalled.len(), "Dropping stalled subscribers");
                }
                self.prune(&stalled);
                debug!(session = %event.session_id, "Pruned subscribers");
            }
        }

        // Dropping the senders ends every subscriber stream.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.take();
        }
        self.done.send_replace(true);
    }
}

/// Ordered stream of a session's events.
pub struct EventStream {
    rx: mpsc::Receiver<TraceEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<TraceEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = TraceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CycleId, EventPayload, RiskTarget, SessionId};
    use futures::StreamExt;

    fn make_event(id: SessionId, seq: u64) -> TraceEvent {
        TraceEvent {
            session_id: id,
            seq,
            payload: EventPayload::RiskUpdate {
                target: RiskTarget::Cycle(CycleId(1)),
                score: 0.1,
            },
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let hub = EventHub::new(8, 4);
        let (tx, rx) = mpsc::channel(4);
        let mut a = hub.subscribe();
        let b = hub.subscribe();
        tokio::spawn(hub.clone().run(rx, CancelFlag::new()));

        let id = SessionId::new();
        tokio::spawn(async move {
            for seq in 1..=10 {
                tx.send(make_event(id, seq)).await.unwrap();
            }
        });

        let (seen_a, seen_b) = tokio::join!(
            async move {
                let mut seen = Vec::new();
                while let Some(e) = a.recv().await {
                    seen.push(e.seq);
                }
                seen
            },
            b.map(|e| e.seq).collect::<Vec<u64>>(),
        );
        assert_eq!(seen_a, (1..=10).collect::<Vec<_>>());
        assert_eq!(seen_b, seen_a);
    }

    #[tokio::test]
    async fn test_recent_window_is_bounded() {
        let hub = EventHub::new(3, 4);
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(hub.clone().run(rx, CancelFlag::new()));

        let id = SessionId::new();
        for seq in 1..=5 {
            tx.send(make_event(id, seq)).await.unwrap();
        }
        drop(tx);
        run.await.unwrap();

        let recent: Vec<u64> = hub.recent().iter().map(|e| e.seq).collect();
        assert_eq!(recent, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let hub = EventHub::new(0, 1);
        let (tx, rx) = mpsc::channel(1);
        let gone = hub.subscribe();
        let mut kept = hub.subscribe();
        drop(gone);
        tokio::spawn(hub.clone().run(rx, CancelFlag::new()));

        let id = SessionId::new();
        tx.send(make_event(id, 1)).await.unwrap();
        tx.send(make_event(id, 2)).await.unwrap();
        assert_eq!(kept.recv().await.map(|e| e.seq), Some(1));
        // pruning after event 1 completes before event 2 is forwarded
        assert_eq!(kept.recv().await.map(|e| e.seq), Some(2));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_dropped_on_cancel() {
        let hub = EventHub::new(8, 1);
        let (tx, rx) = mpsc::channel(1);
        let mut stalled = hub.subscribe();
        let cancel = CancelFlag::new();
        tokio::spawn(hub.clone().run(rx, cancel.clone()));

        let id = SessionId::new();
        // 1 fills the subscriber, 2 blocks the hub, 3 waits in the channel
        for seq in 1..=3 {
            tx.send(make_event(id, seq)).await.unwrap();
        }
        cancel.cancel();
        drop(tx);

        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(2), hub.closed()).await);
        assert_eq!(hub.recent().len(), 3);
        assert_eq!(stalled.recv().await.map(|e| e.seq), Some(1));
        assert!(stalled.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let hub = EventHub::new(4, 4);
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        hub.clone().run(rx, CancelFlag::new()).await;

        let mut late = hub.subscribe();
        assert!(late.recv().await.is_none());
        hub.closed().await;
    }
}
