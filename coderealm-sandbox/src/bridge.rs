//! Message bridge between one realm and its supervisor.
//!
//! The realm side holds a [`RealmPort`]; every payload it posts is wrapped in
//! an [`Envelope`] stamped with the port's session id. The supervisor side
//! holds the [`MessageBridge`], which drops envelopes from any other origin
//! and payloads that are not well-formed [`ExecutionEvent`]s.

use crate::limits::RealmLimits;
use coderealm_common::{ExecutionEvent, SessionId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Appended once when a realm exceeds its output budget
pub const OUTPUT_TRUNCATED_MARKER: &str = "[output truncated]\n";

/// A raw message tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: SessionId,
    pub payload: String,
}

#[derive(Debug)]
struct PortShared {
    closed: AtomicBool,
    output_bytes: AtomicUsize,
    truncated: AtomicBool,
}

/// Realm-side sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RealmPort {
    origin: SessionId,
    tx: mpsc::UnboundedSender<Envelope>,
    max_output_bytes: usize,
    shared: Arc<PortShared>,
}

impl RealmPort {
    pub fn session_id(&self) -> SessionId {
        self.origin
    }

    /// Post a raw wire payload. Returns `false` once the port is closed.
    pub fn post_raw(&self, payload: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx
            .send(Envelope {
                origin: self.origin,
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Post a typed event, applying the output budget to `output` events
    pub fn post(&self, event: &ExecutionEvent) -> bool {
        match event {
            ExecutionEvent::Output(text) => self.post_output(text),
            other => self.post_raw(other.to_wire()),
        }
    }

    fn post_output(&self, text: &str) -> bool {
        let used = self
            .shared
            .output_bytes
            .fetch_add(text.len(), Ordering::SeqCst);
        if used + text.len() <= self.max_output_bytes {
            return self.post_raw(ExecutionEvent::Output(text.to_string()).to_wire());
        }
        if !self.shared.truncated.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                session_id = %self.origin,
                max_output_bytes = self.max_output_bytes,
                "Realm output budget exhausted"
            );
            return self.post_raw(
                ExecutionEvent::Output(OUTPUT_TRUNCATED_MARKER.to_string()).to_wire(),
            );
        }
        // Dropped, but the realm keeps running until its terminal event.
        true
    }

    /// Stop accepting messages from this port and all its clones
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// A port stamped with a different origin but feeding the same channel.
    /// Used to exercise origin checks.
    #[cfg(test)]
    pub(crate) fn forged(&self, origin: SessionId) -> RealmPort {
        RealmPort {
            origin,
            tx: self.tx.clone(),
            max_output_bytes: self.max_output_bytes,
            shared: Arc::new(PortShared {
                closed: AtomicBool::new(false),
                output_bytes: AtomicUsize::new(0),
                truncated: AtomicBool::new(false),
            }),
        }
    }
}

/// Supervisor-side receiving half, bound to one session
#[derive(Debug)]
pub struct MessageBridge {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    finished: bool,
    dropped: usize,
}

impl MessageBridge {
    /// Open a bridge for `session_id`
    pub fn open(session_id: SessionId, limits: &RealmLimits) -> (RealmPort, MessageBridge) {
        let (tx, rx) = mpsc::unbounded_channel();
        let port = RealmPort {
            origin: session_id,
            tx,
            max_output_bytes: limits.max_output_bytes,
            shared: Arc::new(PortShared {
                closed: AtomicBool::new(false),
                output_bytes: AtomicUsize::new(0),
                truncated: AtomicBool::new(false),
            }),
        };
        let bridge = MessageBridge {
            session_id,
            rx,
            finished: false,
            dropped: 0,
        };
        (port, bridge)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next valid event, in posting order.
    ///
    /// Returns `None` after the first terminal event, or when every port has
    /// been dropped.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        while let Some(envelope) = self.rx.recv().await {
            if envelope.origin != self.session_id {
                self.dropped += 1;
                tracing::debug!(
                    session_id = %self.session_id,
                    origin = %envelope.origin,
                    "Dropping message from foreign origin"
                );
                continue;
            }
            let Some(event) = ExecutionEvent::from_wire(&envelope.payload) else {
                self.dropped += 1;
                continue;
            };
            if event.is_terminal() {
                self.finished = true;
                self.rx.close();
            }
            return Some(event);
        }
        None
    }

    /// A terminal event has been delivered
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Messages discarded for bad origin or shape
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderealm_common::ErrorInfo;

    fn open() -> (RealmPort, MessageBridge) {
        MessageBridge::open(SessionId::new(), &RealmLimits::default())
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (port, mut bridge) = open();
        port.post(&ExecutionEvent::Output("a".into()));
        port.post(&ExecutionEvent::Output("b".into()));
        port.post(&ExecutionEvent::Done);

        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Output("a".into())));
        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Output("b".into())));
        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Done));
        assert!(bridge.is_finished());
    }

    #[tokio::test]
    async fn test_first_terminal_event_wins() {
        let (port, mut bridge) = open();
        port.post(&ExecutionEvent::Error(ErrorInfo::new("first")));
        port.post(&ExecutionEvent::Done);
        port.post(&ExecutionEvent::Output("late".into()));

        assert_eq!(
            bridge.recv().await,
            Some(ExecutionEvent::Error(ErrorInfo::new("first")))
        );
        assert_eq!(bridge.recv().await, None);
        assert!(!port.post(&ExecutionEvent::Done));
    }

    #[tokio::test]
    async fn test_foreign_origin_and_malformed_dropped() {
        let (port, mut bridge) = open();
        let intruder = port.forged(SessionId::new());
        intruder.post(&ExecutionEvent::Output("spoofed".into()));
        port.post_raw("{\"type\":\"exec\",\"data\":\"x\"}");
        port.post_raw("garbage");
        port.post(&ExecutionEvent::Output("real".into()));
        port.post(&ExecutionEvent::Done);

        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Output("real".into())));
        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Done));
        assert_eq!(bridge.dropped(), 3);
    }

    #[tokio::test]
    async fn test_output_budget_marks_truncation_once() {
        let limits = RealmLimits {
            max_output_bytes: 4,
            ..RealmLimits::default()
        };
        let (port, mut bridge) = MessageBridge::open(SessionId::new(), &limits);
        port.post(&ExecutionEvent::Output("abc".into()));
        port.post(&ExecutionEvent::Output("defg".into()));
        port.post(&ExecutionEvent::Output("hij".into()));
        port.post(&ExecutionEvent::Done);

        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Output("abc".into())));
        assert_eq!(
            bridge.recv().await,
            Some(ExecutionEvent::Output(OUTPUT_TRUNCATED_MARKER.into()))
        );
        assert_eq!(bridge.recv().await, Some(ExecutionEvent::Done));
    }

    #[tokio::test]
    async fn test_closed_port_stops_posting() {
        let (port, mut bridge) = open();
        let clone = port.clone();
        port.close();
        assert!(clone.is_closed());
        assert!(!clone.post(&ExecutionEvent::Done));
        drop(port);
        drop(clone);
        assert_eq!(bridge.recv().await, None);
    }
}
