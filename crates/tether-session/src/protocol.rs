use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use tether_core::{CloseReason, DisconnectReason, GO_AWAY};

/// The wrapped application protocol: a byte-oriented endpoint that receives
/// decoded JSON payloads and writes JSON-serialisable values back through
/// its [`Connection`].
///
/// `connection_made` runs exactly once per session, after the transport
/// handshake; `connection_lost` runs exactly once when the session ends.
pub trait SockJsProtocol: Send + 'static {
    fn connection_made(&mut self, conn: Connection);
    fn data_received(&mut self, data: Value);
    fn connection_lost(&mut self, reason: DisconnectReason);
}

/// Operations a session exposes to its application protocol.
pub(crate) trait ConnectionOps: Send + Sync {
    fn write(&self, messages: Vec<Value>);
    fn close(&self, reason: CloseReason);
}

/// Cloneable handle the application protocol writes through. Weakly tied to
/// the session: operations on a torn-down session are no-ops.
#[derive(Clone)]
pub struct Connection {
    ops: Arc<dyn ConnectionOps>,
}

impl Connection {
    pub(crate) fn new(ops: Arc<dyn ConnectionOps>) -> Self {
        Self { ops }
    }

    /// Write a batch of messages to the peer.
    pub fn write(&self, messages: Vec<Value>) {
        self.ops.write(messages);
    }

    /// Close the session with the generic orderly-shutdown reason.
    pub fn close(&self) {
        self.ops.close(GO_AWAY);
    }

    /// Close the session with a specific reason.
    pub fn close_with(&self, reason: CloseReason) {
        self.ops.close(reason);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}

/// Application-facing event produced by a state-machine transition.
#[derive(Debug)]
pub(crate) enum AppEvent {
    ConnectionMade(Connection),
    DataReceived(Value),
    ConnectionLost(DisconnectReason),
}

/// Queue of application events plus the protocol they are delivered to.
///
/// Transitions run under the session's state lock and only enqueue; delivery
/// happens after that lock is released, serialised by the protocol lock so
/// events reach the application in transition order. A drain that finds the
/// protocol busy backs off — the frame already draining (possibly further up
/// this very call stack) will pick the event up, which keeps re-entrant
/// writes from the application's callbacks deadlock-free.
pub(crate) struct AppChannel {
    protocol: Mutex<Box<dyn SockJsProtocol>>,
    pending: Mutex<VecDeque<AppEvent>>,
}

impl AppChannel {
    pub fn new(protocol: Box<dyn SockJsProtocol>) -> Self {
        Self {
            protocol: Mutex::new(protocol),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue an event. Call while holding the session state lock so queue
    /// order matches transition order.
    pub fn push(&self, event: AppEvent) {
        self.pending.lock().push_back(event);
    }

    /// Deliver queued events. Call only after the state lock is released.
    pub fn drain(&self) {
        loop {
            if self.pending.lock().is_empty() {
                return;
            }
            let Some(mut protocol) = self.protocol.try_lock() else {
                return;
            };
            loop {
                let event = self.pending.lock().pop_front();
                let Some(event) = event else { break };
                match event {
                    AppEvent::ConnectionMade(conn) => protocol.connection_made(conn),
                    AppEvent::DataReceived(data) => protocol.data_received(data),
                    AppEvent::ConnectionLost(reason) => protocol.connection_lost(reason),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct RecordingOps {
        written: Arc<Mutex<Vec<Vec<Value>>>>,
        closed: Arc<Mutex<Vec<CloseReason>>>,
    }

    impl ConnectionOps for RecordingOps {
        fn write(&self, messages: Vec<Value>) {
            self.written.lock().push(messages);
        }
        fn close(&self, reason: CloseReason) {
            self.closed.lock().push(reason);
        }
    }

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    struct RecordingProtocol(Events);

    impl SockJsProtocol for RecordingProtocol {
        fn connection_made(&mut self, _conn: Connection) {
            self.0 .0.lock().push("made".into());
        }
        fn data_received(&mut self, data: Value) {
            self.0 .0.lock().push(format!("data:{data}"));
        }
        fn connection_lost(&mut self, reason: DisconnectReason) {
            self.0 .0.lock().push(format!("lost:{}", reason.kind()));
        }
    }

    #[test]
    fn connection_routes_to_ops() {
        let ops = RecordingOps::default();
        let conn = Connection::new(Arc::new(ops.clone()));

        conn.write(vec![json!("hi")]);
        conn.close();
        conn.close_with(tether_core::STILL_OPEN);

        assert_eq!(ops.written.lock().as_slice(), [vec![json!("hi")]]);
        assert_eq!(ops.closed.lock().as_slice(), [GO_AWAY, tether_core::STILL_OPEN]);
    }

    #[test]
    fn drain_delivers_in_order() {
        let events = Events::default();
        let channel = AppChannel::new(Box::new(RecordingProtocol(events.clone())));

        channel.push(AppEvent::DataReceived(json!(1)));
        channel.push(AppEvent::DataReceived(json!(2)));
        channel.push(AppEvent::ConnectionLost(DisconnectReason::ConnectionDone));
        channel.drain();

        assert_eq!(
            events.0.lock().as_slice(),
            ["data:1", "data:2", "lost:connection_done"]
        );
    }

    #[test]
    fn reentrant_drain_is_picked_up_by_outer_frame() {
        struct Reentrant {
            channel: Arc<Mutex<Option<Arc<AppChannel>>>>,
            events: Events,
        }
        impl SockJsProtocol for Reentrant {
            fn connection_made(&mut self, _conn: Connection) {}
            fn data_received(&mut self, data: Value) {
                self.events.0.lock().push(format!("data:{data}"));
                // Simulate a callback that triggers another transition while
                // the protocol lock is held by this delivery.
                if data == json!(1) {
                    if let Some(channel) = self.channel.lock().clone() {
                        channel.push(AppEvent::DataReceived(json!(2)));
                        channel.drain(); // must not deadlock
                    }
                }
            }
            fn connection_lost(&mut self, _reason: DisconnectReason) {}
        }

        let events = Events::default();
        let slot = Arc::new(Mutex::new(None));
        let channel = Arc::new(AppChannel::new(Box::new(Reentrant {
            channel: Arc::clone(&slot),
            events: events.clone(),
        })));
        *slot.lock() = Some(Arc::clone(&channel));

        channel.push(AppEvent::DataReceived(json!(1)));
        channel.drain();

        assert_eq!(events.0.lock().as_slice(), ["data:1", "data:2"]);
    }
}
