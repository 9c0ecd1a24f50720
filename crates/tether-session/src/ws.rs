use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use tether_core::{CloseReason, DisconnectReason, Frame, JsonCodec};

use crate::heartbeat::{HeartbeatTimer, DEFAULT_HEARTBEAT_PERIOD};
use crate::protocol::{AppChannel, AppEvent, Connection, ConnectionOps, SockJsProtocol};

/// WebSocket close status for a frame whose binary/text kind does not match
/// the negotiated subprotocol.
pub const UNSUPPORTED_DATA: u16 = 1003;

/// Whether a WebSocket message travels as a text or binary frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// The WebSocket connection as the core consumes it: a message sink that
/// delivers whole frames. Handshake, masking, and compression belong to the
/// host stack.
pub trait WsTransport: Send + 'static {
    /// Send one complete message. Text frames carry the bytes as-is; base64
    /// is never involved.
    fn send(&mut self, frame: Bytes, kind: MessageKind);

    /// Close the connection without any further frames.
    fn lose_connection(&mut self);

    /// Fail the connection with a WebSocket close status.
    fn fail_connection(&mut self, code: u16, reason: &str);
}

/// Knobs for a WebSocket session. `enable_compression`, `auto_fragment_size`
/// and `subprotocol` are consumed by the host WebSocket stack; they ride
/// along here so one struct configures the whole transport.
#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    pub enable_compression: bool,
    pub auto_fragment_size: usize,
    pub subprotocol: Option<String>,
    pub heartbeat_period: Duration,
    pub codec: JsonCodec,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            auto_fragment_size: 0,
            subprotocol: None,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            codec: JsonCodec::new(),
        }
    }
}

/// Side effects of a [`WsSessionMachine`] transition.
pub trait WsEffects {
    fn write_open(&mut self);
    fn write_data(&mut self, messages: &[Value]);
    fn write_heartbeat(&mut self);
    fn write_close(&mut self, reason: &CloseReason);
    /// Actively close the transport.
    fn lose_transport(&mut self);
    /// Forget the transport; it is already gone.
    fn drop_transport(&mut self);
    fn schedule_heartbeat(&mut self);
    fn stop_heartbeat(&mut self);
    /// Pass a decoded payload up to the application.
    fn deliver(&mut self, data: Value);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WsState {
    NotYetConnected,
    Connected,
    Disconnected,
}

/// The always-connected WebSocket counterpart of the request-session
/// machine: one transport for the session's whole life, no buffering.
///
/// Stopping the heartbeat is an output of `disconnect` itself, not of the
/// later connection-lost notification: between losing the transport and its
/// asynchronous confirmation a pending heartbeat could otherwise fire on a
/// dead connection.
pub struct WsSessionMachine {
    state: WsState,
}

impl Default for WsSessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WsSessionMachine {
    pub fn new() -> Self {
        Self {
            state: WsState::NotYetConnected,
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    pub fn connect<E: WsEffects>(&mut self, fx: &mut E) {
        match self.state {
            WsState::NotYetConnected => {
                self.state = WsState::Connected;
                fx.write_open();
                fx.schedule_heartbeat();
            }
            _ => warn!(state = ?self.state, "connect ignored"),
        }
    }

    pub fn write<E: WsEffects>(&mut self, messages: Vec<Value>, fx: &mut E) {
        match self.state {
            WsState::Connected => {
                fx.write_data(&messages);
                fx.schedule_heartbeat();
            }
            _ => warn!(state = ?self.state, "write on unconnected session dropped"),
        }
    }

    pub fn receive<E: WsEffects>(&mut self, data: Value, fx: &mut E) {
        match self.state {
            WsState::Connected => fx.deliver(data),
            _ => warn!(state = ?self.state, "receive ignored"),
        }
    }

    pub fn heartbeat<E: WsEffects>(&mut self, fx: &mut E) {
        if self.state == WsState::Connected {
            fx.write_heartbeat();
        }
    }

    /// Close the connection for `reason`: close frame, transport teardown,
    /// heartbeat stop, in that order.
    pub fn disconnect<E: WsEffects>(&mut self, reason: &CloseReason, fx: &mut E) {
        match self.state {
            WsState::Connected => {
                self.state = WsState::Disconnected;
                fx.write_close(reason);
                fx.lose_transport();
                fx.stop_heartbeat();
            }
            WsState::NotYetConnected => {
                self.state = WsState::Disconnected;
            }
            WsState::Disconnected => {}
        }
    }

    /// The connection is already gone. Idempotent.
    pub fn close<E: WsEffects>(&mut self, fx: &mut E) {
        match self.state {
            WsState::Connected => {
                self.state = WsState::Disconnected;
                fx.drop_transport();
                fx.stop_heartbeat();
            }
            WsState::Disconnected => {}
            WsState::NotYetConnected => warn!("close before connect ignored"),
        }
    }
}

/// A SockJS session carried over a single WebSocket.
#[derive(Clone)]
pub struct WsSession {
    shared: Arc<WsShared>,
}

struct WsShared {
    state: Mutex<WsInner>,
    app: Arc<AppChannel>,
}

struct WsInner {
    machine: WsSessionMachine,
    io: WsIo,
}

impl WsSession {
    pub fn new(protocol: Box<dyn SockJsProtocol>, config: WebSocketConfig) -> Self {
        let app = Arc::new(AppChannel::new(protocol));
        let shared = Arc::new_cyclic(|weak: &Weak<WsShared>| {
            let beat_weak = weak.clone();
            let heartbeat = HeartbeatTimer::new(config.heartbeat_period, move || {
                if let Some(shared) = beat_weak.upgrade() {
                    WsShared::with_state(&shared, |machine, io| machine.heartbeat(io));
                }
            });
            WsShared {
                app: Arc::clone(&app),
                state: Mutex::new(WsInner {
                    machine: WsSessionMachine::new(),
                    io: WsIo {
                        codec: config.codec,
                        transport: None,
                        heartbeat,
                        binary_mode: false,
                        app,
                        weak: weak.clone(),
                    },
                }),
            }
        });
        Self { shared }
    }

    /// Record the subprotocols offered during the handshake. A protocol
    /// containing `binary` switches the session to binary messages. Call
    /// before `connect`.
    pub fn negotiated_protocols<S: AsRef<str>>(&self, protocols: &[S]) {
        let binary = protocols.iter().any(|p| p.as_ref().contains("binary"));
        self.shared.state.lock().io.binary_mode = binary;
        if binary {
            debug!("websocket session negotiated binary mode");
        }
    }

    pub fn binary_mode(&self) -> bool {
        self.shared.state.lock().io.binary_mode
    }

    /// The WebSocket opened: write the open frame and hand the application
    /// its connection.
    pub fn connect(&self, transport: Box<dyn WsTransport>) {
        self.shared.with_state(|machine, io| {
            io.transport = Some(transport);
            machine.connect(io);
            let conn = Connection::new(Arc::new(WsConnection {
                weak: io.weak.clone(),
            }));
            io.app.push(AppEvent::ConnectionMade(conn));
        });
    }

    /// Write a batch of messages as one data frame.
    pub fn write(&self, messages: Vec<Value>) {
        self.shared.with_state(|machine, io| machine.write(messages, io));
    }

    /// One whole inbound message. Empty frames are discarded; malformed JSON
    /// closes the connection without an error frame; a kind mismatched with
    /// the negotiated subprotocol fails the connection.
    pub fn data_received(&self, payload: &[u8], kind: MessageKind) {
        self.shared.with_state(|machine, io| {
            let expected = if io.binary_mode {
                MessageKind::Binary
            } else {
                MessageKind::Text
            };
            if kind != expected {
                if let Some(transport) = io.transport.as_mut() {
                    transport.fail_connection(
                        UNSUPPORTED_DATA,
                        "message payload type does not match the negotiated subprotocol",
                    );
                }
                return;
            }
            if payload.is_empty() {
                return;
            }
            match io.codec.decode(payload) {
                Ok(value) if is_empty_message(&value) => {}
                Ok(value) => machine.receive(value, io),
                Err(error) => {
                    debug!(%error, "closing websocket on malformed payload");
                    if let Some(transport) = io.transport.as_mut() {
                        transport.lose_connection();
                    }
                }
            }
        });
    }

    /// Orderly close with a close frame.
    pub fn close(&self, reason: CloseReason) {
        self.shared
            .with_state(|machine, io| machine.disconnect(&reason, io));
    }

    /// The host stack reports the socket gone.
    pub fn connection_lost(&self, reason: DisconnectReason) {
        self.shared.with_state(|machine, io| {
            let was_connected = machine.state() == WsState::Connected;
            machine.close(io);
            if was_connected {
                io.app.push(AppEvent::ConnectionLost(reason));
            }
        });
    }

    pub fn state(&self) -> WsState {
        self.shared.state.lock().machine.state()
    }
}

impl WsShared {
    fn with_state<T>(self: &Arc<Self>, f: impl FnOnce(&mut WsSessionMachine, &mut WsIo) -> T) -> T {
        let out = {
            let mut guard = self.state.lock();
            let WsInner { machine, io } = &mut *guard;
            f(machine, io)
        };
        self.app.drain();
        out
    }
}

struct WsIo {
    codec: JsonCodec,
    transport: Option<Box<dyn WsTransport>>,
    heartbeat: HeartbeatTimer,
    binary_mode: bool,
    app: Arc<AppChannel>,
    weak: Weak<WsShared>,
}

impl WsIo {
    fn send_frame(&mut self, frame: Frame<'_>) {
        let bytes = frame.encode(&self.codec);
        let kind = if self.binary_mode {
            MessageKind::Binary
        } else {
            MessageKind::Text
        };
        match self.transport.as_mut() {
            Some(transport) => transport.send(bytes, kind),
            None => warn!("websocket frame dropped: no transport"),
        }
    }
}

impl WsEffects for WsIo {
    fn write_open(&mut self) {
        self.send_frame(Frame::Open);
    }

    fn write_data(&mut self, messages: &[Value]) {
        self.send_frame(Frame::Data(messages));
    }

    fn write_heartbeat(&mut self) {
        self.send_frame(Frame::Heartbeat);
    }

    fn write_close(&mut self, reason: &CloseReason) {
        self.send_frame(Frame::Close(reason));
    }

    fn lose_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.lose_connection();
        }
    }

    fn drop_transport(&mut self) {
        self.transport = None;
    }

    fn schedule_heartbeat(&mut self) {
        let _ = self.heartbeat.schedule();
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat.stop();
    }

    fn deliver(&mut self, data: Value) {
        self.app.push(AppEvent::DataReceived(data));
    }
}

fn is_empty_message(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Weak write handle handed to the application protocol.
struct WsConnection {
    weak: Weak<WsShared>,
}

impl ConnectionOps for WsConnection {
    fn write(&self, messages: Vec<Value>) {
        if let Some(shared) = self.weak.upgrade() {
            shared.with_state(|machine, io| machine.write(messages, io));
        }
    }

    fn close(&self, reason: CloseReason) {
        if let Some(shared) = self.weak.upgrade() {
            shared.with_state(|machine, io| machine.disconnect(&reason, io));
        }
    }
}
