use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::{
    CloseReason, DisconnectReason, Frame, InvalidData, JsonCodec, SessionId, Termination,
};

use crate::heartbeat::{HeartbeatTimer, DEFAULT_HEARTBEAT_PERIOD};
use crate::machine::{RequestSessionMachine, SessionEffects};
use crate::protocol::{AppChannel, AppEvent, Connection, ConnectionOps, SockJsProtocol};
use crate::timeout::{SessionTimeoutTimer, TerminationSignal, DEFAULT_SESSION_TIMEOUT};
use crate::transport::TransportKind;

/// An attached HTTP request as the core consumes it: a write sink, a finish
/// operation, and a one-shot notifier for the response ending underneath us.
pub trait SessionRequest: Send + 'static {
    /// Append response bytes. Must not block; flow control is the host
    /// stack's concern.
    fn write(&mut self, data: Bytes);

    /// Finish the HTTP response.
    fn finish(&mut self);

    /// Resolves with `Err(reason)` if the response ends abnormally before
    /// `finish` (client hung up, transport error), `Ok(())` on a clean end.
    fn finished(&mut self) -> BoxFuture<'static, Result<(), DisconnectReason>>;
}

/// Knobs for a request-based session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub heartbeat_period: Duration,
    pub session_timeout: Duration,
    pub transport: TransportKind,
    pub codec: JsonCodec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            transport: TransportKind::XhrPolling,
            codec: JsonCodec::new(),
        }
    }
}

/// A SockJS session carried over short-lived HTTP requests.
///
/// The session outlives each request: requests attach as the current output
/// channel and detach per the transport's rules while the machine buffers
/// writes in between. Timer callbacks and notifier watchers run as tokio
/// tasks holding weak references; all per-session work is serialised behind
/// the state lock.
#[derive(Clone)]
pub struct RequestSession {
    shared: Arc<SessionShared>,
}

impl RequestSession {
    pub fn new(id: SessionId, protocol: Box<dyn SockJsProtocol>, config: SessionConfig) -> Self {
        let app = Arc::new(AppChannel::new(protocol));
        let (signal, termination_rx) = TerminationSignal::channel();

        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            let beat_weak = weak.clone();
            let heartbeat = HeartbeatTimer::new(config.heartbeat_period, move || {
                if let Some(shared) = beat_weak.upgrade() {
                    shared.heartbeat_tick();
                }
            });
            let timeout = SessionTimeoutTimer::new(config.session_timeout, signal.clone());
            SessionShared {
                id: id.clone(),
                app: Arc::clone(&app),
                hook: Mutex::new(None),
                state: Mutex::new(Inner {
                    machine: RequestSessionMachine::new(),
                    io: SessionIo {
                        id,
                        codec: config.codec,
                        transport: config.transport,
                        request: None,
                        heartbeat,
                        timeout,
                        termination: signal,
                        app,
                        weak: weak.clone(),
                        disconnecting: false,
                        established: false,
                        pending_detach: false,
                        streamed_bytes: 0,
                        notifier_cancel: None,
                    },
                }),
            }
        });

        // Watch the termination signal: expiry drives the session through
        // connection-lost, then whoever registered a hook (the registry)
        // learns how the session ended.
        let watch = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let Ok(value) = termination_rx.await else {
                return;
            };
            let Some(shared) = watch.upgrade() else {
                return;
            };
            if value == Termination::Expired {
                shared.handle_expiry();
            }
            let hook = shared.hook.lock().take();
            if let Some(hook) = hook {
                hook(value);
            }
        });

        Self { shared }
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    /// True iff a request is currently bound as the output channel.
    pub fn attached(&self) -> bool {
        self.shared.state.lock().io.request.is_some()
    }

    /// Register the single observer of this session's termination.
    pub fn on_terminated(&self, hook: impl FnOnce(Termination) + Send + 'static) {
        *self.shared.hook.lock() = Some(Box::new(hook));
    }

    /// Attach a request. This is the only way a session comes to life: the
    /// application's `connection_made` runs during the first attach, after
    /// the transport handshake (which may immediately finish the request).
    pub fn make_connection_from_request(&self, request: Box<dyn SessionRequest>) {
        self.shared
            .with_state(|machine, io| machine.attach(request, io));
    }

    /// Release the current request per the transport's rules.
    pub fn detach_from_request(&self) {
        self.shared.with_state(|machine, io| machine.detach(io));
    }

    /// Write a batch of messages to the peer, buffering while detached.
    pub fn write(&self, messages: Vec<Value>) {
        self.shared.write(messages);
    }

    /// Remember a close reason without emitting anything yet.
    pub fn write_close(&self, reason: CloseReason) {
        self.shared
            .with_state(|machine, _io| machine.write_close(reason));
    }

    /// Begin an orderly close: emit any stored close reason, release the
    /// request, and start the expiry clock. Idempotent.
    pub fn lose_connection(&self) {
        self.shared.lose_connection();
    }

    /// `write_close` + `lose_connection` in one step.
    pub fn close(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    /// Deliver an inbound request body to the session.
    pub fn data_received(&self, data: &[u8]) -> Result<(), InvalidData> {
        self.shared
            .with_state(|machine, io| machine.receive(data, io))
    }

    /// The host stack reports the wire connection gone.
    pub fn connection_lost(&self, reason: DisconnectReason) {
        self.shared.connection_lost(reason);
    }
}

impl std::fmt::Debug for RequestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSession")
            .field("id", &self.shared.id)
            .finish()
    }
}

struct SessionShared {
    id: SessionId,
    state: Mutex<Inner>,
    app: Arc<AppChannel>,
    hook: Mutex<Option<Box<dyn FnOnce(Termination) + Send>>>,
}

struct Inner {
    machine: RequestSessionMachine,
    io: SessionIo,
}

impl SessionShared {
    /// Run one transition under the state lock, apply any transport-rule
    /// detach it requested, then deliver application events outside the
    /// lock.
    fn with_state<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut RequestSessionMachine, &mut SessionIo) -> T,
    ) -> T {
        let out = {
            let mut guard = self.state.lock();
            let Inner { machine, io } = &mut *guard;
            let out = f(machine, io);
            if std::mem::take(&mut io.pending_detach) {
                machine.detach(io);
            }
            out
        };
        self.app.drain();
        out
    }

    fn write(self: &Arc<Self>, messages: Vec<Value>) {
        self.with_state(|machine, io| machine.write(messages, io));
    }

    fn lose_connection(self: &Arc<Self>) {
        self.with_state(|machine, io| {
            if io.disconnecting {
                return;
            }
            io.disconnecting = true;
            machine.lose_connection(io);
            if let Err(error) = io.timeout.start() {
                warn!(session_id = %io.id, %error, "starting expiry after close");
            }
        });
    }

    fn close(self: &Arc<Self>, reason: CloseReason) {
        self.with_state(|machine, io| {
            machine.write_close(reason);
            if io.disconnecting {
                return;
            }
            io.disconnecting = true;
            machine.lose_connection(io);
            if let Err(error) = io.timeout.start() {
                warn!(session_id = %io.id, %error, "starting expiry after close");
            }
        });
    }

    fn heartbeat_tick(self: &Arc<Self>) {
        self.with_state(|machine, io| machine.heartbeat(io));
    }

    fn connection_lost(self: &Arc<Self>, reason: DisconnectReason) {
        self.with_state(|machine, io| {
            if !io.disconnecting {
                // Peer-initiated: report the reason and stop waiting out the
                // session. Self-initiated closes already routed termination
                // through the expiry clock.
                io.termination.fire(Termination::Closed(reason.clone()));
                io.timeout.stop();
            }
            io.heartbeat.stop();
            machine.connection_lost(reason, io);
        });
    }

    /// The expiry clock fired. An idle session times out; a session already
    /// closing merely finishes its orderly teardown.
    fn handle_expiry(self: &Arc<Self>) {
        self.with_state(|machine, io| {
            let reason = if io.disconnecting {
                DisconnectReason::ConnectionDone
            } else {
                DisconnectReason::SessionTimeout
            };
            io.disconnecting = true;
            io.heartbeat.stop();
            machine.connection_lost(reason, io);
        });
    }
}

/// The adapter state the machine's outputs act on.
struct SessionIo {
    id: SessionId,
    codec: JsonCodec,
    transport: TransportKind,
    request: Option<Box<dyn SessionRequest>>,
    heartbeat: HeartbeatTimer,
    timeout: SessionTimeoutTimer,
    termination: TerminationSignal,
    app: Arc<AppChannel>,
    weak: Weak<SessionShared>,
    disconnecting: bool,
    established: bool,
    pending_detach: bool,
    streamed_bytes: usize,
    notifier_cancel: Option<CancellationToken>,
}

impl SessionIo {
    /// Frame bytes plus the request-transport newline.
    fn frame_bytes(&self, frame: Frame<'_>) -> Bytes {
        let encoded = frame.encode(&self.codec);
        let mut out = Vec::with_capacity(encoded.len() + 1);
        out.extend_from_slice(&encoded);
        out.push(b'\n');
        Bytes::from(out)
    }

    /// Write one frame to the current request and reset the heartbeat.
    fn write_frame(&mut self, frame: Frame<'_>) -> usize {
        let bytes = self.frame_bytes(frame);
        let len = bytes.len();
        match self.request.as_mut() {
            Some(request) => request.write(bytes),
            None => {
                warn!(session_id = %self.id, "frame dropped: no attached request");
                return 0;
            }
        }
        let _ = self.heartbeat.schedule();
        len
    }

    fn write_data_frame(&mut self, messages: &[Value]) {
        let written = self.write_frame(Frame::Data(messages));
        if written == 0 {
            return;
        }
        if self.transport.detaches_after_each_frame() {
            self.pending_detach = true;
        } else if let Some(window) = self.transport.streaming_window() {
            self.streamed_bytes += written;
            if self.streamed_bytes >= window {
                self.streamed_bytes = 0;
                self.pending_detach = true;
            }
        }
    }
}

impl SessionEffects for SessionIo {
    type Request = Box<dyn SessionRequest>;

    fn open_request(&mut self, request: Box<dyn SessionRequest>) {
        debug_assert!(self.request.is_none(), "attach over an attached request");
        self.request = Some(request);
    }

    fn establish_connection(&mut self) {
        self.established = true;
        debug!(session_id = %self.id, transport = ?self.transport, "session established");
    }

    fn begin_request(&mut self) {
        if let Some(request) = self.request.as_mut() {
            let finished = request.finished();
            let cancel = CancellationToken::new();
            self.notifier_cancel = Some(cancel.clone());
            let weak = self.weak.clone();
            tokio::spawn(async move {
                tokio::select! {
                    // Clean detach cancels the watch; never a connection loss.
                    _ = cancel.cancelled() => {}
                    result = finished => {
                        if let Err(reason) = result {
                            if let Some(shared) = weak.upgrade() {
                                shared.connection_lost(reason);
                            }
                        }
                    }
                }
            });
        }
        if let Err(error) = self.timeout.reset() {
            warn!(session_id = %self.id, %error, "resetting expiry on attach");
        }
    }

    fn complete_connection(&mut self) {
        debug_assert!(self.established, "handshake before establish_connection");
        if let Some(prelude) = self.transport.prelude() {
            let mut out = Vec::with_capacity(prelude.len() + 1);
            out.extend_from_slice(&prelude);
            out.push(b'\n');
            if let Some(request) = self.request.as_mut() {
                request.write(Bytes::from(out));
            }
        }
        self.write_frame(Frame::Open);
        if self.transport.detaches_after_each_frame() {
            self.pending_detach = true;
        }
        let conn = Connection::new(Arc::new(RequestConnection {
            weak: self.weak.clone(),
        }));
        self.app.push(AppEvent::ConnectionMade(conn));
    }

    fn complete_data_received(&mut self, data: &[u8]) -> Result<(), InvalidData> {
        let value = self.codec.decode(data)?;
        self.app.push(AppEvent::DataReceived(value));
        Ok(())
    }

    fn complete_write(&mut self, messages: &[Value]) {
        self.write_data_frame(messages);
    }

    fn flush_buffer(&mut self, messages: Vec<Value>) {
        self.write_data_frame(&messages);
    }

    fn complete_heartbeat(&mut self) {
        self.write_frame(Frame::Heartbeat);
    }

    fn close_request(&mut self) {
        if let Some(cancel) = self.notifier_cancel.take() {
            cancel.cancel();
        }
        if let Some(mut request) = self.request.take() {
            request.finish();
        }
        if let Err(error) = self.timeout.start() {
            warn!(session_id = %self.id, %error, "starting expiry on detach");
        }
    }

    fn close_duplicate_request(&mut self, mut request: Box<dyn SessionRequest>, reason: &CloseReason) {
        debug!(session_id = %self.id, code = reason.code, "evicting duplicate request");
        request.write(self.frame_bytes(Frame::Close(reason)));
        request.finish();
    }

    fn write_current_close(&mut self, reason: &CloseReason) {
        self.write_frame(Frame::Close(reason));
    }

    fn write_close_reason(&mut self, mut request: Box<dyn SessionRequest>, reason: &CloseReason) {
        request.write(self.frame_bytes(Frame::Close(reason)));
        request.finish();
    }

    fn complete_lose_connection(&mut self) {
        self.heartbeat.stop();
        debug!(session_id = %self.id, "session closing");
    }

    fn drop_request(&mut self) {
        if let Some(cancel) = self.notifier_cancel.take() {
            cancel.cancel();
        }
        self.request = None;
    }

    fn close_protocol(&mut self, reason: DisconnectReason) {
        debug!(session_id = %self.id, reason = %reason, "session disconnected");
        self.app.push(AppEvent::ConnectionLost(reason));
    }

    fn timed_out(&mut self, reason: DisconnectReason) {
        // Data was still pending when the wire went away for good; a plain
        // connection-done is really a session timeout.
        let reason = if reason == DisconnectReason::ConnectionDone {
            DisconnectReason::SessionTimeout
        } else {
            reason
        };
        self.close_protocol(reason);
    }
}

/// Weak write handle handed to the application protocol.
struct RequestConnection {
    weak: Weak<SessionShared>,
}

impl ConnectionOps for RequestConnection {
    fn write(&self, messages: Vec<Value>) {
        if let Some(shared) = self.weak.upgrade() {
            shared.write(messages);
        }
    }

    fn close(&self, reason: CloseReason) {
        if let Some(shared) = self.weak.upgrade() {
            shared.close(reason);
        }
    }
}
