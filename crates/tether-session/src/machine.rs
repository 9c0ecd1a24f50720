use serde_json::Value;
use tracing::warn;

use tether_core::{CloseReason, DisconnectReason, InvalidData, STILL_OPEN};

/// Side effects a [`RequestSessionMachine`] transition dispatches into its
/// adapter. The machine never holds a reference to the adapter; callers pass
/// the effects receiver into each input instead.
pub trait SessionEffects {
    type Request;

    /// Bind `request` as the session's current output channel.
    fn open_request(&mut self, request: Self::Request);
    /// One-time wire setup on the very first attach.
    fn establish_connection(&mut self);
    /// Per-attachment setup: watch the request's finished notifier and
    /// disarm the session timeout.
    fn begin_request(&mut self);
    /// One-time handshake with the wrapped application protocol. May write
    /// transport preludes and the open frame, and may immediately detach.
    fn complete_connection(&mut self);
    /// Deliver an inbound payload to the wire layer for decoding.
    fn complete_data_received(&mut self, data: &[u8]) -> Result<(), InvalidData>;
    /// Write one data frame carrying `messages` to the current request.
    fn complete_write(&mut self, messages: &[Value]);
    /// Write the entire buffered backlog as one aggregated data frame.
    fn flush_buffer(&mut self, messages: Vec<Value>);
    /// Write a heartbeat frame to the current request.
    fn complete_heartbeat(&mut self);
    /// Finish the current request and start the session timeout.
    fn close_request(&mut self);
    /// Close a newcomer request without touching the incumbent.
    fn close_duplicate_request(&mut self, request: Self::Request, reason: &CloseReason);
    /// Emit the stored close reason on the still-attached request.
    fn write_current_close(&mut self, reason: &CloseReason);
    /// Emit the stored close reason to a request attaching after close.
    fn write_close_reason(&mut self, request: Self::Request, reason: &CloseReason);
    /// Tear down the wire side of the connection.
    fn complete_lose_connection(&mut self);
    /// Forget the current request without finishing it.
    fn drop_request(&mut self);
    /// Tell the wrapped application protocol the connection is gone.
    fn close_protocol(&mut self, reason: DisconnectReason);
    /// As `close_protocol`, but a plain connection-done becomes a
    /// session-timeout failure: data was still pending when the session died.
    fn timed_out(&mut self, reason: DisconnectReason);
}

/// Where a request session stands with respect to its transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Never attached to any request.
    NeverConnected,
    /// A request is attached; the buffer is empty by construction.
    HaveRequest,
    /// Detached, nothing buffered.
    NoRequestEmpty,
    /// Detached with buffered writes awaiting the next request.
    NoRequestPending,
    /// Close requested while attached or detached-empty.
    ClosingEmpty,
    /// Close requested with buffered data; the buffer was discarded.
    ClosingPending,
    /// Terminal.
    Disconnected,
}

/// The state machine at the heart of polling and streaming transports.
///
/// A session outlives the HTTP request that carries it: requests attach and
/// detach while the session buffers writes, suppresses heartbeats, and
/// remembers a close reason for late arrivals. Inputs not defined for the
/// current state are logged and dropped rather than surfaced to the peer.
pub struct RequestSessionMachine {
    state: SessionState,
    buffer: Vec<Value>,
    close_reason: Option<CloseReason>,
}

impl Default for RequestSessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::NeverConnected,
            buffer: Vec::new(),
            close_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffered(&self) -> &[Value] {
        &self.buffer
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Attach a request as the session's output channel.
    pub fn attach<E: SessionEffects>(&mut self, request: E::Request, fx: &mut E) {
        match self.state {
            SessionState::NeverConnected => {
                self.state = SessionState::HaveRequest;
                fx.open_request(request);
                fx.establish_connection();
                fx.begin_request();
                fx.complete_connection();
            }
            SessionState::HaveRequest => {
                fx.close_duplicate_request(request, &STILL_OPEN);
            }
            SessionState::NoRequestEmpty => {
                self.state = SessionState::HaveRequest;
                fx.open_request(request);
                fx.begin_request();
            }
            SessionState::NoRequestPending => {
                self.state = SessionState::HaveRequest;
                fx.open_request(request);
                fx.begin_request();
                fx.flush_buffer(std::mem::take(&mut self.buffer));
            }
            SessionState::ClosingEmpty | SessionState::ClosingPending => {
                if let Some(reason) = self.close_reason.clone() {
                    fx.write_close_reason(request, &reason);
                }
            }
            SessionState::Disconnected => {
                warn!(state = ?self.state, "attach on a disconnected session ignored");
            }
        }
    }

    /// Release the current request, leaving the session without an output
    /// channel. Idempotent while detached.
    pub fn detach<E: SessionEffects>(&mut self, fx: &mut E) {
        match self.state {
            SessionState::HaveRequest => {
                self.state = SessionState::NoRequestEmpty;
                fx.close_request();
            }
            SessionState::NoRequestEmpty
            | SessionState::NoRequestPending
            | SessionState::ClosingEmpty
            | SessionState::ClosingPending => {}
            SessionState::NeverConnected | SessionState::Disconnected => {
                warn!(state = ?self.state, "detach ignored");
            }
        }
    }

    /// Write a batch of messages, directly or into the buffer.
    pub fn write<E: SessionEffects>(&mut self, messages: Vec<Value>, fx: &mut E) {
        match self.state {
            SessionState::HaveRequest => fx.complete_write(&messages),
            SessionState::NoRequestEmpty => {
                self.state = SessionState::NoRequestPending;
                self.buffer.extend(messages);
            }
            SessionState::NoRequestPending => self.buffer.extend(messages),
            SessionState::NeverConnected
            | SessionState::ClosingEmpty
            | SessionState::ClosingPending
            | SessionState::Disconnected => {
                warn!(state = ?self.state, "write after close dropped");
            }
        }
    }

    /// Deliver an inbound payload. Ignored once a close is underway; the
    /// session state and buffer are unaffected by a decode failure.
    pub fn receive<E: SessionEffects>(&mut self, data: &[u8], fx: &mut E) -> Result<(), InvalidData> {
        match self.state {
            SessionState::HaveRequest
            | SessionState::NoRequestEmpty
            | SessionState::NoRequestPending => fx.complete_data_received(data),
            SessionState::ClosingEmpty | SessionState::ClosingPending => Ok(()),
            SessionState::NeverConnected | SessionState::Disconnected => {
                warn!(state = ?self.state, "receive ignored");
                Ok(())
            }
        }
    }

    /// Emit a heartbeat if a request is attached; suppressed otherwise.
    pub fn heartbeat<E: SessionEffects>(&mut self, fx: &mut E) {
        if self.state == SessionState::HaveRequest {
            fx.complete_heartbeat();
        }
    }

    /// Remember the reason for a close. The frame itself is written lazily:
    /// on the attached request when `lose_connection` follows, or to the
    /// next request attaching after the close.
    pub fn write_close(&mut self, reason: CloseReason) {
        match self.state {
            SessionState::HaveRequest
            | SessionState::NoRequestEmpty
            | SessionState::NoRequestPending => self.close_reason = Some(reason),
            _ => {
                warn!(state = ?self.state, "close reason after close ignored");
            }
        }
    }

    /// Begin an orderly close. Buffered data still unsent is discarded: the
    /// peer chose to close.
    pub fn lose_connection<E: SessionEffects>(&mut self, fx: &mut E) {
        match self.state {
            SessionState::HaveRequest => {
                self.state = SessionState::ClosingEmpty;
                if let Some(reason) = self.close_reason.clone() {
                    fx.write_current_close(&reason);
                }
                fx.close_request();
                fx.complete_lose_connection();
            }
            SessionState::NoRequestEmpty => {
                self.state = SessionState::ClosingEmpty;
                fx.complete_lose_connection();
            }
            SessionState::NoRequestPending => {
                self.state = SessionState::ClosingPending;
                self.buffer.clear();
                fx.complete_lose_connection();
            }
            SessionState::ClosingEmpty
            | SessionState::ClosingPending
            | SessionState::NeverConnected
            | SessionState::Disconnected => {}
        }
    }

    /// The wire connection is gone for good.
    pub fn connection_lost<E: SessionEffects>(&mut self, reason: DisconnectReason, fx: &mut E) {
        match self.state {
            SessionState::HaveRequest => {
                self.state = SessionState::Disconnected;
                fx.drop_request();
                fx.close_protocol(reason);
            }
            SessionState::NoRequestEmpty | SessionState::ClosingEmpty => {
                self.state = SessionState::Disconnected;
                fx.close_protocol(reason);
            }
            SessionState::NoRequestPending => {
                self.state = SessionState::Disconnected;
                fx.drop_request();
                fx.timed_out(reason);
            }
            SessionState::ClosingPending => {
                self.state = SessionState::Disconnected;
                fx.timed_out(reason);
            }
            SessionState::NeverConnected => {
                self.state = SessionState::Disconnected;
            }
            SessionState::Disconnected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::GO_AWAY;

    #[derive(Debug, Default)]
    struct Recorder {
        opened: Vec<&'static str>,
        established: usize,
        begun: usize,
        completed_connections: usize,
        received: Vec<Vec<u8>>,
        written: Vec<Vec<Value>>,
        flushed: Vec<Vec<Value>>,
        heartbeats: usize,
        closed_requests: usize,
        duplicates: Vec<(&'static str, CloseReason)>,
        current_closes: Vec<CloseReason>,
        late_closes: Vec<(&'static str, CloseReason)>,
        lost_connections: usize,
        dropped_requests: usize,
        closed_protocols: Vec<DisconnectReason>,
        timed_out: Vec<DisconnectReason>,
    }

    impl SessionEffects for Recorder {
        type Request = &'static str;

        fn open_request(&mut self, request: &'static str) {
            self.opened.push(request);
        }
        fn establish_connection(&mut self) {
            self.established += 1;
        }
        fn begin_request(&mut self) {
            self.begun += 1;
        }
        fn complete_connection(&mut self) {
            self.completed_connections += 1;
        }
        fn complete_data_received(&mut self, data: &[u8]) -> Result<(), InvalidData> {
            self.received.push(data.to_vec());
            Ok(())
        }
        fn complete_write(&mut self, messages: &[Value]) {
            self.written.push(messages.to_vec());
        }
        fn flush_buffer(&mut self, messages: Vec<Value>) {
            self.flushed.push(messages);
        }
        fn complete_heartbeat(&mut self) {
            self.heartbeats += 1;
        }
        fn close_request(&mut self) {
            self.closed_requests += 1;
        }
        fn close_duplicate_request(&mut self, request: &'static str, reason: &CloseReason) {
            self.duplicates.push((request, reason.clone()));
        }
        fn write_current_close(&mut self, reason: &CloseReason) {
            self.current_closes.push(reason.clone());
        }
        fn write_close_reason(&mut self, request: &'static str, reason: &CloseReason) {
            self.late_closes.push((request, reason.clone()));
        }
        fn complete_lose_connection(&mut self) {
            self.lost_connections += 1;
        }
        fn drop_request(&mut self) {
            self.dropped_requests += 1;
        }
        fn close_protocol(&mut self, reason: DisconnectReason) {
            self.closed_protocols.push(reason);
        }
        fn timed_out(&mut self, reason: DisconnectReason) {
            let reason = if reason == DisconnectReason::ConnectionDone {
                DisconnectReason::SessionTimeout
            } else {
                reason
            };
            self.timed_out.push(reason);
        }
    }

    fn attached() -> (RequestSessionMachine, Recorder) {
        let mut machine = RequestSessionMachine::new();
        let mut fx = Recorder::default();
        machine.attach("r1", &mut fx);
        (machine, fx)
    }

    #[test]
    fn first_attach_runs_full_handshake() {
        let (machine, fx) = attached();
        assert_eq!(machine.state(), SessionState::HaveRequest);
        assert_eq!(fx.opened, ["r1"]);
        assert_eq!(fx.established, 1);
        assert_eq!(fx.begun, 1);
        assert_eq!(fx.completed_connections, 1);
    }

    #[test]
    fn attached_write_goes_direct() {
        let (mut machine, mut fx) = attached();
        machine.write(vec![json!("abc")], &mut fx);
        assert_eq!(fx.written, [vec![json!("abc")]]);
        assert!(machine.buffered().is_empty());
    }

    #[test]
    fn attached_receive_passes_through() {
        let (mut machine, mut fx) = attached();
        machine.receive(b"[\"abc\"]", &mut fx).unwrap();
        assert_eq!(fx.received, [b"[\"abc\"]".to_vec()]);
    }

    #[test]
    fn attached_heartbeat_is_emitted() {
        let (mut machine, mut fx) = attached();
        machine.heartbeat(&mut fx);
        assert_eq!(fx.heartbeats, 1);
    }

    #[test]
    fn detach_closes_request() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        assert_eq!(machine.state(), SessionState::NoRequestEmpty);
        assert_eq!(fx.closed_requests, 1);

        machine.detach(&mut fx); // idempotent
        assert_eq!(fx.closed_requests, 1);
    }

    #[test]
    fn duplicate_attach_evicts_newcomer() {
        let (mut machine, mut fx) = attached();
        machine.attach("r2", &mut fx);
        assert_eq!(machine.state(), SessionState::HaveRequest);
        assert_eq!(fx.duplicates, [("r2", STILL_OPEN)]);
        assert_eq!(fx.opened, ["r1"]);
    }

    #[test]
    fn detached_heartbeat_is_suppressed() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.heartbeat(&mut fx);
        machine.write(vec![json!("x")], &mut fx);
        machine.heartbeat(&mut fx);
        assert_eq!(fx.heartbeats, 0);
    }

    #[test]
    fn detached_writes_buffer_then_flush_on_attach() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);

        machine.write(vec![json!(["a"])], &mut fx);
        assert_eq!(machine.state(), SessionState::NoRequestPending);
        machine.write(vec![json!(["b"])], &mut fx);
        assert_eq!(machine.buffered(), [json!(["a"]), json!(["b"])]);

        machine.attach("r2", &mut fx);
        assert_eq!(machine.state(), SessionState::HaveRequest);
        assert_eq!(fx.flushed, [vec![json!(["a"]), json!(["b"])]]);
        assert!(machine.buffered().is_empty());
        // re-attach also re-arms the per-request setup
        assert_eq!(fx.begun, 2);
        assert_eq!(fx.completed_connections, 1);
    }

    #[test]
    fn detached_receive_still_passes_through() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.receive(b"xyz", &mut fx).unwrap();
        machine.write(vec![json!("q")], &mut fx);
        machine.receive(b"zyx", &mut fx).unwrap();
        assert_eq!(fx.received.len(), 2);
    }

    #[test]
    fn close_reason_is_stored_not_written() {
        let (mut machine, mut fx) = attached();
        machine.write_close(GO_AWAY);
        assert_eq!(machine.state(), SessionState::HaveRequest);
        assert_eq!(machine.close_reason(), Some(&GO_AWAY));
        assert!(fx.current_closes.is_empty());
        assert!(fx.late_closes.is_empty());
    }

    #[test]
    fn lose_connection_while_attached_emits_stored_close() {
        let (mut machine, mut fx) = attached();
        machine.write_close(GO_AWAY);
        machine.lose_connection(&mut fx);

        assert_eq!(machine.state(), SessionState::ClosingEmpty);
        assert_eq!(fx.current_closes, [GO_AWAY]);
        assert_eq!(fx.closed_requests, 1);
        assert_eq!(fx.lost_connections, 1);
    }

    #[test]
    fn lose_connection_without_stored_reason() {
        let (mut machine, mut fx) = attached();
        machine.lose_connection(&mut fx);
        assert!(fx.current_closes.is_empty());
        assert_eq!(fx.closed_requests, 1);
        assert_eq!(fx.lost_connections, 1);
    }

    #[test]
    fn lose_connection_while_detached_defers_close_frame() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.write_close(GO_AWAY);
        machine.lose_connection(&mut fx);
        assert_eq!(machine.state(), SessionState::ClosingEmpty);
        assert_eq!(fx.lost_connections, 1);

        machine.attach("r2", &mut fx);
        assert_eq!(fx.late_closes, [("r2", GO_AWAY)]);
        assert_eq!(machine.state(), SessionState::ClosingEmpty);
    }

    #[test]
    fn late_attach_without_stored_reason_writes_nothing() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.lose_connection(&mut fx);
        machine.attach("r2", &mut fx);
        assert!(fx.late_closes.is_empty());
    }

    #[test]
    fn lose_connection_discards_pending_buffer() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.write(vec![json!("a")], &mut fx);
        machine.lose_connection(&mut fx);

        assert_eq!(machine.state(), SessionState::ClosingPending);
        assert!(machine.buffered().is_empty());
        assert_eq!(fx.lost_connections, 1);
    }

    #[test]
    fn lose_connection_is_idempotent() {
        let (mut machine, mut fx) = attached();
        machine.lose_connection(&mut fx);
        machine.lose_connection(&mut fx);
        assert_eq!(fx.lost_connections, 1);
    }

    #[test]
    fn connection_lost_while_attached() {
        let (mut machine, mut fx) = attached();
        machine.connection_lost(DisconnectReason::ConnectionDone, &mut fx);
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert_eq!(fx.dropped_requests, 1);
        assert_eq!(fx.closed_protocols, [DisconnectReason::ConnectionDone]);
    }

    #[test]
    fn connection_lost_with_pending_data_times_out() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.write(vec![json!("x")], &mut fx);
        machine.connection_lost(DisconnectReason::ConnectionDone, &mut fx);

        assert_eq!(machine.state(), SessionState::Disconnected);
        assert_eq!(fx.timed_out, [DisconnectReason::SessionTimeout]);
        assert!(fx.closed_protocols.is_empty());
    }

    #[test]
    fn connection_lost_while_closing_pending_times_out() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.write(vec![json!("x")], &mut fx);
        machine.lose_connection(&mut fx);
        machine.connection_lost(DisconnectReason::ConnectionDone, &mut fx);
        assert_eq!(fx.timed_out, [DisconnectReason::SessionTimeout]);
    }

    #[test]
    fn connection_lost_passes_reason_through() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        let reason = DisconnectReason::ConnectionLost("peer reset".into());
        machine.connection_lost(reason.clone(), &mut fx);
        assert_eq!(fx.closed_protocols, [reason]);
    }

    #[test]
    fn connection_lost_is_idempotent_when_disconnected() {
        let (mut machine, mut fx) = attached();
        machine.connection_lost(DisconnectReason::ConnectionDone, &mut fx);
        machine.connection_lost(DisconnectReason::ConnectionDone, &mut fx);
        assert_eq!(fx.closed_protocols.len(), 1);
    }

    #[test]
    fn receive_ignored_while_closing() {
        let (mut machine, mut fx) = attached();
        machine.detach(&mut fx);
        machine.lose_connection(&mut fx);
        machine.receive(b"ignored", &mut fx).unwrap();
        assert!(fx.received.is_empty());
    }

    #[test]
    fn write_dropped_while_closing() {
        let (mut machine, mut fx) = attached();
        machine.lose_connection(&mut fx);
        machine.write(vec![json!("late")], &mut fx);
        assert!(machine.buffered().is_empty());
        assert!(fx.written.is_empty());
    }

    #[test]
    fn decode_failure_leaves_state_untouched() {
        struct Failing(Recorder);
        impl SessionEffects for Failing {
            type Request = &'static str;
            fn open_request(&mut self, r: &'static str) {
                self.0.open_request(r)
            }
            fn establish_connection(&mut self) {
                self.0.establish_connection()
            }
            fn begin_request(&mut self) {
                self.0.begin_request()
            }
            fn complete_connection(&mut self) {
                self.0.complete_connection()
            }
            fn complete_data_received(&mut self, _data: &[u8]) -> Result<(), InvalidData> {
                Err(InvalidData::BadJson)
            }
            fn complete_write(&mut self, m: &[Value]) {
                self.0.complete_write(m)
            }
            fn flush_buffer(&mut self, m: Vec<Value>) {
                self.0.flush_buffer(m)
            }
            fn complete_heartbeat(&mut self) {
                self.0.complete_heartbeat()
            }
            fn close_request(&mut self) {
                self.0.close_request()
            }
            fn close_duplicate_request(&mut self, r: &'static str, reason: &CloseReason) {
                self.0.close_duplicate_request(r, reason)
            }
            fn write_current_close(&mut self, reason: &CloseReason) {
                self.0.write_current_close(reason)
            }
            fn write_close_reason(&mut self, r: &'static str, reason: &CloseReason) {
                self.0.write_close_reason(r, reason)
            }
            fn complete_lose_connection(&mut self) {
                self.0.complete_lose_connection()
            }
            fn drop_request(&mut self) {
                self.0.drop_request()
            }
            fn close_protocol(&mut self, reason: DisconnectReason) {
                self.0.close_protocol(reason)
            }
            fn timed_out(&mut self, reason: DisconnectReason) {
                self.0.timed_out(reason)
            }
        }

        let mut machine = RequestSessionMachine::new();
        let mut fx = Failing(Recorder::default());
        machine.attach("r1", &mut fx);
        machine.detach(&mut fx);
        machine.write(vec![json!("keep")], &mut fx);

        let err = machine.receive(b"!!!", &mut fx).unwrap_err();
        assert_eq!(err, InvalidData::BadJson);
        assert_eq!(machine.state(), SessionState::NoRequestPending);
        assert_eq!(machine.buffered(), [json!("keep")]);
    }
}
