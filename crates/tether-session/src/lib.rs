//! Session state machines, timers, and transport adapters for carrying a
//! stream-oriented application protocol over browser-compatible HTTP
//! polling, HTTP streaming, and WebSocket transports.
//!
//! The central piece is [`RequestSession`]: a session outlives the HTTP
//! requests that carry it, so the adapter interleaves attach/detach of
//! short-lived requests with buffered writes, heartbeats, close-frame
//! propagation, and inactivity expiry. [`WsSession`] is the simpler
//! always-connected WebSocket counterpart. [`SessionRegistry`] maps session
//! identifiers to live sessions and cleans up on termination.

pub mod heartbeat;
pub mod machine;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod timeout;
pub mod transport;
pub mod ws;

pub use heartbeat::{HeartbeatTimer, DEFAULT_HEARTBEAT_PERIOD};
pub use machine::{RequestSessionMachine, SessionEffects, SessionState};
pub use protocol::{Connection, SockJsProtocol};
pub use registry::{AttachError, SessionRegistry, WriteError};
pub use session::{RequestSession, SessionConfig, SessionRequest};
pub use timeout::{SessionTimeoutTimer, TerminationSignal, DEFAULT_SESSION_TIMEOUT};
pub use transport::{TransportKind, DEFAULT_MAXIMUM_BYTES, STREAMING_PRELUDE_LEN};
pub use ws::{
    MessageKind, WebSocketConfig, WsEffects, WsSession, WsSessionMachine, WsState, WsTransport,
    UNSUPPORTED_DATA,
};
