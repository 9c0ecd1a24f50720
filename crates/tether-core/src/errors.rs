/// Rejection of an inbound request body before it reaches a session.
///
/// The variant messages are the exact bodies an HTTP handler is expected to
/// return alongside its error status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidData {
    #[error("Payload expected.")]
    NoPayload,
    #[error("Broken JSON encoding.")]
    BadJson,
}

impl InvalidData {
    /// The byte-exact HTTP error body for this rejection.
    pub fn http_body(&self) -> &'static [u8] {
        match self {
            Self::NoPayload => b"Payload expected.\n",
            Self::BadJson => b"Broken JSON encoding.\n",
        }
    }
}

/// Why a session's wire connection ended.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectReason {
    /// Orderly close.
    #[error("connection closed cleanly")]
    ConnectionDone,
    /// The transport went away abnormally (client hung up, socket error).
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The session sat detached past its inactivity window.
    #[error("session timed out")]
    SessionTimeout,
    /// Anything else the host stack surfaced.
    #[error("session failed: {0}")]
    Failure(String),
}

impl DisconnectReason {
    /// Expected ways for a session to end. Anything else deserves an error
    /// log when it reaches the registry's termination hook.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::ConnectionDone | Self::ConnectionLost(_) | Self::SessionTimeout
        )
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionDone => "connection_done",
            Self::ConnectionLost(_) => "connection_lost",
            Self::SessionTimeout => "session_timeout",
            Self::Failure(_) => "failure",
        }
    }
}

/// Value delivered on a session's single-fire termination signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The session-timeout timer ran out.
    Expired,
    /// The wire connection ended with the given reason.
    Closed(DisconnectReason),
}

/// Misuse of a timer that has already reached a terminal state. Surfaced to
/// the programmer, never to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("cannot schedule a stopped heartbeat")]
    Stopped,
    #[error("cannot restart an expired timeout")]
    Expired,
}
