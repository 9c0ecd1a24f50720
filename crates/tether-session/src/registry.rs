use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info};

use tether_core::{InvalidData, SessionId, SessionPath, Termination};

use crate::session::{RequestSession, SessionRequest};

/// Why an attach was refused before reaching any session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("invalid session path")]
    InvalidPath,
}

/// Why an inbound body never reached a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("invalid session path")]
    InvalidPath,
    #[error("unknown session")]
    UnknownSession,
    #[error(transparent)]
    Invalid(#[from] InvalidData),
}

/// Maps session identifiers to live sessions.
///
/// Sessions are created on the first request that names an unknown valid
/// sessionID and removed by a termination hook installed at creation. The
/// map is only touched during attach and termination; iteration is not
/// exposed.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, RequestSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Route a request into its session, building the session via `factory`
    /// if the (valid) sessionID is new.
    pub fn attach_to_session<F>(
        &self,
        factory: F,
        path: &str,
        request: Box<dyn SessionRequest>,
    ) -> Result<SessionId, AttachError>
    where
        F: FnOnce(&SessionId) -> RequestSession,
    {
        let parsed = SessionPath::parse(path).ok_or(AttachError::InvalidPath)?;
        let id = parsed.session_id;

        let session = match self.sessions.get(&id) {
            Some(existing) => existing.value().clone(),
            None => {
                let session = factory(&id);
                self.watch_termination(&session);
                let entry = self
                    .sessions
                    .entry(id.clone())
                    .or_insert_with(|| session.clone());
                info!(session_id = %id, transport = %parsed.transport, "session created");
                entry.value().clone()
            }
        };

        session.make_connection_from_request(request);
        Ok(id)
    }

    /// Deliver a request body to an existing session.
    pub fn write_to_session(&self, path: &str, body: &[u8]) -> Result<(), WriteError> {
        let parsed = SessionPath::parse(path).ok_or(WriteError::InvalidPath)?;
        let session = self
            .sessions
            .get(&parsed.session_id)
            .map(|s| s.value().clone())
            .ok_or(WriteError::UnknownSession)?;
        session.data_received(body)?;
        Ok(())
    }

    /// Remove the entry when the session ends. Expected endings (expiry,
    /// orderly or abrupt close, session timeout) are routine; anything else
    /// is logged as an error.
    fn watch_termination(&self, session: &RequestSession) {
        let sessions = Arc::clone(&self.sessions);
        let id = session.id().clone();
        session.on_terminated(move |termination| {
            sessions.remove(&id);
            match termination {
                Termination::Expired => {
                    debug!(session_id = %id, "session expired");
                }
                Termination::Closed(reason) if reason.is_expected() => {
                    debug!(session_id = %id, reason = %reason, "session closed");
                }
                Termination::Closed(reason) => {
                    error!(session_id = %id, reason = %reason, "session terminated unexpectedly");
                }
            }
        });
    }
}
