use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque session identifier. Clients mint their own; `new()` exists for
/// server-assigned sessions and tests.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("sess_{}", Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated session endpoint path: `/<serverID>/<sessionID>/<transport>`.
///
/// All three segments must be non-empty and none may contain a `.` — dotted
/// segments would let a crafted URL escape into sibling resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPath {
    pub server_id: String,
    pub session_id: SessionId,
    pub transport: String,
}

impl SessionPath {
    pub fn parse(path: &str) -> Option<Self> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut segments = trimmed.split('/');
        let server_id = segments.next()?;
        let session_id = segments.next()?;
        let transport = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        for segment in [server_id, session_id, transport] {
            if segment.is_empty() || segment.contains('.') {
                return None;
            }
        }
        Some(Self {
            server_id: server_id.to_owned(),
            session_id: SessionId::from_raw(session_id),
            transport: transport.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = SessionId::from_raw("abc123");
        assert_eq!(id.as_str(), "abc123");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = SessionId::from_raw("s1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s1\"");
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_valid_path() {
        let path = SessionPath::parse("/server/session/xhr").unwrap();
        assert_eq!(path.server_id, "server");
        assert_eq!(path.session_id, SessionId::from_raw("session"));
        assert_eq!(path.transport, "xhr");
    }

    #[test]
    fn parse_without_leading_slash() {
        assert!(SessionPath::parse("a/b/c").is_some());
    }

    #[test]
    fn parse_rejects_missing_segments() {
        assert!(SessionPath::parse("").is_none());
        assert!(SessionPath::parse("/only").is_none());
        assert!(SessionPath::parse("/one/two").is_none());
        assert!(SessionPath::parse("/a/b/c/d").is_none());
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(SessionPath::parse("///").is_none());
        assert!(SessionPath::parse("/server//xhr").is_none());
    }

    #[test]
    fn parse_rejects_dotted_segments() {
        assert!(SessionPath::parse("/server/session/has.dot").is_none());
        assert!(SessionPath::parse("/ser.ver/session/xhr").is_none());
        assert!(SessionPath::parse("/server/se.ssion/xhr").is_none());
    }
}
