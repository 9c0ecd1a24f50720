//! Transport-independent pieces of the SockJS server core: wire frames,
//! the JSON codec, session identifiers, and the error hierarchy.

pub mod codec;
pub mod errors;
pub mod frames;
pub mod ids;

pub use codec::{DecodeHook, EncodeHook, JsonCodec};
pub use errors::{DisconnectReason, InvalidData, Termination, TimerError};
pub use frames::{CloseReason, Frame, GO_AWAY, STILL_OPEN};
pub use ids::{SessionId, SessionPath};
