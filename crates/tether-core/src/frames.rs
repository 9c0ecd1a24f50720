use std::borrow::Cow;

use bytes::Bytes;
use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_json::Value;

use crate::codec::JsonCodec;

/// A close reason as it appears on the wire: `[code,"reason"]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub text: Cow<'static, str>,
}

/// Generic orderly-shutdown reason.
pub const GO_AWAY: CloseReason = CloseReason {
    code: 3000,
    text: Cow::Borrowed("Go away!"),
};

/// Sent to a duplicate request while another is still attached.
pub const STILL_OPEN: CloseReason = CloseReason {
    code: 2010,
    text: Cow::Borrowed("Another connection still open"),
};

impl Serialize for CloseReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.code)?;
        tuple.serialize_element(&self.text)?;
        tuple.end()
    }
}

/// One SockJS frame. Encoding produces the frame bytes only; the trailing
/// newline on request-based transports is the transport's concern.
#[derive(Clone, Debug)]
pub enum Frame<'a> {
    Open,
    Heartbeat,
    Data(&'a [Value]),
    Close(&'a CloseReason),
}

impl Frame<'_> {
    pub fn encode(&self, codec: &JsonCodec) -> Bytes {
        match self {
            Frame::Open => Bytes::from_static(b"o"),
            Frame::Heartbeat => Bytes::from_static(b"h"),
            Frame::Data(messages) => {
                let mut out = Vec::with_capacity(64);
                out.push(b'a');
                out.extend_from_slice(&codec.encode_messages(messages));
                Bytes::from(out)
            }
            Frame::Close(reason) => {
                let value = serde_json::to_value(reason)
                    .expect("close reason serialization is infallible");
                let mut out = Vec::with_capacity(32);
                out.push(b'c');
                out.extend_from_slice(&codec.encode(&value));
                Bytes::from(out)
            }
        }
    }
}
