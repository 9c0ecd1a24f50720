use bytes::Bytes;

/// Size of the streaming prelude that defeats buffering in older
/// intermediaries.
pub const STREAMING_PRELUDE_LEN: usize = 2048;

/// Default streaming window before the session forces a fresh request.
pub const DEFAULT_MAXIMUM_BYTES: usize = 128 * 1024;

/// Write-side rules of the request-based transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// One frame per HTTP request: detach immediately after the open frame
    /// and after every data frame.
    XhrPolling,
    /// Long-lived response: prelude before the open frame, detach once
    /// `maximum_bytes` of data frames have been written.
    XhrStreaming { maximum_bytes: usize },
}

impl TransportKind {
    pub fn streaming() -> Self {
        Self::XhrStreaming {
            maximum_bytes: DEFAULT_MAXIMUM_BYTES,
        }
    }

    /// Prelude emitted once before the open frame, if any. The trailing
    /// newline is appended by the adapter like any other request write.
    pub(crate) fn prelude(&self) -> Option<Bytes> {
        match self {
            Self::XhrPolling => None,
            Self::XhrStreaming { .. } => Some(Bytes::from(vec![b'h'; STREAMING_PRELUDE_LEN])),
        }
    }

    pub(crate) fn detaches_after_each_frame(&self) -> bool {
        matches!(self, Self::XhrPolling)
    }

    pub(crate) fn streaming_window(&self) -> Option<usize> {
        match self {
            Self::XhrPolling => None,
            Self::XhrStreaming { maximum_bytes } => Some(*maximum_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_has_no_prelude() {
        assert!(TransportKind::XhrPolling.prelude().is_none());
        assert!(TransportKind::XhrPolling.detaches_after_each_frame());
        assert_eq!(TransportKind::XhrPolling.streaming_window(), None);
    }

    #[test]
    fn streaming_prelude_is_2048_h_bytes() {
        let prelude = TransportKind::streaming().prelude().unwrap();
        assert_eq!(prelude.len(), STREAMING_PRELUDE_LEN);
        assert!(prelude.iter().all(|&b| b == b'h'));
    }

    #[test]
    fn streaming_defaults() {
        assert_eq!(
            TransportKind::streaming(),
            TransportKind::XhrStreaming {
                maximum_bytes: DEFAULT_MAXIMUM_BYTES
            }
        );
        assert!(!TransportKind::streaming().detaches_after_each_frame());
        assert_eq!(
            TransportKind::streaming().streaming_window(),
            Some(DEFAULT_MAXIMUM_BYTES)
        );
    }
}
