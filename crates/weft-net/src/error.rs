use std::io;

use weft_engine::{Endpoint, EngineError, IdentityError};

/// Errors returned by the weft transport layer.
///
/// Every variant names the operation that failed (`op`) and carries the
/// address and underlying cause where one exists, so callers can either
/// inspect the chain generically via [`std::error::Error::source`] or match
/// on the specific kind. [`NetError::Timeout`] and [`NetError::PartialWrite`]
/// are recoverable (retry, or retry the remainder); the `Closed` variants
/// are terminal.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("{op}: peer {endpoint} not known to the engine")]
    PeerNotFound {
        op: &'static str,
        endpoint: Endpoint,
    },

    #[error("{op}: peer is offline")]
    PeerOffline { op: &'static str },

    #[error("{op}: connection closed")]
    ConnectionClosed { op: &'static str },

    #[error("{op}: listener closed")]
    ListenerClosed { op: &'static str },

    #[error("{op}: deadline exceeded")]
    Timeout { op: &'static str },

    #[error("{op}: outbound queue full")]
    BufferFull { op: &'static str },

    #[error("{op}: no encryption key for {addr}")]
    NoEncryptionKey { op: &'static str, addr: String },

    /// A chunked write failed part-way; `sent` bytes were transmitted.
    #[error("{op}: wrote {sent} bytes, then: {source}")]
    PartialWrite {
        op: &'static str,
        sent: usize,
        #[source]
        source: Box<NetError>,
    },

    #[error("{op}: {source}")]
    Engine {
        op: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op}: {reason}")]
    Crypto { op: &'static str, reason: String },
}

impl NetError {
    /// Whether this error is a deadline expiry (possibly inside a partial write).
    pub fn is_timeout(&self) -> bool {
        match self {
            NetError::Timeout { .. } => true,
            NetError::PartialWrite { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether this error means the object can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionClosed { .. } | NetError::ListenerClosed { .. }
        )
    }

    /// Bytes actually transmitted before the failure (zero unless partial).
    pub fn bytes_sent(&self) -> usize {
        match self {
            NetError::PartialWrite { sent, .. } => *sent,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_carries_operation() {
        let err = NetError::Timeout { op: "read" };
        assert_eq!(err.to_string(), "read: deadline exceeded");

        let err = NetError::NoEncryptionKey {
            op: "send_to",
            addr: ":9000".into(),
        };
        assert_eq!(err.to_string(), "send_to: no encryption key for :9000");
    }

    #[test]
    fn partial_write_chains_cause() {
        let err = NetError::PartialWrite {
            op: "write",
            sent: 2600,
            source: Box::new(NetError::Timeout { op: "write" }),
        };
        assert!(err.is_timeout());
        assert_eq!(err.bytes_sent(), 2600);
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "write: wrote 2600 bytes, then: write: deadline exceeded"
        );
    }

    #[test]
    fn closed_predicates() {
        assert!(NetError::ConnectionClosed { op: "read" }.is_closed());
        assert!(NetError::ListenerClosed { op: "accept" }.is_closed());
        assert!(!NetError::Timeout { op: "read" }.is_closed());
        assert!(!NetError::BufferFull { op: "write" }.is_timeout());
    }

    #[test]
    fn identity_errors_convert() {
        let parse_err = "not an identity".parse::<Endpoint>().unwrap_err();
        let err: NetError = parse_err.into();
        assert!(matches!(err, NetError::InvalidIdentity(_)));
    }

    #[test]
    fn engine_cause_is_exposed() {
        let err = NetError::Engine {
            op: "write",
            source: EngineError::PeerOffline(3),
        };
        assert_eq!(err.to_string(), "write: peer 3 is offline");
        assert!(err.source().is_some());
    }
}
