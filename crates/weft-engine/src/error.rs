use crate::PeerId;

/// Errors from parsing a canonical identity string.
///
/// Parsing is all-or-nothing: any mismatch yields an error, never a
/// partially decoded endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity string must be {expected} characters, got {got}")]
    Length { expected: usize, got: usize },

    #[error("identity string is not valid hex")]
    Hex,

    #[error("identity checksum mismatch")]
    Checksum,
}

/// Errors reported by an [`Engine`](crate::Engine) implementation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no peer with id {0}")]
    PeerNotFound(PeerId),

    #[error("peer {0} is offline")]
    PeerOffline(PeerId),

    #[error("peer already added")]
    AlreadyPeer,

    #[error("message of {len} bytes exceeds engine ceiling of {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("message payload is empty")]
    MessageEmpty,

    #[error("engine failure: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_error_display() {
        let err = IdentityError::Length {
            expected: 76,
            got: 4,
        };
        assert_eq!(err.to_string(), "identity string must be 76 characters, got 4");
        assert_eq!(IdentityError::Checksum.to_string(), "identity checksum mismatch");
    }

    #[test]
    fn engine_error_display() {
        assert_eq!(EngineError::PeerNotFound(7).to_string(), "no peer with id 7");
        assert_eq!(
            EngineError::MessageTooLong { len: 2000, max: 1372 }.to_string(),
            "message of 2000 bytes exceeds engine ceiling of 1372"
        );
    }
}
