/// Error types for the protocol layer.
///
/// [`AuthError`] covers signing and peer verification, [`StoreError`] the
/// collaborator stores, and [`SyncError`] classifies why a sync session ended.
use peersync_tunnel::TunnelError;

use crate::peer_state::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("payload must not be empty")]
    EmptyPayload,

    #[error("signed message signature must not be empty")]
    EmptySignature,

    #[error("signed message key id must not be empty")]
    EmptyKeyId,

    #[error("public key id mismatch: expected {expected}, got {got}")]
    KeyIdMismatch { expected: String, got: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("signature is too old, max age is {max_age_secs}s. Is the clock out of sync?")]
    SignatureTooOld { max_age_secs: u64 },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("authorization token is too large: {size} bytes (max {max})")]
    TokenTooLarge { size: usize, max: usize },

    #[error("invalid authorization header: {0}")]
    InvalidHeader(String),

    #[error("missing authorization header")]
    MissingHeader,

    #[error("config missing multihost identity")]
    MissingIdentity,

    #[error("peer key {keyid:?} is not listed")]
    UnknownPeer { keyid: String },

    #[error("instance id mismatch: expected {expected:?}, got {got:?}")]
    InstanceIdMismatch { expected: String, got: String },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersion { expected: u32, got: u32 },

    #[error("handshake packet must be sent first")]
    MissingHandshake,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no results")]
    NoResults,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Status code reported to the remote side when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RpcCode {
    PermissionDenied,
    InvalidArgument,
    Unimplemented,
    Internal,
}

/// Why a sync session ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Peer state recorded for a session that ended with this error.
    pub fn state(&self) -> ConnectionState {
        match self {
            SyncError::Auth(_) => ConnectionState::ErrorAuth,
            SyncError::Protocol(_) | SyncError::Unimplemented(_) => ConnectionState::ErrorProtocol,
            SyncError::Internal(_) => ConnectionState::ErrorInternal,
            SyncError::Disconnected(_) | SyncError::Cancelled => ConnectionState::Disconnected,
        }
    }

    pub fn rpc_code(&self) -> RpcCode {
        match self {
            SyncError::Auth(_) => RpcCode::PermissionDenied,
            SyncError::Protocol(_) => RpcCode::InvalidArgument,
            SyncError::Unimplemented(_) => RpcCode::Unimplemented,
            _ => RpcCode::Internal,
        }
    }

    /// Prefix the message with `context`, keeping the classification.
    pub fn context(self, context: &str) -> Self {
        match self {
            SyncError::Auth(m) => SyncError::Auth(format!("{context}: {m}")),
            SyncError::Protocol(m) => SyncError::Protocol(format!("{context}: {m}")),
            SyncError::Internal(m) => SyncError::Internal(format!("{context}: {m}")),
            SyncError::Disconnected(m) => SyncError::Disconnected(format!("{context}: {m}")),
            SyncError::Unimplemented(m) => SyncError::Unimplemented(format!("{context}: {m}")),
            SyncError::Cancelled => SyncError::Cancelled,
        }
    }

    /// Rebuild an error reported by the remote side with [`RpcCode`].
    pub fn from_remote(code: RpcCode, message: &str) -> Self {
        let message = format!("peer: {message}");
        match code {
            RpcCode::PermissionDenied => SyncError::Auth(message),
            RpcCode::InvalidArgument => SyncError::Protocol(message),
            RpcCode::Unimplemented => SyncError::Unimplemented(message),
            RpcCode::Internal => SyncError::Internal(message),
        }
    }

    /// The message without the classification prefix.
    pub fn message(&self) -> String {
        match self {
            SyncError::Auth(m)
            | SyncError::Protocol(m)
            | SyncError::Internal(m)
            | SyncError::Disconnected(m)
            | SyncError::Unimplemented(m) => m.clone(),
            SyncError::Cancelled => "cancelled".into(),
        }
    }
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        SyncError::Auth(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Internal(e.to_string())
    }
}

impl From<TunnelError> for SyncError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::FrameTooLarge { .. } | TunnelError::Deserialization(_) => {
                SyncError::Protocol(e.to_string())
            }
            TunnelError::Serialization(_) | TunnelError::Crypto(_) => SyncError::Internal(e.to_string()),
            _ => SyncError::Disconnected(e.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Internal(format!("serialization error: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Protocol(format!("deserialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_unknown_peer() {
        let err = AuthError::UnknownPeer {
            keyid: "ed25519.abc".into(),
        };
        assert_eq!(err.to_string(), "peer key \"ed25519.abc\" is not listed");
    }

    #[test]
    fn test_display_token_too_large() {
        let err = AuthError::TokenTooLarge { size: 600, max: 512 };
        assert_eq!(err.to_string(), "authorization token is too large: 600 bytes (max 512)");
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(SyncError::Auth("x".into()).rpc_code(), RpcCode::PermissionDenied);
        assert_eq!(SyncError::Protocol("x".into()).rpc_code(), RpcCode::InvalidArgument);
        assert_eq!(SyncError::Unimplemented("x".into()).rpc_code(), RpcCode::Unimplemented);
        assert_eq!(SyncError::Disconnected("x".into()).rpc_code(), RpcCode::Internal);
    }

    #[test]
    fn test_states() {
        assert_eq!(SyncError::Auth("x".into()).state(), ConnectionState::ErrorAuth);
        assert_eq!(SyncError::Internal("x".into()).state(), ConnectionState::ErrorInternal);
        assert_eq!(SyncError::Cancelled.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = SyncError::Auth("bad key".into()).context("handling diff operations");
        assert_eq!(err, SyncError::Auth("handling diff operations: bad key".into()));
        assert_eq!(err.message(), "handling diff operations: bad key");
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = SyncError::from_remote(RpcCode::PermissionDenied, "no access to repo");
        assert_eq!(err, SyncError::Auth("peer: no access to repo".into()));
        assert_eq!(err.rpc_code(), RpcCode::PermissionDenied);
    }

    #[test]
    fn test_auth_converts_to_auth() {
        let err: SyncError = AuthError::InvalidSignature.into();
        assert_eq!(err.rpc_code(), RpcCode::PermissionDenied);
    }
}
