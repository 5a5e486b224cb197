/// Errors returned by the tunnel layer.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("connection {conn_id} closed")]
    ConnClosed { conn_id: i64 },

    #[error("read deadline exceeded")]
    DeadlineExceeded,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("multiplexer is not handling packets")]
    NotRunning,

    #[error("multiplexer is already handling packets")]
    AlreadyRunning,

    #[error("connection provider closed")]
    ProviderClosed,
}

impl From<rmp_serde::encode::Error> for TunnelError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TunnelError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TunnelError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TunnelError::Deserialization(e.to_string())
    }
}
