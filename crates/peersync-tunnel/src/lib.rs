//! peersync tunnel layer.
//!
//! Carries many independent byte-stream connections over one ordered duplex
//! stream, plus the length-prefixed MessagePack framing used by every
//! peersync wire protocol.
//!
//! # Layers
//!
//! - [`FrameStream`]: typed frames over any `AsyncRead`/`AsyncWrite` pair
//!   ([`FramedStream`]) or in memory ([`memory_pair`]).
//! - [`Multiplexer`]: X25519 key exchange, then routing of [`TunnelMessage`]s
//!   to [`TunnelConn`]s with head-of-line protection.
//! - [`ConnFramed`]: a [`FrameStream`] riding inside a single [`TunnelConn`].

mod config;
mod conn;
mod conn_framed;
mod error;
mod frame;
mod message;
mod mux;
mod provider;
mod seal;

pub use config::MuxConfig;
pub use conn::{TunnelConn, MAX_WRITE_CHUNK};
pub use conn_framed::ConnFramed;
pub use error::TunnelError;
pub use frame::{
    framed_duplex, memory_pair, read_framed, write_framed, FrameStream, FramedStream,
    MemoryStream, DEFAULT_MAX_FRAME_SIZE,
};
pub use message::{TunnelMessage, HANDSHAKE_CONN_ID, HEARTBEAT_CONN_ID};
pub use mux::{Multiplexer, Role};
pub use provider::ConnectionProvider;
