use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for a [`Multiplexer`](crate::Multiplexer).
///
/// ```rust
/// use std::time::Duration;
/// use peersync_tunnel::MuxConfig;
///
/// let config = MuxConfig::new()
///     .hol_timeout(Duration::from_millis(250))
///     .seal_payloads(true);
/// ```
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Heartbeat period, initiator side only.
    pub(crate) heartbeat_interval: Duration,
    /// Time allowed for the X25519 exchange before the stream is shut down.
    pub(crate) handshake_timeout: Duration,
    /// Longest a single connection may block delivery of the next frame.
    pub(crate) hol_timeout: Duration,
    /// Per-connection inbound channel capacity.
    pub(crate) read_buffer: usize,
    /// Accept queue capacity of a [`ConnectionProvider`](crate::ConnectionProvider).
    pub(crate) accept_buffer: usize,
    /// Encrypt data frames with a key derived from the shared secret.
    pub(crate) seal_payloads: bool,
    pub(crate) max_frame_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxConfig {
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            hol_timeout: Duration::from_millis(100),
            read_buffer: 10,
            accept_buffer: 10,
            seal_payloads: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the heartbeat interval (default: 30s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the key exchange timeout (default: 5s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the head-of-line delivery timeout (default: 100ms).
    pub fn hol_timeout(mut self, timeout: Duration) -> Self {
        self.hol_timeout = timeout;
        self
    }

    /// Set the per-connection read buffer (default: 10 frames).
    pub fn read_buffer(mut self, capacity: usize) -> Self {
        self.read_buffer = capacity.max(1);
        self
    }

    /// Set the accept queue capacity used by [`Multiplexer::connection_provider`](crate::Multiplexer::connection_provider).
    pub fn accept_buffer(mut self, capacity: usize) -> Self {
        self.accept_buffer = capacity.max(1);
        self
    }

    /// Seal data frames with XChaCha20-Poly1305 (default: off).
    pub fn seal_payloads(mut self, enabled: bool) -> Self {
        self.seal_payloads = enabled;
        self
    }

    /// Set the maximum physical frame size (default: 16 MiB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MuxConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.hol_timeout, Duration::from_millis(100));
        assert_eq!(config.read_buffer, 10);
        assert!(!config.seal_payloads);
    }

    #[test]
    fn read_buffer_never_zero() {
        assert_eq!(MuxConfig::new().read_buffer(0).read_buffer, 1);
    }
}
