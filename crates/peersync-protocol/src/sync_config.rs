use std::time::Duration;

use peersync_tunnel::DEFAULT_MAX_FRAME_SIZE;

/// Runtime knobs for sync sessions and the [`SyncManager`](crate::SyncManager).
///
/// ```rust
/// use std::time::Duration;
/// use peersync_protocol::SyncConfig;
///
/// let config = SyncConfig::new()
///     .heartbeat_interval(Duration::from_secs(10))
///     .reconnect_delay(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) heartbeat_interval: Duration,
    /// How long to wait for the peer's handshake.
    pub(crate) handshake_timeout: Duration,
    /// Client side: minimum spacing between connection attempts.
    pub(crate) reconnect_delay: Duration,
    /// Floor under any delay, including a server's throttle request.
    pub(crate) min_reconnect_delay: Duration,
    pub(crate) send_buffer: usize,
    /// How long a full send buffer may block before the session is dropped.
    pub(crate) send_retry_timeout: Duration,
    pub(crate) op_cache_size: usize,
    pub(crate) flow_cache_size: usize,
    pub(crate) log_chunk_size: usize,
    pub(crate) max_active_logs: usize,
    pub(crate) op_batch_size: usize,
    pub(crate) max_frame_size: usize,
    pub(crate) state_feed_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfig {
    /// Create a config with defaults.
    ///
    /// `PEERSYNC_HEARTBEAT_SECS` overrides the heartbeat interval when set.
    pub fn new() -> Self {
        let heartbeat_interval = std::env::var("PEERSYNC_HEARTBEAT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Self {
            heartbeat_interval,
            handshake_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(60),
            min_reconnect_delay: Duration::from_secs(1),
            send_buffer: 64,
            send_retry_timeout: Duration::from_millis(100),
            op_cache_size: 16 * 1024,
            flow_cache_size: 4 * 1024,
            log_chunk_size: 32 * 1024,
            max_active_logs: 16,
            op_batch_size: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            state_feed_buffer: 10,
        }
    }

    /// Set the heartbeat interval (default: 60s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the handshake timeout (default: 15s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the client reconnect delay (default: 60s).
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the shortest wait between connection attempts (default: 1s).
    pub fn min_reconnect_delay(mut self, delay: Duration) -> Self {
        self.min_reconnect_delay = delay;
        self
    }

    /// Set the outbound item buffer (default: 64).
    pub fn send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity.max(1);
        self
    }

    /// Set the send retry timeout (default: 100ms).
    pub fn send_retry_timeout(mut self, timeout: Duration) -> Self {
        self.send_retry_timeout = timeout;
        self
    }

    /// Set the id translation cache sizes (default: 16384 ops, 4096 flows).
    pub fn id_cache_sizes(mut self, ops: usize, flows: usize) -> Self {
        self.op_cache_size = ops;
        self.flow_cache_size = flows;
        self
    }

    /// Set the log upload chunk size (default: 32 KiB).
    pub fn log_chunk_size(mut self, bytes: usize) -> Self {
        self.log_chunk_size = bytes.max(1);
        self
    }

    /// Set the operation batch size for diff replies (default: 256).
    pub fn op_batch_size(mut self, ops: usize) -> Self {
        self.op_batch_size = ops.max(1);
        self
    }

    /// Set the maximum frame size on the wire (default: 16 MiB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }
}
