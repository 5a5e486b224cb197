use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::message::TunnelMessage;
use crate::TunnelError;

/// Largest payload carried by a single data frame. Longer writes are split.
pub const MAX_WRITE_CHUNK: usize = 32 * 1024;

/// Live connections of one multiplexer, keyed by conn id.
pub(crate) type ConnMap = parking_lot::Mutex<HashMap<i64, Arc<TunnelConn>>>;

/// A logical byte-stream connection carried inside a tunnel.
///
/// Obtained from [`Multiplexer::dial`](crate::Multiplexer::dial) or
/// [`ConnectionProvider::accept`](crate::ConnectionProvider::accept).
pub struct TunnelConn {
    conn_id: i64,
    outbound: mpsc::Sender<TunnelMessage>,
    pub(crate) reads_tx: mpsc::Sender<Bytes>,
    read_state: tokio::sync::Mutex<ReadState>,
    /// Next data seqno. Held across the outbound send so frames leave in seqno order.
    write_seqno: tokio::sync::Mutex<i64>,
    deadline: watch::Sender<Option<Instant>>,
    closed: AtomicBool,
    closed_signal: CancellationToken,
    registry: Weak<ConnMap>,
}

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("conn_id", &self.conn_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TunnelConn {
    pub(crate) fn new(
        conn_id: i64,
        outbound: mpsc::Sender<TunnelMessage>,
        read_buffer: usize,
        registry: Weak<ConnMap>,
    ) -> Arc<Self> {
        let (reads_tx, rx) = mpsc::channel(read_buffer);
        let (deadline, _) = watch::channel(None);
        Arc::new(Self {
            conn_id,
            outbound,
            reads_tx,
            read_state: tokio::sync::Mutex::new(ReadState {
                rx,
                leftover: Bytes::new(),
            }),
            write_seqno: tokio::sync::Mutex::new(0),
            deadline,
            closed: AtomicBool::new(false),
            closed_signal: CancellationToken::new(),
            registry,
        })
    }

    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.closed_signal.cancelled().await
    }

    /// Read into `buf`. Returns `Ok(0)` once the connection is closed and
    /// every delivered byte has been consumed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.read_state.lock().await;
        if !state.leftover.is_empty() {
            return Ok(copy_out(&mut state.leftover, buf));
        }

        let mut deadline_rx = self.deadline.subscribe();
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                item = state.rx.recv() => {
                    return match item {
                        Some(mut data) => {
                            let n = copy_out(&mut data, buf);
                            state.leftover = data;
                            Ok(n)
                        }
                        None => Ok(0),
                    };
                }
                _ = self.closed_signal.cancelled() => {
                    // Frames queued before the close are still readable.
                    return match state.rx.try_recv() {
                        Ok(mut data) => {
                            let n = copy_out(&mut data, buf);
                            state.leftover = data;
                            Ok(n)
                        }
                        Err(_) => Ok(0),
                    };
                }
                _ = expiry => return Err(TunnelError::DeadlineExceeded),
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return Ok(0);
                    }
                }
            }
        }
    }

    /// Fill `buf` completely. Returns `Ok(false)` if the connection closed
    /// before any byte was read.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<bool, TunnelError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(TunnelError::ConnClosed {
                    conn_id: self.conn_id,
                });
            }
            filled += n;
        }
        Ok(true)
    }

    /// Write all of `data`, split into frames of at most [`MAX_WRITE_CHUNK`].
    pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        let mut seqno = self.write_seqno.lock().await;
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            if self.is_closed() {
                return Err(TunnelError::ConnClosed {
                    conn_id: self.conn_id,
                });
            }
            *seqno += 1;
            let msg = TunnelMessage::data(self.conn_id, *seqno, Bytes::copy_from_slice(chunk));
            self.outbound
                .send(msg)
                .await
                .map_err(|_| TunnelError::StreamClosed)?;
        }
        Ok(data.len())
    }

    /// Set or clear the deadline for pending and future reads.
    ///
    /// A read blocked at the time of the call observes the new deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    /// Close the connection and tell the peer. Only the first call has an effect.
    pub fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        if let Err(e) = self.outbound.try_send(TunnelMessage::close(self.conn_id)) {
            tracing::debug!("tunnel: close frame for conn {} not sent: {e}", self.conn_id);
        }
    }

    /// Close without notifying the peer, used when the peer closed first or
    /// the whole tunnel is going away.
    pub(crate) fn close_local(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed_signal.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.conn_id);
        }
        true
    }
}

fn copy_out(src: &mut Bytes, dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    src.advance(n);
    n
}
