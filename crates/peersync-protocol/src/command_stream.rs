/// Buffered bridge between a session's handlers and its [`FrameStream`].
///
/// Handlers enqueue outbound items with [`CommandStream::send`] and read
/// inbound items with [`CommandStream::recv`]. [`CommandStream::connect_stream`]
/// owns the physical stream: it spawns the reader, drains the send queue, and
/// returns once the session is terminated.
use std::sync::Arc;
use std::time::Duration;

use peersync_tunnel::FrameStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::SyncStreamItem;
use crate::SyncError;

pub const DEFAULT_SEND_BUFFER: usize = 64;
pub const DEFAULT_SEND_RETRY_TIMEOUT: Duration = Duration::from_millis(100);

const RECV_BUFFER: usize = 1;

pub struct CommandStream {
    send_tx: mpsc::Sender<SyncStreamItem>,
    send_rx: parking_lot::Mutex<Option<mpsc::Receiver<SyncStreamItem>>>,
    recv_tx: mpsc::Sender<SyncStreamItem>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<SyncStreamItem>>,
    terminate_tx: mpsc::Sender<Option<SyncError>>,
    terminate_rx: parking_lot::Mutex<Option<mpsc::Receiver<Option<SyncError>>>>,
    /// Cancelled once `connect_stream` returns.
    closed: CancellationToken,
    retry_timeout: Duration,
}

impl Default for CommandStream {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_BUFFER, DEFAULT_SEND_RETRY_TIMEOUT)
    }
}

impl CommandStream {
    pub fn new(send_buffer: usize, retry_timeout: Duration) -> Self {
        let (send_tx, send_rx) = mpsc::channel(send_buffer.max(1));
        let (recv_tx, recv_rx) = mpsc::channel(RECV_BUFFER);
        let (terminate_tx, terminate_rx) = mpsc::channel(1);
        Self {
            send_tx,
            send_rx: parking_lot::Mutex::new(Some(send_rx)),
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            terminate_tx,
            terminate_rx: parking_lot::Mutex::new(Some(terminate_rx)),
            closed: CancellationToken::new(),
            retry_timeout,
        }
    }

    /// Queue an item. If the queue stays full past the retry timeout the
    /// session is terminated as disconnected.
    pub async fn send(&self, item: SyncStreamItem) {
        if self.closed.is_cancelled() {
            return;
        }
        let item = match self.send_tx.try_send(item) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(item)) => item,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        };
        if self.send_tx.send_timeout(item, self.retry_timeout).await.is_err() {
            tracing::warn!("sync: send queue is full, terminating session");
            self.send_error_and_terminate(Some(SyncError::Disconnected(
                "send channel is full, cannot send item".into(),
            )));
        }
    }

    /// Non-blocking enqueue. Returns `false` when the queue is full.
    pub fn try_send(&self, item: SyncStreamItem) -> bool {
        self.send_tx.try_send(item).is_ok()
    }

    /// Ask the stream to end. `None` ends it cleanly. Only the first request counts.
    pub fn send_error_and_terminate(&self, err: Option<SyncError>) {
        let _ = self.terminate_tx.try_send(err);
    }

    /// Next inbound item, `None` once the stream is closed.
    pub async fn recv(&self) -> Option<SyncStreamItem> {
        let mut rx = self.recv_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub async fn receive_within(&self, timeout: Duration) -> Option<SyncStreamItem> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Pump frames between the queues and `stream` until terminated or cancelled.
    ///
    /// Returns the error the session was terminated with, `Ok(())` for a
    /// clean termination. Queued items are flushed before the stream is closed,
    /// followed by a `Terminate` frame when there is an error to report.
    pub async fn connect_stream<S>(&self, cancel: CancellationToken, stream: Arc<S>) -> Result<(), SyncError>
    where
        S: FrameStream<SyncStreamItem> + ?Sized + 'static,
    {
        let (mut send_rx, mut terminate_rx) = match (self.send_rx.lock().take(), self.terminate_rx.lock().take()) {
            (Some(send_rx), Some(terminate_rx)) => (send_rx, terminate_rx),
            _ => return Err(SyncError::Internal("command stream is already connected".into())),
        };

        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(read_loop(
            stream.clone(),
            self.recv_tx.clone(),
            self.terminate_tx.clone(),
            reader_cancel.clone(),
        ));

        let result = loop {
            tokio::select! {
                biased;
                err = terminate_rx.recv() => {
                    break match err.flatten() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                _ = cancel.cancelled() => break Err(SyncError::Cancelled),
                item = send_rx.recv() => {
                    let Some(item) = item else { break Ok(()) };
                    // a peer that stops reading must not block termination
                    let sent = tokio::select! {
                        biased;
                        err = terminate_rx.recv() => {
                            break match err.flatten() {
                                Some(err) => Err(err),
                                None => Ok(()),
                            };
                        }
                        _ = cancel.cancelled() => break Err(SyncError::Cancelled),
                        sent = stream.send(item) => sent,
                    };
                    if let Err(e) = sent {
                        break Err(SyncError::from(e).context("sending item"));
                    }
                }
            }
        };

        self.closed.cancel();
        reader_cancel.cancel();

        // Flushing gets one retry timeout in total, then the stream is closed regardless.
        let flush = async {
            while let Ok(item) = send_rx.try_recv() {
                if stream.send(item).await.is_err() {
                    return;
                }
            }
            if let Err(err) = &result {
                if !matches!(err, SyncError::Disconnected(_) | SyncError::Cancelled) {
                    let terminate = SyncStreamItem::Terminate {
                        code: err.rpc_code(),
                        message: err.message(),
                    };
                    if let Err(e) = stream.send(terminate).await {
                        tracing::debug!("sync: could not report termination to peer: {e}");
                    }
                }
            }
        };
        if tokio::time::timeout(self.retry_timeout, flush).await.is_err() {
            tracing::debug!("sync: peer is not reading, dropping unsent items");
        }
        stream.close().await;
        let _ = reader.await;
        result
    }
}

async fn read_loop<S>(
    stream: Arc<S>,
    recv_tx: mpsc::Sender<SyncStreamItem>,
    terminate_tx: mpsc::Sender<Option<SyncError>>,
    cancel: CancellationToken,
) where
    S: FrameStream<SyncStreamItem> + ?Sized + 'static,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.recv() => next,
        };
        let item = match next {
            Ok(Some(SyncStreamItem::Terminate { code, message })) => {
                let _ = terminate_tx.try_send(Some(SyncError::from_remote(code, &message)));
                return;
            }
            Ok(Some(item)) => item,
            Ok(None) => {
                let _ = terminate_tx.try_send(Some(SyncError::Disconnected("connection closed by peer".into())));
                return;
            }
            Err(e) => {
                let _ = terminate_tx.try_send(Some(SyncError::from(e).context("receiving item")));
                return;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = recv_tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
