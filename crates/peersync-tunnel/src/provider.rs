use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conn::TunnelConn;
use crate::TunnelError;

/// Queue of connections opened by the remote side.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct ConnectionProvider {
    tx: mpsc::Sender<Arc<TunnelConn>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<TunnelConn>>>>,
    closed: CancellationToken,
}

impl ConnectionProvider {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Hand over a new connection without blocking. Returns `false` and
    /// closes the connection when the queue is full or the provider is closed.
    pub fn provide(&self, conn: Arc<TunnelConn>) -> bool {
        if self.closed.is_cancelled() {
            conn.close();
            return false;
        }
        match self.tx.try_send(conn) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(conn)) | Err(mpsc::error::TrySendError::Closed(conn)) => {
                tracing::warn!("tunnel: accept queue full, dropping conn {}", conn.conn_id());
                conn.close();
                false
            }
        }
    }

    /// Wait for the next connection. Fails with [`TunnelError::ProviderClosed`] after [`close`](Self::close).
    pub async fn accept(&self) -> Result<Arc<TunnelConn>, TunnelError> {
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(TunnelError::ProviderClosed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TunnelError::ProviderClosed),
            conn = rx.recv() => conn.ok_or(TunnelError::ProviderClosed),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn conn(id: i64) -> (Arc<TunnelConn>, mpsc::Receiver<crate::TunnelMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (TunnelConn::new(id, tx, 4, Weak::new()), rx)
    }

    #[tokio::test]
    async fn provide_then_accept() {
        let provider = ConnectionProvider::new(2);
        let (c, _rx) = conn(2);
        assert!(provider.provide(c));
        assert_eq!(provider.accept().await.unwrap().conn_id(), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_and_closes() {
        let provider = ConnectionProvider::new(1);
        let (first, _rx1) = conn(2);
        let (second, mut rx2) = conn(4);
        assert!(provider.provide(first));
        assert!(!provider.provide(second.clone()));
        assert!(second.is_closed());
        assert!(rx2.recv().await.unwrap().close);
    }

    #[tokio::test]
    async fn accept_after_close() {
        let provider = ConnectionProvider::new(1);
        provider.close();
        assert!(matches!(provider.accept().await, Err(TunnelError::ProviderClosed)));
    }
}
