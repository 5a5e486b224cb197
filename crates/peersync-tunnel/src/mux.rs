/// Connection multiplexer over a single physical [`FrameStream`].
///
/// Each side exchanges an ephemeral X25519 key first. Afterwards frames are
/// routed by `conn_id`; a connection that cannot absorb a frame within the
/// head-of-line timeout is closed so the remaining connections keep flowing.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MuxConfig;
use crate::conn::{ConnMap, TunnelConn};
use crate::frame::FrameStream;
use crate::message::{TunnelMessage, HANDSHAKE_CONN_ID, HEARTBEAT_CONN_ID};
use crate::provider::ConnectionProvider;
use crate::seal::{EphemeralKey, Sealer};
use crate::TunnelError;

const OUTBOUND_BUFFER: usize = 64;

/// Which end of the physical stream this multiplexer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the physical stream. Dials odd ids and sends heartbeats.
    Initiator,
    /// Accepted the physical stream. Dials even ids.
    Responder,
}

impl Role {
    fn first_conn_id(self) -> i64 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    /// Whether `conn_id` has the parity of connections opened by this role.
    fn owns(self, conn_id: i64) -> bool {
        (conn_id % 2 == 1) == (self == Role::Initiator)
    }
}

/// Multiplexes [`TunnelConn`]s over one physical stream.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use peersync_tunnel::{memory_pair, Multiplexer, MuxConfig, TunnelMessage};
///
/// # async fn example() -> Result<(), peersync_tunnel::TunnelError> {
/// let (a, b) = memory_pair::<TunnelMessage>(16);
/// let client = Multiplexer::new_initiator(MuxConfig::new());
/// let server = Multiplexer::new_responder(MuxConfig::new());
/// let accepted = server.connection_provider();
///
/// tokio::spawn({ let server = server.clone(); async move { server.run(Arc::new(b)).await } });
/// tokio::spawn({ let client = client.clone(); async move { client.run(Arc::new(a)).await } });
///
/// client.wait_ready().await?;
/// let conn = client.dial()?;
/// conn.write(b"ping").await?;
/// let _incoming = accepted.accept().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    role: Role,
    config: MuxConfig,
    conns: Arc<ConnMap>,
    next_conn_id: AtomicI64,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<TunnelMessage>>>,
    key: EphemeralKey,
    shared_secret: OnceLock<[u8; 32]>,
    sealer: OnceLock<Sealer>,
    provider: parking_lot::Mutex<Option<ConnectionProvider>>,
    running: AtomicBool,
    ready: CancellationToken,
    cancel: CancellationToken,
}

impl Multiplexer {
    pub fn new_initiator(config: MuxConfig) -> Self {
        Self::new(Role::Initiator, config)
    }

    pub fn new_responder(config: MuxConfig) -> Self {
        Self::new(Role::Responder, config)
    }

    pub fn new(role: Role, config: MuxConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Self {
            inner: Arc::new(MuxInner {
                role,
                config,
                conns: Arc::new(parking_lot::Mutex::new(HashMap::new())),
                next_conn_id: AtomicI64::new(role.first_conn_id()),
                outbound_tx,
                outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
                key: EphemeralKey::generate(),
                shared_secret: OnceLock::new(),
                sealer: OnceLock::new(),
                provider: parking_lot::Mutex::new(None),
                running: AtomicBool::new(false),
                ready: CancellationToken::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Route connections opened by the peer to `provider`. Replaces any earlier provider.
    pub fn provide_connections_to(&self, provider: ConnectionProvider) {
        *self.inner.provider.lock() = Some(provider);
    }

    /// Create a provider sized by [`MuxConfig::accept_buffer`] and register it.
    pub fn connection_provider(&self) -> ConnectionProvider {
        let provider = ConnectionProvider::new(self.inner.config.accept_buffer);
        self.provide_connections_to(provider.clone());
        provider
    }

    /// The X25519 shared secret, once the key exchange has completed.
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        self.inner.shared_secret.get().copied()
    }

    /// True while packets are being handled and the key exchange is done.
    pub fn is_ready(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
            && self.inner.ready.is_cancelled()
            && !self.inner.cancel.is_cancelled()
    }

    /// Wait until the key exchange completes or the multiplexer stops.
    pub async fn wait_ready(&self) -> Result<(), TunnelError> {
        tokio::select! {
            biased;
            _ = self.inner.ready.cancelled() => Ok(()),
            _ = self.inner.cancel.cancelled() => Err(TunnelError::NotRunning),
        }
    }

    /// Number of open logical connections.
    pub fn conn_count(&self) -> usize {
        self.inner.conns.lock().len()
    }

    /// Open a new logical connection. Returns as soon as the open frame is queued.
    pub fn dial(&self) -> Result<Arc<TunnelConn>, TunnelError> {
        if !self.inner.running.load(Ordering::Acquire) || self.inner.cancel.is_cancelled() {
            return Err(TunnelError::NotRunning);
        }
        if self.inner.shared_secret.get().is_none() {
            return Err(TunnelError::Handshake("shared secret not established".into()));
        }

        let conn_id = self.inner.next_conn_id.fetch_add(2, Ordering::AcqRel);
        let conn = self.register(conn_id);
        self.inner
            .outbound_tx
            .try_send(TunnelMessage::open(conn_id))
            .map_err(|_| {
                conn.close_local();
                TunnelError::StreamClosed
            })?;
        tracing::debug!("tunnel: dialed conn {conn_id}");
        Ok(conn)
    }

    /// Stop handling packets and close every connection.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Handle packets on `stream` until it ends or [`shutdown`](Self::shutdown) is called.
    ///
    /// The stream is closed on return and every logical connection is closed.
    pub async fn run<S>(&self, stream: Arc<S>) -> Result<(), TunnelError>
    where
        S: FrameStream<TunnelMessage> + 'static,
    {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyRunning);
        }
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .ok_or(TunnelError::AlreadyRunning)?;

        let result = self.handle_packets(stream.clone(), outbound_rx).await;

        self.inner.cancel.cancel();
        self.close_all();
        if let Some(provider) = self.inner.provider.lock().take() {
            provider.close();
        }
        stream.close().await;
        self.inner.running.store(false, Ordering::Release);
        result
    }

    async fn handle_packets<S>(
        &self,
        stream: Arc<S>,
        outbound_rx: mpsc::Receiver<TunnelMessage>,
    ) -> Result<(), TunnelError>
    where
        S: FrameStream<TunnelMessage> + 'static,
    {
        let cancel = self.inner.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = stream.send(TunnelMessage::handshake(self.inner.key.public_bytes())) => sent?,
        }

        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            first = tokio::time::timeout(self.inner.config.handshake_timeout, stream.recv()) => first,
        };
        let first = match first {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Err(TunnelError::Handshake("stream ended before key exchange".into())),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!("tunnel: key exchange timed out");
                return Err(TunnelError::Handshake("timed out waiting for peer key".into()));
            }
        };
        self.complete_key_exchange(&first)?;

        let writer = tokio::spawn(write_loop(
            stream.clone(),
            outbound_rx,
            self.inner.clone(),
        ));
        if self.inner.role == Role::Initiator {
            tokio::spawn(heartbeat_loop(
                self.inner.outbound_tx.clone(),
                self.inner.config.heartbeat_interval,
                cancel.clone(),
            ));
        }

        let result = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                msg = stream.recv() => msg,
            };
            match msg {
                Ok(Some(msg)) => self.dispatch(msg).await,
                Ok(None) => {
                    tracing::debug!("tunnel: physical stream ended");
                    break Ok(());
                }
                Err(e) => {
                    tracing::warn!("tunnel: read failed: {e}");
                    break Err(e);
                }
            }
        };

        cancel.cancel();
        if let Err(e) = writer.await {
            tracing::warn!("tunnel: writer task failed: {e}");
        }
        result
    }

    fn complete_key_exchange(&self, first: &TunnelMessage) -> Result<(), TunnelError> {
        if first.conn_id != HANDSHAKE_CONN_ID {
            return Err(TunnelError::Handshake(format!(
                "expected key exchange, got frame for conn {}",
                first.conn_id
            )));
        }
        let secret = self.inner.key.agree(&first.pubkey_x25519)?;
        if self.inner.config.seal_payloads {
            let _ = self.inner.sealer.set(Sealer::new(&secret)?);
        }
        let _ = self.inner.shared_secret.set(secret);
        self.inner.ready.cancel();
        tracing::debug!("tunnel: key exchange complete ({:?})", self.inner.role);
        Ok(())
    }

    fn register(&self, conn_id: i64) -> Arc<TunnelConn> {
        let conn = TunnelConn::new(
            conn_id,
            self.inner.outbound_tx.clone(),
            self.inner.config.read_buffer,
            Arc::downgrade(&self.inner.conns),
        );
        self.inner.conns.lock().insert(conn_id, conn.clone());
        conn
    }

    async fn dispatch(&self, msg: TunnelMessage) {
        if msg.is_control() {
            match msg.conn_id {
                HEARTBEAT_CONN_ID => tracing::trace!("tunnel: heartbeat"),
                HANDSHAKE_CONN_ID => tracing::warn!("tunnel: ignoring repeated key exchange"),
                other => tracing::debug!("tunnel: ignoring control frame {other}"),
            }
            return;
        }

        let conn_id = msg.conn_id;
        if msg.close {
            let conn = self.inner.conns.lock().remove(&conn_id);
            if let Some(conn) = conn {
                tracing::debug!("tunnel: peer closed conn {conn_id}");
                conn.close_local();
            }
            return;
        }

        let existing = self.inner.conns.lock().get(&conn_id).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                if msg.seqno != 0 {
                    tracing::warn!("tunnel: frame for unknown conn {conn_id} (seqno {}), dropping", msg.seqno);
                    return;
                }
                if self.inner.role.owns(conn_id) {
                    tracing::warn!("tunnel: peer opened conn {conn_id} with our parity, dropping");
                    return;
                }
                let provider = self.inner.provider.lock().clone();
                let Some(provider) = provider else {
                    tracing::warn!("tunnel: no connection provider, dropping conn {conn_id}");
                    return;
                };
                let conn = self.register(conn_id);
                tracing::debug!("tunnel: accepted conn {conn_id}");
                if !provider.provide(conn.clone()) {
                    return;
                }
                conn
            }
        };

        let data = if !msg.sealed.is_empty() {
            let Some(sealer) = self.inner.sealer.get() else {
                tracing::warn!("tunnel: sealed frame on unsealed tunnel, closing conn {conn_id}");
                conn.close();
                return;
            };
            match sealer.open(conn_id, msg.seqno, &msg.sealed) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("tunnel: closing conn {conn_id}: {e}");
                    conn.close();
                    return;
                }
            }
        } else {
            msg.data
        };
        if data.is_empty() {
            return;
        }

        tokio::select! {
            biased;
            _ = conn.closed() => {
                tracing::debug!("tunnel: dropping data for closed conn {conn_id}");
            }
            sent = conn.reads_tx.send(data) => {
                if sent.is_err() {
                    conn.close();
                }
            }
            _ = tokio::time::sleep(self.inner.config.hol_timeout) => {
                tracing::warn!("tunnel: conn {conn_id} did not read within {:?}, closing", self.inner.config.hol_timeout);
                conn.close();
            }
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    fn close_all(&self) {
        let conns: Vec<_> = self.inner.conns.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close_local();
        }
    }
}

async fn write_loop<S>(stream: Arc<S>, mut outbound_rx: mpsc::Receiver<TunnelMessage>, inner: Arc<MuxInner>)
where
    S: FrameStream<TunnelMessage> + 'static,
{
    loop {
        let mut msg = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Some(sealer) = inner.sealer.get() {
            if msg.conn_id > 0 && !msg.data.is_empty() {
                match sealer.seal(msg.conn_id, msg.seqno, &msg.data) {
                    Ok(sealed) => {
                        msg.sealed = sealed;
                        msg.data = bytes::Bytes::new();
                    }
                    Err(e) => {
                        tracing::error!("tunnel: {e}");
                        inner.cancel.cancel();
                        break;
                    }
                }
            }
        }

        let sent = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            sent = stream.send(msg) => sent,
        };
        if let Err(e) = sent {
            tracing::warn!("tunnel: write failed: {e}");
            inner.cancel.cancel();
            break;
        }
    }
}

async fn heartbeat_loop(
    outbound: mpsc::Sender<TunnelMessage>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip first immediate tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = outbound.send(TunnelMessage::heartbeat()) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity() {
        assert!(Role::Initiator.owns(1));
        assert!(Role::Initiator.owns(3));
        assert!(!Role::Initiator.owns(2));
        assert!(Role::Responder.owns(2));
        assert!(!Role::Responder.owns(5));
    }

    #[test]
    fn dial_requires_running() {
        let mux = Multiplexer::new_initiator(MuxConfig::new());
        assert!(matches!(mux.dial(), Err(TunnelError::NotRunning)));
        assert!(mux.shared_secret().is_none());
        assert!(!mux.is_ready());
    }
}
