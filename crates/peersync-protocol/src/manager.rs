/// Owner of all sync sessions of one instance.
///
/// Accepted streams run in the server role through [`SyncManager::serve`].
/// Known hosts are dialed by one reconnect loop each, started with
/// [`SyncManager::start`] and restarted whenever the local config changes.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use peersync_tunnel::FrameStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error_span, Instrument};

use crate::backoff::ReconnectPolicy;
use crate::config::{ConfigStore, Peer};
use crate::logstore::LogStore;
use crate::messages::SyncStreamItem;
use crate::opid_mapper::OpIdMapper;
use crate::oplog::OpLog;
use crate::peer_state::{ConnectionState, PeerState, PeerStateStore};
use crate::remote_config::RemoteConfigStore;
use crate::session::{run_session, SessionDeps, SessionRegistry, SessionReport, SessionRole};
use crate::{SyncConfig, SyncError};

/// Opens a stream to a known host.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &Peer) -> Result<Arc<dyn FrameStream<SyncStreamItem>>, SyncError>;
}

pub struct SyncManager {
    deps: Arc<SessionDeps>,
    cancel: CancellationToken,
}

impl SyncManager {
    /// Every configured peer starts out as disconnected.
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        oplog: Arc<dyn OpLog>,
        peer_states: Arc<dyn PeerStateStore>,
        remote_configs: Arc<dyn RemoteConfigStore>,
        log_store: Arc<dyn LogStore>,
        settings: SyncConfig,
    ) -> Result<Self, SyncError> {
        let config = config_store.get()?;
        for peer in config
            .multihost
            .known_hosts
            .iter()
            .chain(config.multihost.authorized_clients.iter())
        {
            peer_states.update(&peer.keyid, &peer.instance_id, &mut |state| {
                state.set_connection_state(ConnectionState::Disconnected, "disconnected");
            })?;
        }

        let mapper = Arc::new(OpIdMapper::new(
            oplog.clone(),
            settings.op_cache_size,
            settings.flow_cache_size,
        ));
        Ok(Self {
            deps: Arc::new(SessionDeps {
                config_store,
                oplog,
                mapper,
                peer_states,
                remote_configs,
                log_store,
                settings,
                sessions: SessionRegistry::default(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Run a session on a stream a client opened to us.
    pub async fn serve<S>(&self, stream: S) -> SessionReport
    where
        S: FrameStream<SyncStreamItem> + 'static,
    {
        run_session(
            self.deps.clone(),
            SessionRole::Server,
            Arc::new(stream),
            None,
            None,
            self.cancel.child_token(),
        )
        .instrument(error_span!("sync", role = "server"))
        .await
    }

    /// Run one client session with `peer` on a stream we opened.
    pub async fn connect_to<S>(&self, peer: Peer, stream: S) -> SessionReport
    where
        S: FrameStream<SyncStreamItem> + 'static,
    {
        let span = error_span!("sync", role = "client", peer = %peer.instance_id);
        run_session(
            self.deps.clone(),
            SessionRole::Client,
            Arc::new(stream),
            Some(peer),
            None,
            self.cancel.child_token(),
        )
        .instrument(span)
        .await
    }

    /// Keep a session open with every known host until [`shutdown`](Self::shutdown).
    pub fn start(&self, dialer: Arc<dyn Dialer>) {
        let deps = self.deps.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(supervise(deps, dialer, cancel).instrument(error_span!("sync-manager")));
    }

    /// Fetch a log from a connected peer. It is written to the log store as it arrives.
    pub async fn request_log(&self, keyid: &str, log_id: &str) -> Result<(), SyncError> {
        if log_id.is_empty() {
            return Err(SyncError::Protocol("log id is required".into()));
        }
        let handle = self
            .deps
            .sessions
            .find(keyid)
            .ok_or_else(|| SyncError::Disconnected(format!("no live session with {keyid:?}")))?;
        handle.requested_logs.lock().insert(log_id.to_string());
        handle.cmd.send(SyncStreamItem::GetLog { log_id: log_id.to_string() }).await;
        Ok(())
    }

    /// Ask a connected client to space its connection attempts `delay` apart.
    pub async fn throttle_client(&self, keyid: &str, delay: Duration) -> Result<(), SyncError> {
        let handle = self
            .deps
            .sessions
            .find_role(SessionRole::Server, keyid)
            .ok_or_else(|| SyncError::Disconnected(format!("no live session from client {keyid:?}")))?;
        handle
            .cmd
            .send(SyncStreamItem::Throttle { delay_ms: delay.as_millis() as u64 })
            .await;
        Ok(())
    }

    /// Current state of every known peer, then each change if `subscribe` is set.
    ///
    /// The feed ends when `cancel` fires or the receiver is dropped.
    pub fn peer_sync_states_stream(&self, subscribe: bool, cancel: CancellationToken) -> mpsc::Receiver<PeerState> {
        let (tx, rx) = mpsc::channel(self.deps.settings.state_feed_buffer);
        let peer_states = self.deps.peer_states.clone();
        tokio::spawn(async move {
            // subscribe first so no change is lost between the snapshot and the feed
            let (subscription, mut changes) = peer_states.on_state_changed().subscribe();
            let current = match peer_states.get_all() {
                Ok(current) => current,
                Err(e) => {
                    tracing::warn!("sync: listing peer states: {e}");
                    Vec::new()
                }
            };
            let mut open = true;
            for state in current {
                if tx.send(state).await.is_err() {
                    open = false;
                    break;
                }
            }
            while open && subscribe {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    state = changes.recv() => match state {
                        Some(state) => open = tx.send(state).await.is_ok(),
                        None => break,
                    },
                }
            }
            peer_states.on_state_changed().unsubscribe(subscription);
        });
        rx
    }

    pub fn live_sessions(&self) -> usize {
        self.deps.sessions.len()
    }

    /// Cancel every session and reconnect loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run one reconnect loop per known host, restarting all of them on config change.
async fn supervise(deps: Arc<SessionDeps>, dialer: Arc<dyn Dialer>, cancel: CancellationToken) {
    let (subscription, mut changes) = deps.config_store.on_change().subscribe();
    loop {
        let generation = cancel.child_token();
        let mut loops = JoinSet::new();
        match deps.config_store.get() {
            Ok(config) if config.multihost.identity.is_none() => {
                tracing::info!("sync: no identity configured, not dialing peers");
            }
            Ok(config) => {
                for peer in config.multihost.known_hosts {
                    if peer.instance_id.is_empty() {
                        continue;
                    }
                    let span = error_span!("sync", role = "client", peer = %peer.instance_id);
                    loops.spawn(
                        reconnect_loop(deps.clone(), dialer.clone(), peer, generation.clone()).instrument(span),
                    );
                }
                tracing::debug!("sync: dialing {} known hosts", loops.len());
            }
            Err(e) => tracing::error!("sync: loading config, not dialing peers: {e}"),
        }

        let restart = tokio::select! {
            _ = cancel.cancelled() => false,
            changed = changes.recv() => changed.is_some(),
        };
        generation.cancel();
        while loops.join_next().await.is_some() {}
        if !restart {
            break;
        }
        tracing::info!("sync: config changed, restarting peer connections");
    }
    deps.config_store.on_change().unsubscribe(subscription);
}

async fn reconnect_loop(deps: Arc<SessionDeps>, dialer: Arc<dyn Dialer>, peer: Peer, cancel: CancellationToken) {
    let policy =
        ReconnectPolicy::new(deps.settings.reconnect_delay).with_min_delay(deps.settings.min_reconnect_delay);
    while !cancel.is_cancelled() {
        let started = Instant::now();
        set_state(&deps, &peer, ConnectionState::Pending, "connection pending");

        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = dialer.dial(&peer) => dialed,
        };
        let failed = match dialed {
            Ok(stream) => {
                let report = run_session(
                    deps.clone(),
                    SessionRole::Client,
                    stream,
                    Some(peer.clone()),
                    Some(policy.throttle_handle()),
                    cancel.clone(),
                )
                .await;
                report.result.as_ref().is_err_and(|e| e.state().is_error())
            }
            Err(e) => {
                tracing::warn!("sync: dialing {:?}: {e}", peer.instance_id);
                set_state(&deps, &peer, e.state(), &e.message());
                e.state().is_error()
            }
        };

        let wait = policy.wait_after(started.elapsed());
        if !failed {
            set_state(
                &deps,
                &peer,
                ConnectionState::RetryWait,
                &format!("reconnecting in {}s", wait.as_secs()),
            );
        }
        tracing::debug!("sync: reconnecting to {:?} in {wait:?}", peer.instance_id);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn set_state(deps: &SessionDeps, peer: &Peer, state: ConnectionState, message: &str) {
    if let Err(e) = deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |s| {
        s.set_connection_state(state, message);
    }) {
        tracing::warn!("sync: recording state for {:?}: {e}", peer.instance_id);
    }
}
