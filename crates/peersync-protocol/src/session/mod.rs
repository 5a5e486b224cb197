/// One sync session over a [`FrameStream`], in either role.
///
/// The server role is taken by the side that accepted the stream and the
/// client role by the side that dialed. After the in-stream handshake both
/// sides behave the same: each announces what the peer may see, forwards its
/// own operations, and stores what the peer forwards. Only a few items are
/// directional (operations, config and resources are tagged by sender, and
/// throttling flows from server to client).
mod diff;
mod forward;
mod handlers;
mod logs;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use peersync_tunnel::FrameStream;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::backoff::ThrottleHandle;
use crate::command_stream::CommandStream;
use crate::config::{Config, ConfigStore, Peer, RemoteConfig};
use crate::identity::{now_millis, PrivateKey};
use crate::logstore::LogStore;
use crate::messages::{
    ConfigUpdate, OperationEvent, PlanMetadata, RepoMetadata, ResourceList, SyncStreamItem,
};
use crate::opid_mapper::OpIdMapper;
use crate::oplog::{OpLog, Query};
use crate::peer_state::{ConnectionState, PeerStateStore};
use crate::permissions::{PermissionSet, PERMS_CAN_VIEW_CONFIGURATION, PERMS_CAN_VIEW_RESOURCES};
use crate::remote_config::RemoteConfigStore;
use crate::{AuthError, SyncConfig, SyncError};

use self::forward::{AnnouncedResources, Forwarder, SharedResources};
use self::logs::{IncomingLogs, RequestedLogs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Accepted the stream. Peers come from `authorized_clients`.
    Server,
    /// Dialed the stream. Peers come from `known_hosts`.
    Client,
}

impl SessionRole {
    pub(crate) fn operations_item(self, event: OperationEvent) -> SyncStreamItem {
        match self {
            SessionRole::Server => SyncStreamItem::ReceiveOperations(event),
            SessionRole::Client => SyncStreamItem::SendOperations(event),
        }
    }

    fn config_item(self, update: ConfigUpdate) -> SyncStreamItem {
        match self {
            SessionRole::Server => SyncStreamItem::ReceiveConfig(update),
            SessionRole::Client => SyncStreamItem::SendConfig(update),
        }
    }

    fn resources_item(self, resources: ResourceList) -> SyncStreamItem {
        match self {
            SessionRole::Server => SyncStreamItem::ReceiveResources(resources),
            SessionRole::Client => SyncStreamItem::ListResources(resources),
        }
    }

    fn peers(self, config: &Config) -> &[Peer] {
        match self {
            SessionRole::Server => &config.multihost.authorized_clients,
            SessionRole::Client => &config.multihost.known_hosts,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Server => write!(f, "server"),
            SessionRole::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Authenticating,
    Established,
    Closed,
}

/// Local config and identity a session starts from.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) config: Config,
    pub(crate) key: PrivateKey,
}

impl Snapshot {
    pub(crate) fn new(config: Config) -> Result<Self, SyncError> {
        let identity = config
            .multihost
            .identity
            .as_ref()
            .ok_or_else(|| SyncError::Internal(AuthError::MissingIdentity.to_string()))?;
        let key = PrivateKey::from_config(identity)
            .map_err(|e| SyncError::Internal(format!("loading identity: {e}")))?;
        Ok(Self { config, key })
    }
}

/// What the manager can reach on a live session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) cmd: Arc<CommandStream>,
    pub(crate) requested_logs: RequestedLogs,
}

/// Live sessions by role and peer key id.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: parking_lot::Mutex<HashMap<(SessionRole, String), SessionHandle>>,
}

impl SessionRegistry {
    /// Returns `false` if a server session for the key is already live.
    fn register(&self, role: SessionRole, keyid: &str, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.lock();
        let key = (role, keyid.to_string());
        if role == SessionRole::Server && sessions.contains_key(&key) {
            return false;
        }
        sessions.insert(key, handle);
        true
    }

    fn unregister(&self, role: SessionRole, keyid: &str, cmd: &Arc<CommandStream>) {
        let mut sessions = self.sessions.lock();
        let key = (role, keyid.to_string());
        if sessions.get(&key).is_some_and(|h| Arc::ptr_eq(&h.cmd, cmd)) {
            sessions.remove(&key);
        }
    }

    pub(crate) fn find_role(&self, role: SessionRole, keyid: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(&(role, keyid.to_string())).cloned()
    }

    /// Any live session with the peer, preferring the one we dialed.
    pub(crate) fn find(&self, keyid: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock();
        [SessionRole::Client, SessionRole::Server]
            .into_iter()
            .find_map(|role| sessions.get(&(role, keyid.to_string())).cloned())
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Collaborators shared by every session of a manager.
pub(crate) struct SessionDeps {
    pub(crate) config_store: Arc<dyn ConfigStore>,
    pub(crate) oplog: Arc<dyn OpLog>,
    pub(crate) mapper: Arc<OpIdMapper>,
    pub(crate) peer_states: Arc<dyn PeerStateStore>,
    pub(crate) remote_configs: Arc<dyn RemoteConfigStore>,
    pub(crate) log_store: Arc<dyn LogStore>,
    pub(crate) settings: SyncConfig,
    pub(crate) sessions: SessionRegistry,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    /// The authenticated peer, if the handshake got that far.
    pub peer: Option<Peer>,
    /// Furthest phase reached before closing.
    pub phase: SessionPhase,
    pub result: Result<(), SyncError>,
}

/// Run a session to completion. Never panics on peer input; every failure
/// ends up in the report and in the peer's recorded state.
pub(crate) async fn run_session(
    deps: Arc<SessionDeps>,
    role: SessionRole,
    stream: Arc<dyn FrameStream<SyncStreamItem>>,
    expected_peer: Option<Peer>,
    throttle: Option<ThrottleHandle>,
    cancel: CancellationToken,
) -> SessionReport {
    let snapshot = match deps.config_store.get().map_err(SyncError::from).and_then(Snapshot::new) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!("sync: cannot start {role} session: {e}");
            stream.close().await;
            return SessionReport {
                peer: None,
                phase: SessionPhase::Connecting,
                result: Err(e),
            };
        }
    };

    let settings = &deps.settings;
    let cmd = Arc::new(CommandStream::new(settings.send_buffer, settings.send_retry_timeout));
    let requested_logs = RequestedLogs::default();
    let mut session = Session {
        incoming_logs: IncomingLogs::new(requested_logs.clone(), settings.max_active_logs),
        requested_logs,
        deps: deps.clone(),
        role,
        snapshot,
        cmd: cmd.clone(),
        cancel: cancel.child_token(),
        expected_peer,
        throttle,
        phase: SessionPhase::Connecting,
        peer: None,
        peer_resources: SharedResources::default(),
        offered: AnnouncedResources::default(),
        registered: false,
        duplicate: false,
    };

    let session_cancel = session.cancel.clone();
    let (result, ()) = tokio::join!(cmd.connect_stream(session_cancel.clone(), stream), async {
        let outcome = session.run_sync().await;
        cmd.send_error_and_terminate(outcome.err());
    });
    session_cancel.cancel();

    let reached = session.phase;
    session.on_session_end(&result);
    SessionReport {
        peer: session.peer.clone(),
        phase: reached,
        result,
    }
}

struct Session {
    deps: Arc<SessionDeps>,
    role: SessionRole,
    snapshot: Snapshot,
    cmd: Arc<CommandStream>,
    cancel: CancellationToken,
    expected_peer: Option<Peer>,
    throttle: Option<ThrottleHandle>,
    phase: SessionPhase,
    peer: Option<Peer>,
    /// Resources the peer announced. Scopes what it may send us.
    peer_resources: SharedResources,
    /// Resources we announced to the peer. Nothing outside them is exchanged.
    offered: AnnouncedResources,
    requested_logs: RequestedLogs,
    incoming_logs: IncomingLogs,
    registered: bool,
    /// Rejected because the peer already has a live session.
    duplicate: bool,
}

impl Session {
    async fn run_sync(&mut self) -> Result<(), SyncError> {
        self.phase = SessionPhase::Authenticating;
        let handshake = auth::create_handshake_packet(&self.snapshot.config.instance, &self.snapshot.key)
            .map_err(|e| SyncError::Internal(format!("creating handshake packet: {e}")))?;
        self.cmd.send(handshake).await;

        let Some(item) = self.cmd.receive_within(self.deps.settings.handshake_timeout).await else {
            if self.cmd.is_closed() {
                // the stream already ended, connect_stream reports why
                return Ok(());
            }
            return Err(SyncError::Auth(
                "no handshake packet received from peer within timeout".into(),
            ));
        };
        let public_key = auth::verify_handshake_packet(&item)
            .map_err(|e| SyncError::Auth(format!("verifying handshake packet: {e}")))?;

        let peer = self
            .role
            .peers(&self.snapshot.config)
            .iter()
            .find(|p| p.keyid == public_key.keyid())
            .cloned()
            .ok_or_else(|| {
                let keyid = public_key.keyid().to_string();
                SyncError::Auth(AuthError::UnknownPeer { keyid }.to_string())
            })?;
        if let Some(expected) = &self.expected_peer {
            if expected.keyid != peer.keyid {
                return Err(SyncError::Auth(format!(
                    "dialed {:?} but key {:?} answered",
                    expected.instance_id, peer.keyid
                )));
            }
        }
        auth::authorize_handshake_as_peer(&item, &peer)
            .map_err(|e| SyncError::Auth(format!("authorizing handshake: {e}")))?;
        self.peer = Some(peer.clone());

        let (peer, forwarder) = self.on_connection_established(peer).await?;
        self.phase = SessionPhase::Established;

        while let Some(item) = self.cmd.recv().await {
            let name = item.name();
            self.dispatch(&peer, &forwarder, item)
                .await
                .map_err(|e| e.context(&format!("handling {name}")))?;
        }
        Ok(())
    }

    async fn on_connection_established(&mut self, peer: Peer) -> Result<(Peer, Forwarder), SyncError> {
        // The snapshot may predate a config change that removed or edited the peer.
        let current = self.deps.config_store.get()?;
        let peer = self
            .role
            .peers(&current)
            .iter()
            .find(|p| p.keyid == peer.keyid && p.instance_id == peer.instance_id)
            .cloned()
            .ok_or_else(|| SyncError::Auth(format!("peer {:?} is no longer listed", peer.instance_id)))?;
        self.peer = Some(peer.clone());
        self.snapshot.config = current;

        if self.role == SessionRole::Server && !peer.keyid_verified {
            return Err(SyncError::Auth(format!(
                "client {:?} is not visually verified, please verify the key id {:?}",
                peer.instance_id, peer.keyid
            )));
        }

        let permissions = PermissionSet::new(&peer.permissions).map_err(|e| {
            SyncError::Internal(format!("building permission set for {:?}: {e}", peer.instance_id))
        })?;

        let handle = SessionHandle {
            cmd: self.cmd.clone(),
            requested_logs: self.requested_logs.clone(),
        };
        if !self.deps.sessions.register(self.role, &peer.keyid, handle) {
            self.duplicate = true;
            return Err(SyncError::Auth(format!("peer {:?} is already connected", peer.instance_id)));
        }
        self.registered = true;

        self.deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |state| {
            state.set_connection_state(ConnectionState::Connected, "connected");
            state.last_heartbeat_millis = now_millis();
        })?;
        if let Some(throttle) = &self.throttle {
            throttle.clear();
        }
        tracing::info!("sync: {} session established with {:?}", self.role, peer.instance_id);

        self.spawn_heartbeats();
        self.spawn_config_watcher();

        let config = &self.snapshot.config;
        let forwarder = Forwarder {
            oplog: self.deps.oplog.clone(),
            cmd: self.cmd.clone(),
            permissions: permissions.clone(),
            peer_resources: self.peer_resources.clone(),
            role: self.role,
            local_instance: config.instance.clone(),
            local_keyid: self.snapshot.key.keyid().to_string(),
            batch_size: self.deps.settings.op_batch_size,
        };
        // subscribe before announcing so no change falls between catch-up and live forwarding
        let (subscription, events) = self.deps.oplog.subscribe();
        tokio::spawn(
            forwarder
                .clone()
                .forward_live(self.cancel.clone(), subscription, events),
        );

        self.cmd
            .send(self.role.config_item(ConfigUpdate {
                config: Some(remote_config_for(config, &permissions)),
            }))
            .await;
        let offered = resources_for(config, &permissions);
        self.offered = AnnouncedResources::from_list(&offered);
        self.cmd.send(self.role.resources_item(offered)).await;
        let (high_opid, high_modno) = self
            .deps
            .oplog
            .get_highest_op_id_and_modno(&Query::new().original_instance_keyid(peer.keyid.clone()))?;
        self.cmd
            .send(SyncStreamItem::RequestOperations { high_opid, high_modno })
            .await;

        Ok((peer, forwarder))
    }

    fn spawn_heartbeats(&self) {
        let cmd = self.cmd.clone();
        let cancel = self.cancel.clone();
        let every = self.deps.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => cmd.send(SyncStreamItem::Heartbeat).await,
                }
            }
        });
    }

    /// Any local config change ends the session cleanly so it restarts from
    /// the new config.
    fn spawn_config_watcher(&self) {
        let deps = self.deps.clone();
        let cmd = self.cmd.clone();
        let cancel = self.cancel.clone();
        let (subscription, mut changes) = deps.config_store.on_change().subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                changed = changes.recv() => {
                    if changed.is_some() {
                        tracing::info!("sync: local config changed, ending session");
                        cmd.send_error_and_terminate(None);
                    }
                }
            }
            deps.config_store.on_change().unsubscribe(subscription);
        });
    }

    /// Run `task` in the background. Its error ends the session.
    fn spawn_task<F>(&self, what: &'static str, task: F)
    where
        F: std::future::Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let cmd = self.cmd.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = task => {
                    if let Err(e) = result {
                        cmd.send_error_and_terminate(Some(e.context(what)));
                    }
                }
            }
        });
    }

    fn on_session_end(&mut self, result: &Result<(), SyncError>) {
        self.phase = SessionPhase::Closed;
        self.incoming_logs.close_all();

        let peer = self.peer.clone().or_else(|| self.expected_peer.clone());
        let Some(peer) = peer else {
            if let Err(e) = result {
                tracing::warn!("sync: {} session with unidentified peer ended: {e}", self.role);
            }
            return;
        };
        if self.registered {
            self.deps.sessions.unregister(self.role, &peer.keyid, &self.cmd);
        }
        match result {
            Ok(()) => tracing::info!("sync: {} session with {:?} closed", self.role, peer.instance_id),
            Err(e) => tracing::warn!("sync: {} session with {:?} ended: {e}", self.role, peer.instance_id),
        }
        if self.duplicate {
            return;
        }
        let (state, message) = match result {
            Ok(()) => (ConnectionState::Disconnected, "disconnected".to_string()),
            Err(e) => (e.state(), e.message()),
        };
        if let Err(e) = self.deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |s| {
            s.set_connection_state(state, message.clone());
        }) {
            tracing::warn!("sync: recording state for {:?}: {e}", peer.instance_id);
        }
    }
}

/// The part of `config` the peer may view.
fn remote_config_for(config: &Config, permissions: &PermissionSet) -> RemoteConfig {
    RemoteConfig {
        version: config.version,
        modno: config.modno,
        repos: config
            .repos
            .iter()
            .filter(|r| permissions.check_repo(&r.id, PERMS_CAN_VIEW_CONFIGURATION))
            .cloned()
            .collect(),
        plans: config
            .plans
            .iter()
            .filter(|p| permissions.check_plan(&p.id, PERMS_CAN_VIEW_CONFIGURATION))
            .cloned()
            .collect(),
    }
}

fn resources_for(config: &Config, permissions: &PermissionSet) -> ResourceList {
    ResourceList {
        repos: config
            .repos
            .iter()
            .filter(|r| permissions.check_repo(&r.id, PERMS_CAN_VIEW_RESOURCES))
            .map(|r| RepoMetadata {
                id: r.id.clone(),
                guid: r.guid.clone(),
            })
            .collect(),
        plans: config
            .plans
            .iter()
            .filter(|p| permissions.check_plan(&p.id, PERMS_CAN_VIEW_RESOURCES))
            .map(|p| PlanMetadata { id: p.id.clone() })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Permission, PermissionType, Plan, Repo};

    fn config() -> Config {
        Config {
            instance: "home".into(),
            version: 2,
            modno: 9,
            repos: vec![
                Repo { id: "photos".into(), guid: "g-photos".into(), uri: "s3://photos".into() },
                Repo { id: "docs".into(), guid: "g-docs".into(), uri: "s3://docs".into() },
            ],
            plans: vec![
                Plan { id: "daily".into(), repo: "photos".into() },
                Plan { id: "weekly".into(), repo: "docs".into() },
            ],
            ..Default::default()
        }
    }

    fn grants(kind: PermissionType, scopes: &[&str]) -> PermissionSet {
        PermissionSet::new(&[Permission {
            kind,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }])
        .unwrap()
    }

    #[test]
    fn remote_config_needs_config_grant() {
        let perms = grants(PermissionType::ReadOperations, &["*"]);
        let shared = remote_config_for(&config(), &perms);
        assert!(shared.repos.is_empty());
        assert!(shared.plans.is_empty());
        assert_eq!(shared.modno, 9);

        let perms = grants(PermissionType::ReadConfig, &["repo:photos", "plan:daily"]);
        let shared = remote_config_for(&config(), &perms);
        assert_eq!(shared.repos.len(), 1);
        assert_eq!(shared.repos[0].uri, "s3://photos");
        assert_eq!(shared.plans, vec![Plan { id: "daily".into(), repo: "photos".into() }]);
    }

    #[test]
    fn resources_carry_ids_only() {
        let perms = grants(PermissionType::ReadOperations, &["*", "!repo:docs"]);
        let resources = resources_for(&config(), &perms);
        assert_eq!(
            resources.repos,
            vec![RepoMetadata { id: "photos".into(), guid: "g-photos".into() }]
        );
        assert_eq!(resources.plans.len(), 2);
    }

    #[test]
    fn registry_rejects_duplicate_server_sessions() {
        let registry = SessionRegistry::default();
        let handle = || SessionHandle {
            cmd: Arc::new(CommandStream::default()),
            requested_logs: RequestedLogs::default(),
        };
        let first = handle();
        assert!(registry.register(SessionRole::Server, "k", first.clone()));
        assert!(!registry.register(SessionRole::Server, "k", handle()));
        assert!(registry.register(SessionRole::Client, "k", handle()));
        assert!(registry.register(SessionRole::Client, "k", handle()));
        assert_eq!(registry.len(), 2);

        let other = handle();
        registry.unregister(SessionRole::Server, "k", &other.cmd);
        assert_eq!(registry.len(), 2);
        registry.unregister(SessionRole::Server, "k", &first.cmd);
        assert_eq!(registry.len(), 1);
        assert!(registry.find("k").is_some());
        assert!(registry.find("nobody").is_none());
    }
}
