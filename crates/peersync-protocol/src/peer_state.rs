/// Observed connection state of each peer.
///
/// Peer state is observability only: nothing in the protocol makes an
/// authorization decision from it, except the set of resources a peer
/// announced, which scopes what it may send us.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::events::EventEmitter;
use crate::identity::now_millis;
use crate::messages::{PlanMetadata, RepoMetadata};
use crate::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Unknown,
    Pending,
    Connected,
    Disconnected,
    RetryWait,
    ErrorAuth,
    ErrorProtocol,
    ErrorInternal,
}

impl ConnectionState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ConnectionState::ErrorAuth | ConnectionState::ErrorProtocol | ConnectionState::ErrorInternal
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub instance_id: String,
    pub keyid: String,
    pub last_heartbeat_millis: i64,
    pub connection_state: ConnectionState,
    pub connection_state_message: String,
    /// Repos the peer announced, by id.
    #[serde(default)]
    pub known_repos: BTreeMap<String, RepoMetadata>,
    #[serde(default)]
    pub known_plans: BTreeMap<String, PlanMetadata>,
    /// The part of the peer's config it shared with us.
    #[serde(default)]
    pub remote_config: Option<RemoteConfig>,
}

impl PeerState {
    pub fn new(instance_id: impl Into<String>, keyid: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            keyid: keyid.into(),
            last_heartbeat_millis: now_millis(),
            connection_state: ConnectionState::Disconnected,
            connection_state_message: "disconnected".into(),
            ..Default::default()
        }
    }

    pub fn knows_repo_guid(&self, guid: &str) -> bool {
        self.known_repos.values().any(|r| r.guid == guid)
    }

    pub(crate) fn set_connection_state(&mut self, state: ConnectionState, message: impl Into<String>) {
        self.connection_state = state;
        self.connection_state_message = message.into();
    }
}

/// Storage for [`PeerState`], keyed by peer key id.
///
/// Reads and writes copy the state, so callers never share it.
pub trait PeerStateStore: Send + Sync {
    fn get(&self, keyid: &str) -> Result<Option<PeerState>, StoreError>;
    fn get_all(&self) -> Result<Vec<PeerState>, StoreError>;
    fn set(&self, keyid: &str, state: PeerState) -> Result<(), StoreError>;
    /// Apply `f` to the stored state, creating it if absent. A non-empty
    /// `instance_id` replaces the stored one.
    fn update(
        &self,
        keyid: &str,
        instance_id: &str,
        f: &mut dyn FnMut(&mut PeerState),
    ) -> Result<PeerState, StoreError>;
    fn on_state_changed(&self) -> &EventEmitter<PeerState>;
}

fn apply_update(
    current: Option<PeerState>,
    keyid: &str,
    instance_id: &str,
    f: &mut dyn FnMut(&mut PeerState),
) -> PeerState {
    let mut state = current.unwrap_or_else(|| PeerState::new(instance_id, keyid));
    if !instance_id.is_empty() {
        state.instance_id = instance_id.to_string();
    }
    f(&mut state);
    state
}

/// In-memory [`PeerStateStore`].
pub struct MemPeerStateStore {
    states: parking_lot::Mutex<HashMap<String, PeerState>>,
    changes: EventEmitter<PeerState>,
}

impl Default for MemPeerStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPeerStateStore {
    pub fn new() -> Self {
        Self {
            states: parking_lot::Mutex::new(HashMap::new()),
            changes: EventEmitter::default(),
        }
    }
}

impl PeerStateStore for MemPeerStateStore {
    fn get(&self, keyid: &str) -> Result<Option<PeerState>, StoreError> {
        Ok(self.states.lock().get(keyid).cloned())
    }

    fn get_all(&self) -> Result<Vec<PeerState>, StoreError> {
        let mut all: Vec<PeerState> = self.states.lock().values().cloned().collect();
        all.sort_by(|a, b| a.keyid.cmp(&b.keyid));
        Ok(all)
    }

    fn set(&self, keyid: &str, state: PeerState) -> Result<(), StoreError> {
        self.states.lock().insert(keyid.to_string(), state.clone());
        self.changes.emit(state);
        Ok(())
    }

    fn update(
        &self,
        keyid: &str,
        instance_id: &str,
        f: &mut dyn FnMut(&mut PeerState),
    ) -> Result<PeerState, StoreError> {
        let state = {
            let mut states = self.states.lock();
            let state = apply_update(states.get(keyid).cloned(), keyid, instance_id, f);
            states.insert(keyid.to_string(), state.clone());
            state
        };
        self.changes.emit(state.clone());
        Ok(state)
    }

    fn on_state_changed(&self) -> &EventEmitter<PeerState> {
        &self.changes
    }
}

/// [`PeerStateStore`] persisted in SQLite, one MessagePack row per peer.
pub struct SqlitePeerStateStore {
    conn: parking_lot::Mutex<Connection>,
    changes: EventEmitter<PeerState>,
}

impl SqlitePeerStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peer_states (
                key_id TEXT PRIMARY KEY NOT NULL,
                state BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
            changes: EventEmitter::default(),
        })
    }

    fn decode(keyid: &str, blob: &[u8]) -> Option<PeerState> {
        match rmp_serde::from_slice::<PeerState>(blob) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("peer state: skipping corrupt row for {keyid}: {e}");
                None
            }
        }
    }

    fn load(conn: &Connection, keyid: &str) -> Result<Option<PeerState>, StoreError> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM peer_states WHERE key_id = ?1",
                params![keyid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.and_then(|blob| Self::decode(keyid, &blob)))
    }

    fn store(conn: &Connection, keyid: &str, state: &PeerState) -> Result<(), StoreError> {
        let blob = rmp_serde::to_vec_named(state)?;
        conn.execute(
            "INSERT OR REPLACE INTO peer_states (key_id, state) VALUES (?1, ?2)",
            params![keyid, blob],
        )?;
        Ok(())
    }
}

impl PeerStateStore for SqlitePeerStateStore {
    fn get(&self, keyid: &str) -> Result<Option<PeerState>, StoreError> {
        Self::load(&self.conn.lock(), keyid)
    }

    fn get_all(&self) -> Result<Vec<PeerState>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key_id, state FROM peer_states ORDER BY key_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;
        let mut all = Vec::new();
        for row in rows {
            let (keyid, blob) = row?;
            if let Some(state) = Self::decode(&keyid, &blob) {
                all.push(state);
            }
        }
        Ok(all)
    }

    fn set(&self, keyid: &str, state: PeerState) -> Result<(), StoreError> {
        Self::store(&self.conn.lock(), keyid, &state)?;
        self.changes.emit(state);
        Ok(())
    }

    fn update(
        &self,
        keyid: &str,
        instance_id: &str,
        f: &mut dyn FnMut(&mut PeerState),
    ) -> Result<PeerState, StoreError> {
        let state = {
            let conn = self.conn.lock();
            let state = apply_update(Self::load(&conn, keyid)?, keyid, instance_id, f);
            Self::store(&conn, keyid, &state)?;
            state
        };
        self.changes.emit(state.clone());
        Ok(state)
    }

    fn on_state_changed(&self) -> &EventEmitter<PeerState> {
        &self.changes
    }
}
