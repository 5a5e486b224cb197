/// Domain configuration shared with peers, and the store it lives in.
use serde::{Deserialize, Serialize};

use crate::events::EventEmitter;
use crate::identity::{PrivateKeyConfig, PublicKeyInfo};
use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionType {
    /// Read operation history for the scoped repos and plans.
    ReadOperations,
    ReadConfig,
    ReadWriteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: PermissionType,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A remote instance, either one we dial (known host) or one that may dial us
/// (authorized client).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub instance_id: String,
    pub keyid: String,
    #[serde(default)]
    pub public_key: Option<PublicKeyInfo>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Set once the key id was confirmed out of band.
    #[serde(default)]
    pub keyid_verified: bool,
    /// Dial target, only meaningful for known hosts.
    #[serde(default)]
    pub instance_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multihost {
    #[serde(default)]
    pub identity: Option<PrivateKeyConfig>,
    #[serde(default)]
    pub known_hosts: Vec<Peer>,
    #[serde(default)]
    pub authorized_clients: Vec<Peer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub guid: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub repo: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub instance: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub modno: i32,
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub multihost: Multihost,
}

impl Config {
    pub fn repo(&self, id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub fn repo_by_guid(&self, guid: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.guid == guid)
    }

    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }
}

/// The subset of a peer's configuration it chose to share with us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub version: i32,
    pub modno: i32,
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// Source of the local [`Config`].
pub trait ConfigStore: Send + Sync {
    fn get(&self) -> Result<Config, StoreError>;
    fn update(&self, config: Config) -> Result<(), StoreError>;
    /// Emits the new config after every successful update.
    fn on_change(&self) -> &EventEmitter<Config>;
}

/// In-memory [`ConfigStore`].
pub struct MemConfigStore {
    config: parking_lot::Mutex<Config>,
    changes: EventEmitter<Config>,
}

impl MemConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: parking_lot::Mutex::new(config),
            changes: EventEmitter::default(),
        }
    }
}

impl ConfigStore for MemConfigStore {
    fn get(&self) -> Result<Config, StoreError> {
        Ok(self.config.lock().clone())
    }

    fn update(&self, mut config: Config) -> Result<(), StoreError> {
        {
            let mut current = self.config.lock();
            config.modno = current.modno + 1;
            *current = config.clone();
        }
        self.changes.emit(config);
        Ok(())
    }

    fn on_change(&self) -> &EventEmitter<Config> {
        &self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_bumps_modno_and_notifies() {
        let store = MemConfigStore::new(Config {
            instance: "a".into(),
            ..Default::default()
        });
        let (_id, mut rx) = store.on_change().subscribe();
        let mut cfg = store.get().unwrap();
        cfg.repos.push(Repo {
            id: "r".into(),
            guid: "g".into(),
            uri: String::new(),
        });
        store.update(cfg).unwrap();
        let changed = rx.try_recv().unwrap();
        assert_eq!(changed.modno, 1);
        assert_eq!(store.get().unwrap().repos.len(), 1);
    }

    #[test]
    fn config_json_uses_type_field() {
        let perm = Permission {
            kind: PermissionType::ReadConfig,
            scopes: vec!["*".into()],
        };
        let json = serde_json::to_string(&perm).unwrap();
        assert_eq!(json, r#"{"type":"ReadConfig","scopes":["*"]}"#);
    }
}
