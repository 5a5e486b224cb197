/// Last config each peer shared with us, keyed by instance id.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

use crate::config::RemoteConfig;
use crate::StoreError;

pub trait RemoteConfigStore: Send + Sync {
    /// [`StoreError::NotFound`] if nothing was stored for the instance.
    fn get(&self, instance_id: &str) -> Result<RemoteConfig, StoreError>;
    fn update(&self, instance_id: &str, config: RemoteConfig) -> Result<(), StoreError>;
    /// Deleting an unknown instance is not an error.
    fn delete(&self, instance_id: &str) -> Result<(), StoreError>;
}

fn require_id(instance_id: &str) -> Result<(), StoreError> {
    if instance_id.is_empty() {
        return Err(StoreError::Invalid("instance id is required".into()));
    }
    Ok(())
}

fn not_found(instance_id: &str) -> StoreError {
    StoreError::NotFound(format!("config for remote instance {instance_id:?}"))
}

#[derive(Default)]
pub struct MemRemoteConfigStore {
    configs: parking_lot::Mutex<HashMap<String, RemoteConfig>>,
}

impl MemRemoteConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteConfigStore for MemRemoteConfigStore {
    fn get(&self, instance_id: &str) -> Result<RemoteConfig, StoreError> {
        self.configs
            .lock()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| not_found(instance_id))
    }

    fn update(&self, instance_id: &str, config: RemoteConfig) -> Result<(), StoreError> {
        require_id(instance_id)?;
        self.configs.lock().insert(instance_id.to_string(), config);
        Ok(())
    }

    fn delete(&self, instance_id: &str) -> Result<(), StoreError> {
        require_id(instance_id)?;
        self.configs.lock().remove(instance_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per instance, with a read cache.
pub struct JsonDirRemoteConfigStore {
    dir: PathBuf,
    cache: parking_lot::Mutex<HashMap<String, RemoteConfig>>,
}

impl JsonDirRemoteConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<sanitized id>-<8 hex digits of sha256(id)>.json`. The digest keeps
    /// ids that sanitize to the same name apart.
    pub fn file_for_instance(&self, instance_id: &str) -> PathBuf {
        let collapsed = instance_id.replace("..", ".");
        let mut safe = String::with_capacity(collapsed.len());
        let mut in_run = false;
        for c in collapsed.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                safe.push(c);
                in_run = false;
            } else if !in_run {
                safe.push('_');
                in_run = true;
            }
        }
        let digest = HEXLOWER.encode(&Sha256::digest(instance_id.as_bytes()));
        self.dir.join(format!("{safe}-{}.json", &digest[..8]))
    }
}

impl RemoteConfigStore for JsonDirRemoteConfigStore {
    fn get(&self, instance_id: &str) -> Result<RemoteConfig, StoreError> {
        require_id(instance_id)?;
        let mut cache = self.cache.lock();
        if let Some(config) = cache.get(instance_id) {
            return Ok(config.clone());
        }
        let data = match std::fs::read(self.file_for_instance(instance_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(instance_id)),
            Err(e) => return Err(e.into()),
        };
        let config: RemoteConfig = serde_json::from_slice(&data)?;
        cache.insert(instance_id.to_string(), config.clone());
        Ok(config)
    }

    fn update(&self, instance_id: &str, config: RemoteConfig) -> Result<(), StoreError> {
        require_id(instance_id)?;
        let mut cache = self.cache.lock();
        let data = serde_json::to_vec_pretty(&config)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.file_for_instance(instance_id), data)?;
        cache.insert(instance_id.to_string(), config);
        Ok(())
    }

    fn delete(&self, instance_id: &str) -> Result<(), StoreError> {
        require_id(instance_id)?;
        let mut cache = self.cache.lock();
        match std::fs::remove_file(self.file_for_instance(instance_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        cache.remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Repo;

    fn sample() -> RemoteConfig {
        RemoteConfig {
            version: 3,
            modno: 7,
            repos: vec![Repo {
                id: "photos".into(),
                guid: "g1".into(),
                uri: "s3://bucket".into(),
            }],
            plans: vec![],
        }
    }

    #[test]
    fn json_dir_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirRemoteConfigStore::new(dir.path().join("remote"));
        assert!(matches!(store.get("laptop"), Err(StoreError::NotFound(_))));
        store.update("laptop", sample()).unwrap();

        let fresh = JsonDirRemoteConfigStore::new(dir.path().join("remote"));
        assert_eq!(fresh.get("laptop").unwrap(), sample());

        fresh.delete("laptop").unwrap();
        fresh.delete("laptop").unwrap();
        assert!(matches!(fresh.get("laptop"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn file_names_are_sanitized_and_distinct() {
        let store = JsonDirRemoteConfigStore::new("/tmp/x");
        let a = store.file_for_instance("../etc/passwd");
        let b = store.file_for_instance("./etc/passwd");
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("._etc_passwd-"));
        assert!(name.ends_with(".json"));
        assert!(!name.contains('/'));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/tmp/x")));
    }

    #[test]
    fn empty_id_rejected() {
        let store = MemRemoteConfigStore::new();
        assert!(matches!(store.update("", sample()), Err(StoreError::Invalid(_))));
        store.update("a", sample()).unwrap();
        assert_eq!(store.get("a").unwrap().modno, 7);
    }
}
