/// Translation of a peer's operation and flow ids to local ids.
///
/// Operations received from a peer are stored under fresh local ids with the
/// peer's ids kept in `original_id` / `original_flow_id`. Lookups go through
/// two LRU caches keyed by `(peer keyid, remote id)`.
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::oplog::{OpLog, Operation, Query};
use crate::StoreError;

pub const DEFAULT_OP_CACHE_SIZE: usize = 16 * 1024;
pub const DEFAULT_FLOW_CACHE_SIZE: usize = 4 * 1024;

type CacheKey = (String, i64);

struct Caches {
    ops: LruCache<CacheKey, i64>,
    flows: LruCache<CacheKey, i64>,
}

pub struct OpIdMapper {
    oplog: Arc<dyn OpLog>,
    caches: parking_lot::Mutex<Caches>,
}

impl OpIdMapper {
    pub fn new(oplog: Arc<dyn OpLog>, op_cache_size: usize, flow_cache_size: usize) -> Self {
        let size = |n: usize| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        Self {
            oplog,
            caches: parking_lot::Mutex::new(Caches {
                ops: LruCache::new(size(op_cache_size)),
                flows: LruCache::new(size(flow_cache_size)),
            }),
        }
    }

    pub fn with_defaults(oplog: Arc<dyn OpLog>) -> Self {
        Self::new(oplog, DEFAULT_OP_CACHE_SIZE, DEFAULT_FLOW_CACHE_SIZE)
    }

    /// Local `(op id, flow id)` for a peer's ids. 0 means no local copy yet.
    pub fn translate_op_id_and_flow_id(
        &self,
        peer_keyid: &str,
        remote_op_id: i64,
        remote_flow_id: i64,
    ) -> Result<(i64, i64), StoreError> {
        let mut caches = self.caches.lock();
        self.translate_locked(&mut caches, peer_keyid, remote_op_id, remote_flow_id)
    }

    fn translate_locked(
        &self,
        caches: &mut Caches,
        peer_keyid: &str,
        remote_op_id: i64,
        remote_flow_id: i64,
    ) -> Result<(i64, i64), StoreError> {
        let op_id = self.translate(&mut caches.ops, peer_keyid, remote_op_id, |q, id| q.original_id(id), false)?;
        let flow_id = self.translate(
            &mut caches.flows,
            peer_keyid,
            remote_flow_id,
            |q, id| q.original_flow_id(id),
            true,
        )?;
        Ok((op_id, flow_id))
    }

    fn translate(
        &self,
        cache: &mut LruCache<CacheKey, i64>,
        peer_keyid: &str,
        remote_id: i64,
        select: impl FnOnce(Query, i64) -> Query,
        want_flow: bool,
    ) -> Result<i64, StoreError> {
        if remote_id == 0 {
            return Ok(0);
        }
        let key = (peer_keyid.to_string(), remote_id);
        if let Some(local) = cache.get(&key) {
            return Ok(*local);
        }

        let query = select(Query::new().original_instance_keyid(peer_keyid), remote_id);
        match self.oplog.find_one_metadata(&query) {
            Ok(meta) => {
                let local = if want_flow { meta.flow_id } else { meta.id };
                cache.put(key, local);
                Ok(local)
            }
            Err(StoreError::NoResults) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Store an operation received from `peer_keyid`, adding or updating the local copy.
    ///
    /// The caches stay locked from lookup to write, so concurrent deliveries
    /// of one operation produce a single local copy.
    pub fn insert_or_update(
        &self,
        peer_keyid: &str,
        mut op: Operation,
        is_update: bool,
    ) -> Result<Operation, StoreError> {
        op.original_instance_keyid = peer_keyid.to_string();
        op.original_id = op.id;
        op.original_flow_id = op.flow_id;
        let mut caches = self.caches.lock();
        let (local_id, local_flow_id) =
            self.translate_locked(&mut caches, peer_keyid, op.original_id, op.original_flow_id)?;
        op.id = local_id;
        op.flow_id = local_flow_id;

        if op.id == 0 {
            if is_update {
                tracing::warn!(
                    "update for unknown operation {} from {peer_keyid}, inserting it",
                    op.original_id
                );
            }
            let stored = self.oplog.add(op)?;
            caches.ops.put((peer_keyid.to_string(), stored.original_id), stored.id);
            if stored.original_flow_id != 0 {
                caches
                    .flows
                    .put((peer_keyid.to_string(), stored.original_flow_id), stored.flow_id);
            }
            Ok(stored)
        } else {
            if !is_update {
                tracing::warn!(
                    "insert for known operation {} from {peer_keyid}, updating it",
                    op.original_id
                );
            }
            self.oplog.update(op)
        }
    }

    /// Delete the local copy of a peer's operation. Absent ids are ignored.
    pub fn delete_by_original_id(&self, peer_keyid: &str, original_id: i64) -> Result<(), StoreError> {
        let mut caches = self.caches.lock();
        let query = Query::new()
            .original_instance_keyid(peer_keyid)
            .original_id(original_id);
        let meta = match self.oplog.find_one_metadata(&query) {
            Ok(meta) => meta,
            Err(StoreError::NoResults) => {
                tracing::debug!("delete for unknown operation {original_id} from {peer_keyid}, ignoring");
                caches.ops.pop(&(peer_keyid.to_string(), original_id));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.oplog.delete(&[meta.id])?;
        caches.ops.pop(&(peer_keyid.to_string(), original_id));
        Ok(())
    }
}
