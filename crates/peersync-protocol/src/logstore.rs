/// Operation log storage collaborator.
///
/// Logs are opaque byte blobs referenced by an operation's `logref`.
/// Sync only needs to read a complete log and to write one received in
/// chunks from a peer.
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use crate::identity::now_millis;
use crate::messages::LogMetadata;
use crate::StoreError;

/// Writer for a log being received. Data becomes readable on `close`.
pub trait LogSink: Send + Sync {
    fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError>;
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait LogStore: Send + Sync {
    /// [`StoreError::NotFound`] if the log does not exist.
    fn get_metadata(&self, log_id: &str) -> Result<LogMetadata, StoreError>;
    fn open(&self, log_id: &str) -> Result<Box<dyn Read + Send>, StoreError>;
    /// Start writing a log that expires `ttl` from now, replacing any existing one.
    fn create(&self, log_id: &str, owner_opid: i64, ttl: Duration) -> Result<Box<dyn LogSink>, StoreError>;
}

#[derive(Clone)]
struct StoredLog {
    metadata: LogMetadata,
    data: Arc<Vec<u8>>,
}

type LogMap = parking_lot::Mutex<HashMap<String, StoredLog>>;

/// In-memory [`LogStore`].
#[derive(Default)]
pub struct MemLogStore {
    logs: Arc<LogMap>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a complete log in one call.
    pub fn put(&self, log_id: &str, owner_opid: i64, data: &[u8]) {
        self.logs.lock().insert(
            log_id.to_string(),
            StoredLog {
                metadata: LogMetadata {
                    owner_opid,
                    expiration_ts_unix: 0,
                },
                data: Arc::new(data.to_vec()),
            },
        );
    }

    pub fn contains(&self, log_id: &str) -> bool {
        self.logs.lock().contains_key(log_id)
    }
}

impl LogStore for MemLogStore {
    fn get_metadata(&self, log_id: &str) -> Result<LogMetadata, StoreError> {
        self.logs
            .lock()
            .get(log_id)
            .map(|log| log.metadata)
            .ok_or_else(|| StoreError::NotFound(format!("log {log_id:?}")))
    }

    fn open(&self, log_id: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        let data = self
            .logs
            .lock()
            .get(log_id)
            .map(|log| log.data.clone())
            .ok_or_else(|| StoreError::NotFound(format!("log {log_id:?}")))?;
        Ok(Box::new(Cursor::new(data.as_ref().clone())))
    }

    fn create(&self, log_id: &str, owner_opid: i64, ttl: Duration) -> Result<Box<dyn LogSink>, StoreError> {
        if log_id.is_empty() {
            return Err(StoreError::Invalid("log id is required".into()));
        }
        let expiration_ts_unix = now_millis() / 1000 + ttl.as_secs() as i64;
        Ok(Box::new(MemLogSink {
            logs: self.logs.clone(),
            log_id: log_id.to_string(),
            metadata: LogMetadata {
                owner_opid,
                expiration_ts_unix,
            },
            buf: Vec::new(),
        }))
    }
}

struct MemLogSink {
    logs: Arc<LogMap>,
    log_id: String,
    metadata: LogMetadata,
    buf: Vec<u8>,
}

impl LogSink for MemLogSink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        let MemLogSink {
            logs,
            log_id,
            metadata,
            buf,
        } = *self;
        logs.lock().insert(
            log_id,
            StoredLog {
                metadata,
                data: Arc::new(buf),
            },
        );
        Ok(())
    }
}
