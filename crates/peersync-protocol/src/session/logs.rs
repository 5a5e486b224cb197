/// Log streaming between peers.
///
/// The owner answers `GetLog` with a metadata frame, data chunks, and an
/// empty end frame. The requester writes the chunks into a [`LogSink`].
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::command_stream::CommandStream;
use crate::logstore::{LogSink, LogStore};
use crate::messages::{LogData, SyncStreamItem};
use crate::{StoreError, SyncError};

/// Received logs expire after a day. They are re-requested when wanted again.
pub(crate) const RECEIVED_LOG_TTL: Duration = Duration::from_secs(24 * 3600);

pub(crate) type RequestedLogs = Arc<parking_lot::Mutex<HashSet<String>>>;

fn end_frame(log_id: &str) -> SyncStreamItem {
    SyncStreamItem::SendLogData(LogData {
        log_id: log_id.to_string(),
        ..Default::default()
    })
}

/// Stream a stored log to the peer.
pub(crate) async fn upload_log(
    cmd: &CommandStream,
    store: &dyn LogStore,
    log_id: &str,
    chunk_size: usize,
) -> Result<(), SyncError> {
    let metadata = match store.get_metadata(log_id) {
        Ok(metadata) => metadata,
        Err(StoreError::NotFound(_)) => {
            tracing::debug!("sync: peer requested unknown log {log_id}");
            cmd.send(end_frame(log_id)).await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = store.open(log_id)?;

    cmd.send(SyncStreamItem::SendLogData(LogData {
        log_id: log_id.to_string(),
        metadata: Some(metadata),
        chunk: Bytes::new(),
    }))
    .await;

    let mut sent = 0usize;
    loop {
        let chunk = read_chunk(&mut reader, chunk_size)
            .map_err(|e| SyncError::Internal(format!("reading log {log_id:?}: {e}")))?;
        if chunk.is_empty() {
            break;
        }
        sent += chunk.len();
        cmd.send(SyncStreamItem::SendLogData(LogData {
            log_id: log_id.to_string(),
            metadata: None,
            chunk: Bytes::from(chunk),
        }))
        .await;
        if cmd.is_closed() {
            return Ok(());
        }
    }
    cmd.send(end_frame(log_id)).await;
    tracing::debug!("sync: sent log {log_id} ({sent} bytes)");
    Ok(())
}

/// Fill up to `size` bytes. Short only at end of input.
fn read_chunk(reader: &mut dyn Read, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Logs being received on one session.
pub(crate) struct IncomingLogs {
    requested: RequestedLogs,
    active: HashMap<String, Box<dyn LogSink>>,
    max_active: usize,
}

impl IncomingLogs {
    pub(crate) fn new(requested: RequestedLogs, max_active: usize) -> Self {
        Self {
            requested,
            active: HashMap::new(),
            max_active,
        }
    }

    /// Apply one `SendLogData` frame. `local_owner` maps the sender's owner
    /// operation id to the id of our copy.
    pub(crate) fn receive(
        &mut self,
        store: &dyn LogStore,
        data: LogData,
        local_owner: impl Fn(i64) -> Result<i64, SyncError>,
    ) -> Result<(), SyncError> {
        let log_id = data.log_id.as_str();
        if log_id.is_empty() {
            return Err(SyncError::Protocol("log id is required".into()));
        }
        if !self.requested.lock().contains(log_id) {
            return Err(SyncError::Protocol(format!("log {log_id:?} was not requested")));
        }

        if let Some(metadata) = data.metadata {
            if self.active.contains_key(log_id) {
                return Err(SyncError::Protocol(format!("log {log_id:?} is already being received")));
            }
            if self.active.len() >= self.max_active {
                return Err(SyncError::Protocol(format!(
                    "too many active log streams, limit is {}",
                    self.max_active
                )));
            }
            let sink = store.create(log_id, local_owner(metadata.owner_opid)?, RECEIVED_LOG_TTL)?;
            self.active.insert(log_id.to_string(), sink);
        }

        if !data.chunk.is_empty() {
            let Some(sink) = self.active.get_mut(log_id) else {
                return Err(SyncError::Protocol(format!("data for log {log_id:?} before its metadata")));
            };
            sink.write(&data.chunk)?;
        }

        if data.is_end() {
            self.requested.lock().remove(log_id);
            if let Some(sink) = self.active.remove(log_id) {
                sink.close()?;
                tracing::debug!("sync: received log {log_id}");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Close every open sink. Partial logs are kept.
    pub(crate) fn close_all(&mut self) {
        for (log_id, sink) in self.active.drain() {
            if let Err(e) = sink.close() {
                tracing::warn!("sync: closing log {log_id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_tunnel::FrameStream;
    use crate::logstore::MemLogStore;
    use crate::messages::LogMetadata;

    fn requested(ids: &[&str]) -> RequestedLogs {
        Arc::new(parking_lot::Mutex::new(ids.iter().map(|s| s.to_string()).collect()))
    }

    fn meta_frame(log_id: &str) -> LogData {
        LogData {
            log_id: log_id.into(),
            metadata: Some(LogMetadata {
                owner_opid: 7,
                expiration_ts_unix: 0,
            }),
            chunk: Bytes::new(),
        }
    }

    fn chunk_frame(log_id: &str, chunk: &'static [u8]) -> LogData {
        LogData {
            log_id: log_id.into(),
            metadata: None,
            chunk: Bytes::from_static(chunk),
        }
    }

    fn end(log_id: &str) -> LogData {
        LogData {
            log_id: log_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn chunks_are_read_to_size() {
        let mut reader = std::io::Cursor::new(vec![1u8; 10]);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 2);
        assert!(read_chunk(&mut reader, 4).unwrap().is_empty());
    }

    #[test]
    fn receive_writes_and_commits() {
        let store = MemLogStore::new();
        let requested = requested(&["l1"]);
        let mut logs = IncomingLogs::new(requested.clone(), 16);

        logs.receive(&store, meta_frame("l1"), |id| Ok(id + 100)).unwrap();
        logs.receive(&store, chunk_frame("l1", b"abc"), Ok).unwrap();
        logs.receive(&store, chunk_frame("l1", b"def"), Ok).unwrap();
        assert!(!store.contains("l1"));
        logs.receive(&store, end("l1"), Ok).unwrap();

        let mut out = Vec::new();
        store.open("l1").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(store.get_metadata("l1").unwrap().owner_opid, 107);
        assert!(requested.lock().is_empty());
        assert_eq!(logs.active_count(), 0);
    }

    #[test]
    fn receive_rejections() {
        let store = MemLogStore::new();
        let mut logs = IncomingLogs::new(requested(&["l1", "l2"]), 1);

        let err = logs.receive(&store, meta_frame("other"), Ok).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(m) if m.contains("not requested")));
        assert!(matches!(logs.receive(&store, end(""), Ok), Err(SyncError::Protocol(_))));

        let err = logs.receive(&store, chunk_frame("l1", b"x"), Ok).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(m) if m.contains("before its metadata")));

        logs.receive(&store, meta_frame("l1"), Ok).unwrap();
        let err = logs.receive(&store, meta_frame("l2"), Ok).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(m) if m.contains("limit is 1")));
    }

    #[test]
    fn owner_lookup_failure_ends_receive() {
        let store = MemLogStore::new();
        let mut logs = IncomingLogs::new(requested(&["l1"]), 16);
        let err = logs
            .receive(&store, meta_frame("l1"), |_| Err(SyncError::Internal("oplog offline".into())))
            .unwrap_err();
        assert_eq!(err, SyncError::Internal("oplog offline".into()));
        assert_eq!(logs.active_count(), 0);
        assert!(!store.contains("l1"));
    }

    #[test]
    fn end_without_sink_clears_request() {
        let store = MemLogStore::new();
        let requested = requested(&["missing"]);
        let mut logs = IncomingLogs::new(requested.clone(), 16);
        logs.receive(&store, end("missing"), Ok).unwrap();
        assert!(requested.lock().is_empty());
        assert!(!store.contains("missing"));
    }

    #[test]
    fn close_all_keeps_partial_logs() {
        let store = MemLogStore::new();
        let mut logs = IncomingLogs::new(requested(&["l1"]), 16);
        logs.receive(&store, meta_frame("l1"), Ok).unwrap();
        logs.receive(&store, chunk_frame("l1", b"part"), Ok).unwrap();
        logs.close_all();
        assert!(store.contains("l1"));
    }

    #[tokio::test]
    async fn upload_sends_metadata_chunks_and_end() {
        let store = MemLogStore::new();
        store.put("l1", 3, &[9u8; 10]);
        let cmd = CommandStream::default();
        upload_log(&cmd, &store, "l1", 4).await.unwrap();
        upload_log(&cmd, &store, "missing", 4).await.unwrap();

        let (local, remote) = peersync_tunnel::memory_pair::<SyncStreamItem>(16);
        let cmd = Arc::new(cmd);
        let pump = {
            let cmd = cmd.clone();
            tokio::spawn(async move {
                cmd.connect_stream(tokio_util::sync::CancellationToken::new(), Arc::new(local))
                    .await
            })
        };
        let mut frames = Vec::new();
        for _ in 0..6 {
            match remote.recv().await.unwrap() {
                Some(SyncStreamItem::SendLogData(data)) => frames.push(data),
                other => panic!("unexpected {other:?}"),
            }
        }
        cmd.send_error_and_terminate(None);
        let _ = pump.await;

        assert_eq!(frames[0].metadata.map(|m| m.owner_opid), Some(3));
        let sizes: Vec<usize> = frames[1..4].iter().map(|f| f.chunk.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(frames[4].is_end());
        assert_eq!(frames[5].log_id, "missing");
        assert!(frames[5].is_end());
    }
}
