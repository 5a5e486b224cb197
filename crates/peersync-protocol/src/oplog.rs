/// Operation history collaborator.
///
/// The sync layer only needs the narrow [`OpLog`] trait. [`MemOpLog`] is a
/// complete in-memory implementation used by tests and embedders.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::{EventEmitter, SubscriptionId};
use crate::StoreError;

/// Per-subscriber buffer for op-log change events.
pub const OPLOG_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    #[default]
    Unknown,
    Pending,
    InProgress,
    Success,
    Warning,
    Error,
    SystemCancelled,
    UserCancelled,
}

/// One entry of operation history, e.g. a backup run or a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub flow_id: i64,
    pub modno: i64,
    /// Id on the instance that produced the operation, 0 if produced locally.
    #[serde(default)]
    pub original_id: i64,
    #[serde(default)]
    pub original_flow_id: i64,
    /// Key id of the producing instance, empty if produced locally.
    #[serde(default)]
    pub original_instance_keyid: String,
    pub instance_id: String,
    pub repo_id: String,
    pub repo_guid: String,
    pub plan_id: String,
    #[serde(default)]
    pub snapshot_id: String,
    #[serde(default)]
    pub unix_time_start_ms: i64,
    #[serde(default)]
    pub unix_time_end_ms: i64,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub display_message: String,
    #[serde(default)]
    pub logref: String,
}

impl Operation {
    pub fn metadata(&self) -> OpMetadata {
        OpMetadata {
            id: self.id,
            flow_id: self.flow_id,
            modno: self.modno,
            original_id: self.original_id,
            original_flow_id: self.original_flow_id,
            original_instance_keyid: self.original_instance_keyid.clone(),
            status: self.status,
        }
    }

    pub fn is_locally_originated(&self) -> bool {
        self.original_instance_keyid.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpMetadata {
    pub id: i64,
    pub flow_id: i64,
    pub modno: i64,
    pub original_id: i64,
    pub original_flow_id: i64,
    pub original_instance_keyid: String,
    pub status: OperationStatus,
}

/// Filter over operations. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub op_ids: Vec<i64>,
    pub plan_id: Option<String>,
    pub repo_guid: Option<String>,
    pub snapshot_id: Option<String>,
    pub flow_id: Option<i64>,
    pub instance_id: Option<String>,
    /// `Some("")` selects locally originated operations.
    pub original_instance_keyid: Option<String>,
    pub original_id: Option<i64>,
    pub original_flow_id: Option<i64>,
    pub modno_gte: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    pub reversed: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_ids(mut self, ids: Vec<i64>) -> Self {
        self.op_ids = ids;
        self
    }

    pub fn plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn repo_guid(mut self, guid: impl Into<String>) -> Self {
        self.repo_guid = Some(guid.into());
        self
    }

    pub fn snapshot_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn flow_id(mut self, flow_id: i64) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn original_instance_keyid(mut self, keyid: impl Into<String>) -> Self {
        self.original_instance_keyid = Some(keyid.into());
        self
    }

    pub fn original_id(mut self, id: i64) -> Self {
        self.original_id = Some(id);
        self
    }

    pub fn original_flow_id(mut self, id: i64) -> Self {
        self.original_flow_id = Some(id);
        self
    }

    pub fn modno_gte(mut self, modno: i64) -> Self {
        self.modno_gte = Some(modno);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    pub fn matches(&self, op: &Operation) -> bool {
        fn eq<T: PartialEq + ?Sized>(want: Option<&T>, got: &T) -> bool {
            want.map_or(true, |w| w == got)
        }

        (self.op_ids.is_empty() || self.op_ids.contains(&op.id))
            && eq(self.plan_id.as_deref(), op.plan_id.as_str())
            && eq(self.repo_guid.as_deref(), op.repo_guid.as_str())
            && eq(self.snapshot_id.as_deref(), op.snapshot_id.as_str())
            && eq(self.flow_id.as_ref(), &op.flow_id)
            && eq(self.instance_id.as_deref(), op.instance_id.as_str())
            && eq(
                self.original_instance_keyid.as_deref(),
                op.original_instance_keyid.as_str(),
            )
            && eq(self.original_id.as_ref(), &op.original_id)
            && eq(self.original_flow_id.as_ref(), &op.original_flow_id)
            && self.modno_gte.map_or(true, |m| op.modno >= m)
    }
}

/// Change notification from an [`OpLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpEvent {
    Added(Operation),
    Updated(Operation),
    Deleted(Operation),
}

impl OpEvent {
    pub fn operation(&self) -> &Operation {
        match self {
            OpEvent::Added(op) | OpEvent::Updated(op) | OpEvent::Deleted(op) => op,
        }
    }
}

/// Storage engine for operation history.
///
/// `add` assigns the id (and the flow id when it is 0). Modnos are assigned
/// by the log for locally originated operations; replicated operations keep
/// the modno they were stored with.
pub trait OpLog: Send + Sync {
    fn query(&self, query: &Query) -> Result<Vec<Operation>, StoreError>;
    fn query_metadata(&self, query: &Query) -> Result<Vec<OpMetadata>, StoreError>;
    /// First match, or [`StoreError::NoResults`].
    fn find_one_metadata(&self, query: &Query) -> Result<OpMetadata, StoreError>;
    /// [`StoreError::NotFound`] if absent.
    fn get(&self, id: i64) -> Result<Operation, StoreError>;
    fn add(&self, op: Operation) -> Result<Operation, StoreError>;
    fn update(&self, op: Operation) -> Result<Operation, StoreError>;
    /// Returns the removed operations. Unknown ids are skipped.
    fn delete(&self, ids: &[i64]) -> Result<Vec<Operation>, StoreError>;
    /// Highest id and highest modno among matching operations, `(0, 0)` if none.
    fn get_highest_op_id_and_modno(&self, query: &Query) -> Result<(i64, i64), StoreError>;
    fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<OpEvent>);
    fn unsubscribe(&self, id: SubscriptionId);
}

/// In-memory [`OpLog`].
pub struct MemOpLog {
    state: parking_lot::Mutex<MemState>,
    events: EventEmitter<OpEvent>,
}

struct MemState {
    ops: BTreeMap<i64, Operation>,
    next_id: i64,
    last_modno: i64,
}

impl Default for MemOpLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemOpLog {
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(MemState {
                ops: BTreeMap::new(),
                next_id: 1,
                last_modno: 0,
            }),
            events: EventEmitter::new(OPLOG_EVENT_BUFFER),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(state: &MemState, query: &Query) -> Vec<Operation> {
        let matching = state.ops.values().filter(|op| query.matches(op));
        let ordered: Vec<&Operation> = if query.reversed {
            matching.rev().collect()
        } else {
            matching.collect()
        };
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        ordered
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

impl OpLog for MemOpLog {
    fn query(&self, query: &Query) -> Result<Vec<Operation>, StoreError> {
        Ok(Self::select(&self.state.lock(), query))
    }

    fn query_metadata(&self, query: &Query) -> Result<Vec<OpMetadata>, StoreError> {
        let state = self.state.lock();
        Ok(Self::select(&state, query).iter().map(Operation::metadata).collect())
    }

    fn find_one_metadata(&self, query: &Query) -> Result<OpMetadata, StoreError> {
        let state = self.state.lock();
        state
            .ops
            .values()
            .find(|op| query.matches(op))
            .map(Operation::metadata)
            .ok_or(StoreError::NoResults)
    }

    fn get(&self, id: i64) -> Result<Operation, StoreError> {
        self.state
            .lock()
            .ops
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("operation {id}")))
    }

    fn add(&self, mut op: Operation) -> Result<Operation, StoreError> {
        if op.id != 0 {
            return Err(StoreError::Invalid(format!(
                "operation already has id {}, add assigns ids",
                op.id
            )));
        }
        {
            let mut state = self.state.lock();
            op.id = state.next_id;
            state.next_id += 1;
            if op.flow_id == 0 {
                op.flow_id = op.id;
            }
            if op.is_locally_originated() {
                state.last_modno += 1;
                op.modno = state.last_modno;
            }
            state.ops.insert(op.id, op.clone());
        }
        self.events.emit(OpEvent::Added(op.clone()));
        Ok(op)
    }

    fn update(&self, mut op: Operation) -> Result<Operation, StoreError> {
        if op.id == 0 {
            return Err(StoreError::Invalid("operation has no id, update needs one".into()));
        }
        {
            let mut state = self.state.lock();
            if !state.ops.contains_key(&op.id) {
                return Err(StoreError::NotFound(format!("operation {}", op.id)));
            }
            if op.flow_id == 0 {
                op.flow_id = op.id;
            }
            if op.is_locally_originated() {
                state.last_modno += 1;
                op.modno = state.last_modno;
            }
            state.ops.insert(op.id, op.clone());
        }
        self.events.emit(OpEvent::Updated(op.clone()));
        Ok(op)
    }

    fn delete(&self, ids: &[i64]) -> Result<Vec<Operation>, StoreError> {
        let removed: Vec<Operation> = {
            let mut state = self.state.lock();
            ids.iter().filter_map(|id| state.ops.remove(id)).collect()
        };
        for op in &removed {
            self.events.emit(OpEvent::Deleted(op.clone()));
        }
        Ok(removed)
    }

    fn get_highest_op_id_and_modno(&self, query: &Query) -> Result<(i64, i64), StoreError> {
        let state = self.state.lock();
        Ok(state
            .ops
            .values()
            .filter(|op| query.matches(op))
            .fold((0, 0), |(id, modno), op| (id.max(op.id), modno.max(op.modno))))
    }

    fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<OpEvent>) {
        self.events.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_op(plan: &str) -> Operation {
        Operation {
            instance_id: "local".into(),
            repo_id: "repo".into(),
            repo_guid: "guid".into(),
            plan_id: plan.into(),
            ..Default::default()
        }
    }

    #[test]
    fn add_assigns_id_flow_and_modno() {
        let log = MemOpLog::new();
        let a = log.add(local_op("p")).unwrap();
        let b = log.add(local_op("p")).unwrap();
        assert_eq!((a.id, a.flow_id), (1, 1));
        assert_eq!(b.id, 2);
        assert!(b.modno > a.modno);
        assert!(log.add(a).is_err());
    }

    #[test]
    fn replicated_ops_keep_modno() {
        let log = MemOpLog::new();
        let op = Operation {
            modno: 77,
            original_id: 5,
            original_instance_keyid: "ed25519.peer".into(),
            ..local_op("p")
        };
        let stored = log.add(op).unwrap();
        assert_eq!(stored.modno, 77);
        let updated = log.update(Operation { modno: 80, ..stored }).unwrap();
        assert_eq!(updated.modno, 80);
    }

    #[test]
    fn update_bumps_local_modno() {
        let log = MemOpLog::new();
        let op = log.add(local_op("p")).unwrap();
        let updated = log.update(op.clone()).unwrap();
        assert!(updated.modno > op.modno);
        assert!(matches!(
            log.update(Operation { id: 99, ..op }),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn query_filters_and_paginates() {
        let log = MemOpLog::new();
        for plan in ["a", "b", "a", "a"] {
            log.add(local_op(plan)).unwrap();
        }
        let q = Query::new().plan_id("a");
        assert_eq!(log.query(&q).unwrap().len(), 3);
        let page = log.query(&q.clone().reversed(true).limit(2)).unwrap();
        assert_eq!(page.iter().map(|op| op.id).collect::<Vec<_>>(), vec![4, 3]);
        let locals = Query::new().original_instance_keyid("");
        assert_eq!(log.query(&locals).unwrap().len(), 4);
    }

    #[test]
    fn find_one_reports_no_results() {
        let log = MemOpLog::new();
        assert!(matches!(
            log.find_one_metadata(&Query::new().original_id(3)),
            Err(StoreError::NoResults)
        ));
    }

    #[tokio::test]
    async fn changes_are_published() {
        let log = MemOpLog::new();
        let (_id, mut rx) = log.subscribe();
        let op = log.add(local_op("p")).unwrap();
        log.delete(&[op.id, 42]).unwrap();
        assert!(matches!(rx.recv().await, Some(OpEvent::Added(_))));
        assert!(matches!(rx.recv().await, Some(OpEvent::Deleted(d)) if d.id == op.id));
    }

    #[test]
    fn highest_id_and_modno() {
        let log = MemOpLog::new();
        assert_eq!(log.get_highest_op_id_and_modno(&Query::new()).unwrap(), (0, 0));
        log.add(local_op("p")).unwrap();
        let b = log.add(local_op("p")).unwrap();
        assert_eq!(
            log.get_highest_op_id_and_modno(&Query::new()).unwrap(),
            (b.id, b.modno)
        );
    }
}
