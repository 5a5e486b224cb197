/// Sync stream wire model.
///
/// Every frame on a sync stream is one [`SyncStreamItem`], encoded as a
/// length-prefixed MessagePack map by the tunnel framing layer. The first
/// item in each direction must be a [`SyncStreamItem::Handshake`].
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::{Plan, RemoteConfig, Repo};
use crate::error::RpcCode;
use crate::identity::{PublicKeyInfo, SignedMessage};
use crate::oplog::{Operation, Query};

pub const SYNC_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    /// Signed instance id of the sender.
    pub instance_id: SignedMessage,
    pub public_key: PublicKeyInfo,
}

/// Scope of a have-diff: the sender's operations for one repo, optionally one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSelector {
    pub instance_id: String,
    pub original_instance_keyid: String,
    pub repo_guid: String,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl OpSelector {
    /// Query selecting the receiver's copies of the selected operations.
    pub fn to_query(&self) -> Query {
        let mut query = Query::new()
            .instance_id(self.instance_id.clone())
            .original_instance_keyid(self.original_instance_keyid.clone())
            .repo_guid(self.repo_guid.clone());
        if let Some(plan_id) = &self.plan_id {
            query = query.plan_id(plan_id.clone());
        }
        query
    }
}

/// Either a have-diff (selector plus id/modno pairs) or a request for ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOperations {
    #[serde(default)]
    pub have_operations_selector: Option<OpSelector>,
    #[serde(default)]
    pub have_operations_ids: Vec<i64>,
    #[serde(default)]
    pub have_operations_modnos: Vec<i64>,
    #[serde(default)]
    pub request_operations: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationEvent {
    KeepAlive,
    CreatedOperations(Vec<Operation>),
    UpdatedOperations(Vec<Operation>),
    /// Ids as known to the sender.
    DeletedOperations(Vec<i64>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub id: String,
    pub guid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub id: String,
}

/// Ids and guids a peer may see. Carries no secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub repos: Vec<RepoMetadata>,
    #[serde(default)]
    pub plans: Vec<PlanMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub config: Option<RemoteConfig>,
}

/// Remote write of repos and plans. Always rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfig {
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub repos_to_delete: Vec<String>,
    #[serde(default)]
    pub plans_to_delete: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub owner_opid: i64,
    pub expiration_ts_unix: i64,
}

/// One frame of a log upload: metadata first, then chunks, then an empty end frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogData {
    pub log_id: String,
    #[serde(default)]
    pub metadata: Option<LogMetadata>,
    #[serde(default)]
    pub chunk: Bytes,
}

impl LogData {
    pub fn is_end(&self) -> bool {
        self.metadata.is_none() && self.chunk.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStreamItem {
    Handshake(Handshake),
    Heartbeat,
    DiffOperations(DiffOperations),
    /// Client to server operation events.
    SendOperations(OperationEvent),
    /// Server to client operation events.
    ReceiveOperations(OperationEvent),
    SendConfig(ConfigUpdate),
    ReceiveConfig(ConfigUpdate),
    SetConfig(SetConfig),
    ListResources(ResourceList),
    ReceiveResources(ResourceList),
    RequestOperations { high_opid: i64, high_modno: i64 },
    Throttle { delay_ms: u64 },
    GetLog { log_id: String },
    SendLogData(LogData),
    /// Last frame of a session that ended with an error.
    Terminate { code: RpcCode, message: String },
}

impl SyncStreamItem {
    /// Action name used in error context.
    pub fn name(&self) -> &'static str {
        match self {
            SyncStreamItem::Handshake(_) => "handshake",
            SyncStreamItem::Heartbeat => "heartbeat",
            SyncStreamItem::DiffOperations(_) => "diff operations",
            SyncStreamItem::SendOperations(_) => "send operations",
            SyncStreamItem::ReceiveOperations(_) => "receive operations",
            SyncStreamItem::SendConfig(_) => "send config",
            SyncStreamItem::ReceiveConfig(_) => "receive config",
            SyncStreamItem::SetConfig(_) => "set config",
            SyncStreamItem::ListResources(_) => "list resources",
            SyncStreamItem::ReceiveResources(_) => "receive resources",
            SyncStreamItem::RequestOperations { .. } => "request operations",
            SyncStreamItem::Throttle { .. } => "throttle",
            SyncStreamItem::GetLog { .. } => "get log",
            SyncStreamItem::SendLogData(_) => "send log data",
            SyncStreamItem::Terminate { .. } => "terminate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_roundtrips_through_msgpack() {
        let item = SyncStreamItem::DiffOperations(DiffOperations {
            have_operations_selector: Some(OpSelector {
                instance_id: "a".into(),
                original_instance_keyid: "ed25519.a".into(),
                repo_guid: "guid".into(),
                plan_id: None,
            }),
            have_operations_ids: vec![1, 2],
            have_operations_modnos: vec![5, 6],
            request_operations: vec![],
        });
        let bytes = rmp_serde::to_vec_named(&item).unwrap();
        let decoded: SyncStreamItem = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn selector_query_scopes_plan() {
        let sel = OpSelector {
            instance_id: "a".into(),
            original_instance_keyid: "ed25519.a".into(),
            repo_guid: "guid".into(),
            plan_id: Some("daily".into()),
        };
        let q = sel.to_query();
        assert_eq!(q.plan_id.as_deref(), Some("daily"));
        assert_eq!(q.original_instance_keyid.as_deref(), Some("ed25519.a"));
    }

    #[test]
    fn end_frame() {
        assert!(LogData::default().is_end());
        let meta = LogData {
            metadata: Some(LogMetadata::default()),
            ..Default::default()
        };
        assert!(!meta.is_end());
    }
}
