/// Forwarding of our own operations to a peer.
///
/// An operation is ours when it was produced locally and carries the local
/// instance id. It is only sent if the peer's grants cover its plan or repo
/// and the peer announced that repo or plan itself.
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command_stream::CommandStream;
use crate::config::Config;
use crate::events::SubscriptionId;
use crate::messages::{DiffOperations, OpSelector, OperationEvent, ResourceList, SyncStreamItem};
use crate::oplog::{OpEvent, OpLog, Operation, Query};
use crate::permissions::{PermissionSet, PERMS_CAN_VIEW_OPERATIONS};
use crate::{StoreError, SyncError};

use super::SessionRole;

/// Repo guids and plan ids from one side's resource list.
#[derive(Debug, Default, Clone)]
pub(crate) struct AnnouncedResources {
    repo_guids: HashSet<String>,
    plan_ids: HashSet<String>,
}

impl AnnouncedResources {
    pub(crate) fn from_list(list: &ResourceList) -> Self {
        Self {
            repo_guids: list.repos.iter().map(|r| r.guid.clone()).collect(),
            plan_ids: list.plans.iter().map(|p| p.id.clone()).collect(),
        }
    }

    /// The repo, or the plan when one is given.
    pub(crate) fn covers(&self, repo_guid: &str, plan_id: Option<&str>) -> bool {
        self.repo_guids.contains(repo_guid) || plan_id.is_some_and(|id| self.plan_ids.contains(id))
    }
}

pub(crate) type SharedResources = Arc<parking_lot::RwLock<AnnouncedResources>>;

#[derive(Clone)]
pub(crate) struct Forwarder {
    pub(crate) oplog: Arc<dyn OpLog>,
    pub(crate) cmd: Arc<CommandStream>,
    pub(crate) permissions: PermissionSet,
    /// What the peer announced. It refuses anything outside it.
    pub(crate) peer_resources: SharedResources,
    pub(crate) role: SessionRole,
    pub(crate) local_instance: String,
    pub(crate) local_keyid: String,
    pub(crate) batch_size: usize,
}

impl Forwarder {
    pub(crate) fn is_own(&self, op: &Operation) -> bool {
        op.is_locally_originated() && op.instance_id == self.local_instance
    }

    pub(crate) fn peer_can_read(&self, op: &Operation) -> bool {
        self.permissions.check_plan(&op.plan_id, PERMS_CAN_VIEW_OPERATIONS)
            || self.permissions.check_repo(&op.repo_id, PERMS_CAN_VIEW_OPERATIONS)
    }

    fn forwardable(&self, op: &Operation) -> bool {
        self.is_own(op) && self.peer_can_read(op) && self.peer_accepts(&op.repo_guid, Some(&op.plan_id))
    }

    fn peer_accepts(&self, repo_guid: &str, plan_id: Option<&str>) -> bool {
        self.peer_resources.read().covers(repo_guid, plan_id)
    }

    async fn send_created(&self, ops: Vec<Operation>) {
        for batch in ops.chunks(self.batch_size) {
            self.cmd
                .send(self.role.operations_item(OperationEvent::CreatedOperations(batch.to_vec())))
                .await;
        }
    }

    /// Answer a request for operations by id.
    ///
    /// Ids we no longer hold are reported as deleted so the peer drops its copy.
    pub(crate) async fn serve_request(&self, ids: &[i64]) -> Result<(), SyncError> {
        let mut found = Vec::new();
        let mut deleted = Vec::new();
        for &id in ids {
            match self.oplog.get(id) {
                Ok(op) if self.forwardable(&op) => found.push(op),
                Ok(_) => tracing::debug!("sync: peer requested operation {id} it may not read, skipping"),
                Err(StoreError::NotFound(_)) => deleted.push(id),
                Err(e) => tracing::warn!("sync: loading requested operation {id}: {e}"),
            }
        }
        self.send_created(found).await;
        if !deleted.is_empty() {
            self.cmd
                .send(self.role.operations_item(OperationEvent::DeletedOperations(deleted)))
                .await;
        }
        Ok(())
    }

    /// Bring the peer up to date: everything newer than `high_modno`, then a
    /// have-diff per readable repo, then per readable plan whose repo is not.
    pub(crate) async fn catch_up(&self, config: &Config, high_modno: i64) -> Result<(), SyncError> {
        let newer = self.oplog.query(
            &Query::new()
                .original_instance_keyid("")
                .instance_id(self.local_instance.clone())
                .modno_gte(high_modno.saturating_add(1)),
        )?;
        let newer: Vec<Operation> = newer.into_iter().filter(|op| self.forwardable(op)).collect();
        if !newer.is_empty() {
            tracing::debug!("sync: sending {} operations newer than modno {high_modno}", newer.len());
        }
        self.send_created(newer).await;

        for repo in &config.repos {
            if !self.permissions.check_repo(&repo.id, PERMS_CAN_VIEW_OPERATIONS) || !self.peer_accepts(&repo.guid, None)
            {
                continue;
            }
            self.send_have_diff(&repo.guid, None).await?;
        }
        for plan in &config.plans {
            if !self.permissions.check_plan(&plan.id, PERMS_CAN_VIEW_OPERATIONS)
                || self.permissions.check_repo(&plan.repo, PERMS_CAN_VIEW_OPERATIONS)
            {
                continue;
            }
            let Some(repo) = config.repo(&plan.repo) else {
                tracing::warn!("sync: plan {} refers to unknown repo {}", plan.id, plan.repo);
                continue;
            };
            if !self.peer_accepts(&repo.guid, Some(&plan.id)) {
                continue;
            }
            self.send_have_diff(&repo.guid, Some(plan.id.clone())).await?;
        }
        Ok(())
    }

    async fn send_have_diff(&self, repo_guid: &str, plan_id: Option<String>) -> Result<(), SyncError> {
        let selector = OpSelector {
            instance_id: self.local_instance.clone(),
            original_instance_keyid: self.local_keyid.clone(),
            repo_guid: repo_guid.to_string(),
            plan_id,
        };
        let mut query = Query::new()
            .original_instance_keyid("")
            .instance_id(self.local_instance.clone())
            .repo_guid(repo_guid);
        if let Some(plan_id) = &selector.plan_id {
            query = query.plan_id(plan_id.clone());
        }
        let metadata = self.oplog.query_metadata(&query)?;
        let (ids, modnos): (Vec<i64>, Vec<i64>) = metadata.iter().map(|m| (m.id, m.modno)).unzip();
        self.cmd
            .send(SyncStreamItem::DiffOperations(DiffOperations {
                have_operations_selector: Some(selector),
                have_operations_ids: ids,
                have_operations_modnos: modnos,
                request_operations: Vec::new(),
            }))
            .await;
        Ok(())
    }

    /// Forward op-log changes until cancelled. A full send queue ends the session.
    pub(crate) async fn forward_live(
        self,
        cancel: CancellationToken,
        subscription: SubscriptionId,
        mut events: mpsc::Receiver<OpEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.forwardable(event.operation()) {
                continue;
            }
            let event = match event {
                OpEvent::Added(op) => OperationEvent::CreatedOperations(vec![op]),
                OpEvent::Updated(op) => OperationEvent::UpdatedOperations(vec![op]),
                OpEvent::Deleted(op) => OperationEvent::DeletedOperations(vec![op.id]),
            };
            if !self.cmd.try_send(self.role.operations_item(event)) {
                tracing::warn!("sync: operation send buffer overflow, dropping session");
                self.cmd.send_error_and_terminate(Some(SyncError::Disconnected(
                    "operation send buffer overflow".into(),
                )));
                break;
            }
        }
        self.oplog.unsubscribe(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_tunnel::FrameStream;
    use crate::config::{Permission, PermissionType, Plan, Repo};
    use crate::messages::{PlanMetadata, RepoMetadata};
    use crate::oplog::MemOpLog;

    fn announcing(repos: &[&str], plans: &[&str]) -> SharedResources {
        let list = ResourceList {
            repos: repos
                .iter()
                .map(|id| RepoMetadata {
                    id: id.to_string(),
                    guid: format!("{id}-guid"),
                })
                .collect(),
            plans: plans.iter().map(|id| PlanMetadata { id: id.to_string() }).collect(),
        };
        Arc::new(parking_lot::RwLock::new(AnnouncedResources::from_list(&list)))
    }

    fn forwarder(oplog: Arc<dyn OpLog>, scopes: &[&str]) -> Forwarder {
        let permissions = PermissionSet::new(&[Permission {
            kind: PermissionType::ReadOperations,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }])
        .unwrap();
        Forwarder {
            oplog,
            cmd: Arc::new(CommandStream::default()),
            permissions,
            peer_resources: announcing(&["photos", "docs"], &[]),
            role: SessionRole::Server,
            local_instance: "home".into(),
            local_keyid: "ed25519.home".into(),
            batch_size: 2,
        }
    }

    fn op(repo: &str, plan: &str) -> Operation {
        Operation {
            instance_id: "home".into(),
            repo_id: repo.into(),
            repo_guid: format!("{repo}-guid"),
            plan_id: plan.into(),
            ..Default::default()
        }
    }

    // Drains queued items without a connected stream.
    async fn queued(fwd: &Forwarder, timeout_ms: u64) -> Vec<SyncStreamItem> {
        let (local, remote) = peersync_tunnel::memory_pair::<SyncStreamItem>(64);
        let cmd = fwd.cmd.clone();
        let pump = tokio::spawn(async move {
            cmd.connect_stream(CancellationToken::new(), Arc::new(local)).await
        });
        let mut items = Vec::new();
        while let Ok(Ok(Some(item))) =
            tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), remote.recv()).await
        {
            items.push(item);
        }
        fwd.cmd.send_error_and_terminate(None);
        let _ = pump.await;
        items
    }

    #[test]
    fn ownership_and_grants() {
        let fwd = forwarder(Arc::new(MemOpLog::new()), &["repo:photos"]);
        assert!(fwd.forwardable(&op("photos", "daily")));
        assert!(!fwd.forwardable(&op("docs", "daily")));

        let mut replicated = op("photos", "daily");
        replicated.original_instance_keyid = "ed25519.other".into();
        assert!(!fwd.forwardable(&replicated));

        let mut renamed = op("photos", "daily");
        renamed.instance_id = "old-name".into();
        assert!(!fwd.forwardable(&renamed));
    }

    #[tokio::test]
    async fn request_batches_found_and_reports_missing() {
        let oplog = Arc::new(MemOpLog::new());
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(oplog.add(op("photos", "daily")).unwrap().id);
        }
        let hidden = oplog.add(op("docs", "daily")).unwrap().id;
        let fwd = forwarder(oplog, &["repo:photos"]);

        let mut request = ids.clone();
        request.push(hidden);
        request.push(999);
        fwd.serve_request(&request).await.unwrap();

        let items = queued(&fwd, 50).await;
        assert_eq!(items.len(), 3);
        let SyncStreamItem::ReceiveOperations(OperationEvent::CreatedOperations(first)) = &items[0] else {
            panic!("unexpected {:?}", items[0]);
        };
        assert_eq!(first.len(), 2);
        assert_eq!(
            items[2],
            SyncStreamItem::ReceiveOperations(OperationEvent::DeletedOperations(vec![999]))
        );
    }

    #[tokio::test]
    async fn catch_up_sends_newer_then_diffs() {
        let oplog = Arc::new(MemOpLog::new());
        oplog.add(op("photos", "daily")).unwrap();
        oplog.add(op("docs", "weekly")).unwrap();
        let fwd = forwarder(oplog, &["repo:photos", "plan:weekly"]);
        let config = Config {
            instance: "home".into(),
            repos: vec![
                Repo { id: "photos".into(), guid: "photos-guid".into(), uri: String::new() },
                Repo { id: "docs".into(), guid: "docs-guid".into(), uri: String::new() },
            ],
            plans: vec![
                Plan { id: "daily".into(), repo: "photos".into() },
                Plan { id: "weekly".into(), repo: "docs".into() },
            ],
            ..Default::default()
        };

        fwd.catch_up(&config, 0).await.unwrap();
        let items = queued(&fwd, 50).await;
        assert_eq!(items.len(), 3);
        assert!(matches!(
            &items[0],
            SyncStreamItem::ReceiveOperations(OperationEvent::CreatedOperations(ops)) if ops.len() == 2
        ));
        let SyncStreamItem::DiffOperations(repo_diff) = &items[1] else {
            panic!("unexpected {:?}", items[1]);
        };
        let selector = repo_diff.have_operations_selector.as_ref().unwrap();
        assert_eq!(selector.repo_guid, "photos-guid");
        assert_eq!(selector.plan_id, None);
        assert_eq!(repo_diff.have_operations_ids.len(), 1);

        let SyncStreamItem::DiffOperations(plan_diff) = &items[2] else {
            panic!("unexpected {:?}", items[2]);
        };
        let selector = plan_diff.have_operations_selector.as_ref().unwrap();
        assert_eq!(selector.repo_guid, "docs-guid");
        assert_eq!(selector.plan_id.as_deref(), Some("weekly"));
    }

    #[tokio::test]
    async fn nothing_is_sent_for_resources_the_peer_did_not_announce() {
        let oplog = Arc::new(MemOpLog::new());
        oplog.add(op("photos", "daily")).unwrap();
        oplog.add(op("docs", "weekly")).unwrap();
        let mut fwd = forwarder(oplog, &["*"]);
        fwd.peer_resources = announcing(&["photos"], &[]);
        assert!(fwd.forwardable(&op("photos", "daily")));
        assert!(!fwd.forwardable(&op("docs", "weekly")));

        let config = Config {
            instance: "home".into(),
            repos: vec![
                Repo { id: "photos".into(), guid: "photos-guid".into(), uri: String::new() },
                Repo { id: "docs".into(), guid: "docs-guid".into(), uri: String::new() },
            ],
            ..Default::default()
        };
        fwd.catch_up(&config, 0).await.unwrap();
        let items = queued(&fwd, 50).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            SyncStreamItem::ReceiveOperations(OperationEvent::CreatedOperations(ops))
                if ops.len() == 1 && ops[0].repo_guid == "photos-guid"
        ));
        let SyncStreamItem::DiffOperations(diff) = &items[1] else {
            panic!("unexpected {:?}", items[1]);
        };
        assert_eq!(diff.have_operations_selector.as_ref().unwrap().repo_guid, "photos-guid");
    }
}
