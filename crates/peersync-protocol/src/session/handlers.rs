/// Per-item handlers of an established session.
use std::time::Duration;

use crate::config::Peer;
use crate::identity::now_millis;
use crate::messages::{ConfigUpdate, DiffOperations, LogData, OpSelector, OperationEvent, ResourceList, SyncStreamItem};
use crate::oplog::Operation;
use crate::SyncError;

use super::diff;
use super::forward::{AnnouncedResources, Forwarder};
use super::logs;
use super::{Session, SessionRole};

impl Session {
    pub(super) async fn dispatch(
        &mut self,
        peer: &Peer,
        forwarder: &Forwarder,
        item: SyncStreamItem,
    ) -> Result<(), SyncError> {
        match item {
            SyncStreamItem::Handshake(_) => Err(SyncError::Protocol("unexpected handshake after authentication".into())),
            SyncStreamItem::Heartbeat => self.handle_heartbeat(peer),
            SyncStreamItem::DiffOperations(diff) => self.handle_diff(peer, forwarder, diff).await,
            SyncStreamItem::SendOperations(event) => {
                self.expect_role(SessionRole::Server, "send operations")?;
                self.handle_operations(peer, event)
            }
            SyncStreamItem::ReceiveOperations(event) => {
                self.expect_role(SessionRole::Client, "receive operations")?;
                self.handle_operations(peer, event)
            }
            SyncStreamItem::SendConfig(update) => {
                self.expect_role(SessionRole::Server, "send config")?;
                self.handle_config(peer, update)
            }
            SyncStreamItem::ReceiveConfig(update) => {
                self.expect_role(SessionRole::Client, "receive config")?;
                self.handle_config(peer, update)
            }
            SyncStreamItem::ListResources(resources) => {
                self.expect_role(SessionRole::Server, "list resources")?;
                self.handle_resources(peer, resources)
            }
            SyncStreamItem::ReceiveResources(resources) => {
                self.expect_role(SessionRole::Client, "receive resources")?;
                self.handle_resources(peer, resources)
            }
            SyncStreamItem::SetConfig(_) => Err(SyncError::Unimplemented(
                "changing configuration from a peer is not supported".into(),
            )),
            SyncStreamItem::RequestOperations { high_modno, .. } => {
                let forwarder = forwarder.clone();
                let config = self.snapshot.config.clone();
                self.spawn_task("sending requested operations", async move {
                    forwarder.catch_up(&config, high_modno).await
                });
                Ok(())
            }
            SyncStreamItem::Throttle { delay_ms } => {
                self.expect_role(SessionRole::Client, "throttle")?;
                if let Some(throttle) = &self.throttle {
                    tracing::info!("sync: {:?} asked to wait {delay_ms}ms between connections", peer.instance_id);
                    throttle.set_delay(Duration::from_millis(delay_ms));
                }
                Ok(())
            }
            SyncStreamItem::GetLog { log_id } => self.handle_get_log(forwarder, log_id),
            SyncStreamItem::SendLogData(data) => self.handle_log_data(peer, data),
            SyncStreamItem::Terminate { .. } => Err(SyncError::Protocol("unexpected terminate".into())),
        }
    }

    /// Directional items are only valid in one role.
    fn expect_role(&self, role: SessionRole, what: &str) -> Result<(), SyncError> {
        if self.role != role {
            return Err(SyncError::Protocol(format!("{what} is not valid on a {} session", self.role)));
        }
        Ok(())
    }

    /// A repo the peer announced, or a plan it announced when one is given.
    fn peer_announced(&self, repo_guid: &str, plan_id: Option<&str>) -> bool {
        self.peer_resources.read().covers(repo_guid, plan_id)
    }

    /// A repo or plan we announced to the peer, so its permissions allow the exchange.
    fn we_offered(&self, repo_guid: &str, plan_id: Option<&str>) -> bool {
        self.offered.covers(repo_guid, plan_id)
    }

    fn handle_heartbeat(&self, peer: &Peer) -> Result<(), SyncError> {
        self.deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |state| {
            state.last_heartbeat_millis = now_millis();
        })?;
        Ok(())
    }

    async fn handle_diff(&mut self, peer: &Peer, forwarder: &Forwarder, diff: DiffOperations) -> Result<(), SyncError> {
        let DiffOperations {
            have_operations_selector,
            have_operations_ids,
            have_operations_modnos,
            request_operations,
        } = diff;
        if have_operations_selector.is_none() && request_operations.is_empty() {
            return Err(SyncError::Protocol(
                "diff carries neither a selector nor requested operations".into(),
            ));
        }
        if let Some(selector) = have_operations_selector {
            self.handle_have_diff(peer, &selector, &have_operations_ids, &have_operations_modnos)
                .await?;
        }
        if !request_operations.is_empty() {
            let forwarder = forwarder.clone();
            self.spawn_task("sending requested operations", async move {
                forwarder.serve_request(&request_operations).await
            });
        }
        Ok(())
    }

    /// Compare the peer's list of its operations with our copies and request
    /// whatever differs.
    async fn handle_have_diff(
        &self,
        peer: &Peer,
        selector: &OpSelector,
        ids: &[i64],
        modnos: &[i64],
    ) -> Result<(), SyncError> {
        if selector.instance_id != peer.instance_id || selector.original_instance_keyid != peer.keyid {
            return Err(SyncError::Auth(format!(
                "selector names instance {:?} with key {:?}, peer is {:?} with key {:?}",
                selector.instance_id, selector.original_instance_keyid, peer.instance_id, peer.keyid
            )));
        }
        if !self.peer_announced(&selector.repo_guid, selector.plan_id.as_deref()) {
            return Err(SyncError::Auth(format!(
                "repo {:?} was not announced by the peer",
                selector.repo_guid
            )));
        }
        if !self.we_offered(&selector.repo_guid, selector.plan_id.as_deref()) {
            return Err(SyncError::Auth(format!(
                "peer has no access to repo {:?}",
                selector.repo_guid
            )));
        }
        let remote = diff::sorted_pairs(ids, modnos).ok_or_else(|| {
            SyncError::Protocol(format!(
                "operation ids and modnos must be the same length, got {} and {}",
                ids.len(),
                modnos.len()
            ))
        })?;

        let mut local: Vec<(i64, i64)> = self
            .deps
            .oplog
            .query_metadata(&selector.to_query())?
            .into_iter()
            .filter(|m| m.original_id != 0)
            .map(|m| (m.original_id, m.modno))
            .collect();
        local.sort_unstable();

        let request = diff::ids_to_request(&local, &remote);
        if request.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "sync: requesting {} operations from {:?} for repo {}",
            request.len(),
            peer.instance_id,
            selector.repo_guid
        );
        self.cmd
            .send(SyncStreamItem::DiffOperations(DiffOperations {
                request_operations: request,
                ..Default::default()
            }))
            .await;
        Ok(())
    }

    fn check_incoming(&self, peer: &Peer, op: &Operation) -> Result<(), SyncError> {
        if op.instance_id != peer.instance_id {
            return Err(SyncError::Auth(format!(
                "operation {} claims instance {:?}, peer is {:?}",
                op.id, op.instance_id, peer.instance_id
            )));
        }
        if !self.peer_announced(&op.repo_guid, Some(&op.plan_id)) {
            return Err(SyncError::Auth(format!(
                "operation {} is for repo {:?} which the peer did not announce",
                op.id, op.repo_guid
            )));
        }
        if !self.we_offered(&op.repo_guid, Some(&op.plan_id)) {
            return Err(SyncError::Auth(format!(
                "operation {} is for repo {:?} which the peer has no access to",
                op.id, op.repo_guid
            )));
        }
        Ok(())
    }

    fn handle_operations(&self, peer: &Peer, event: OperationEvent) -> Result<(), SyncError> {
        let (ops, is_update) = match event {
            OperationEvent::KeepAlive => return Ok(()),
            OperationEvent::CreatedOperations(ops) => (ops, false),
            OperationEvent::UpdatedOperations(ops) => (ops, true),
            OperationEvent::DeletedOperations(ids) => {
                for id in ids {
                    self.deps.mapper.delete_by_original_id(&peer.keyid, id)?;
                }
                return Ok(());
            }
        };
        for op in &ops {
            self.check_incoming(peer, op)?;
        }
        for op in ops {
            self.deps.mapper.insert_or_update(&peer.keyid, op, is_update)?;
        }
        Ok(())
    }

    fn handle_config(&self, peer: &Peer, update: ConfigUpdate) -> Result<(), SyncError> {
        let Some(config) = update.config else {
            return Err(SyncError::Protocol("config update carries no config".into()));
        };
        tracing::debug!(
            "sync: {:?} shared config modno {} ({} repos, {} plans)",
            peer.instance_id,
            config.modno,
            config.repos.len(),
            config.plans.len()
        );
        self.deps.remote_configs.update(&peer.instance_id, config.clone())?;
        self.deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |state| {
            state.remote_config = Some(config.clone());
        })?;
        Ok(())
    }

    /// Each announcement replaces the previous one.
    fn handle_resources(&mut self, peer: &Peer, resources: ResourceList) -> Result<(), SyncError> {
        *self.peer_resources.write() = AnnouncedResources::from_list(&resources);
        self.deps.peer_states.update(&peer.keyid, &peer.instance_id, &mut |state| {
            state.known_repos = resources.repos.iter().map(|r| (r.id.clone(), r.clone())).collect();
            state.known_plans = resources.plans.iter().map(|p| (p.id.clone(), p.clone())).collect();
        })?;
        Ok(())
    }

    fn handle_get_log(&self, forwarder: &Forwarder, log_id: String) -> Result<(), SyncError> {
        if log_id.is_empty() {
            return Err(SyncError::Protocol("log id is required".into()));
        }
        // Only logs of operations the peer may read are served.
        if let Ok(metadata) = self.deps.log_store.get_metadata(&log_id) {
            let readable = self
                .deps
                .oplog
                .get(metadata.owner_opid)
                .is_ok_and(|op| forwarder.is_own(&op) && forwarder.peer_can_read(&op));
            if !readable {
                return Err(SyncError::Auth(format!("log {log_id:?} belongs to an operation the peer may not read")));
            }
        }
        let cmd = self.cmd.clone();
        let store = self.deps.log_store.clone();
        let chunk_size = self.deps.settings.log_chunk_size;
        self.spawn_task("sending log", async move {
            logs::upload_log(&cmd, store.as_ref(), &log_id, chunk_size).await
        });
        Ok(())
    }

    fn handle_log_data(&mut self, peer: &Peer, data: LogData) -> Result<(), SyncError> {
        let mapper = self.deps.mapper.clone();
        let store = self.deps.log_store.clone();
        let keyid = peer.keyid.clone();
        self.incoming_logs.receive(store.as_ref(), data, |owner_opid| {
            mapper
                .translate_op_id_and_flow_id(&keyid, owner_opid, 0)
                .map(|(local_id, _)| local_id)
                .map_err(|e| SyncError::from(e).context("translating log owner"))
        })
    }
}
