//! Server side of the Inbetweenies protocol.
//!
//! One handler per phase. `request` applies the client's changes and
//! returns the delta the client is missing; `push` applies follow-up
//! batches without computing a delta; `ack` records the client's final
//! clock. Conflicts are reported, never raised as errors.

use crate::models::sync::metadata_keys;
use crate::models::{
    ChangeKind, Conflict, Entity, FailedChange, ResolutionMode, SyncChange, SyncRequest,
    SyncResponse, VectorClock, PROTOCOL_VERSION,
};
use crate::services::GraphService;
use crate::sync::conflict::{classify, resolve, Disposition};
use crate::sync::wire_changes;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

/// Server-side sync service.
pub struct SyncService {
    graph: Arc<GraphService>,
    /// Writer id this service stamps on merged versions.
    device_id: String,
    /// Maximum change records per response.
    batch_max: usize,
}

impl SyncService {
    /// Creates a sync service over a graph service.
    #[must_use]
    pub fn new(graph: Arc<GraphService>, device_id: impl Into<String>, batch_max: usize) -> Self {
        Self {
            graph,
            device_id: device_id.into(),
            batch_max: batch_max.max(1),
        }
    }

    /// Handles the `request` phase: apply the client's changes, then return
    /// the delta for its clock (batched, with a cursor when truncated).
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub fn handle_request(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.check_protocol(request)?;

        let (conflicts, failed) = self.apply_changes(request);
        let (changes, cursor) = self.delta_for(&request.vector_clock, request.cursor.as_deref())?;
        let vector_clock = self.commit_clock(&request.vector_clock)?;

        metrics::counter!("homegraph_sync_requests_total").increment(1);
        if !conflicts.is_empty() {
            metrics::counter!("homegraph_sync_conflicts_total")
                .increment(conflicts.len() as u64);
        }

        Ok(SyncResponse {
            vector_clock,
            changes,
            conflicts,
            resolution_mode: request.resolution_mode,
            cursor,
            failed,
        })
    }

    /// Handles the `push` phase: apply a follow-up batch, return no delta.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub fn handle_push(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.check_protocol(request)?;
        let (conflicts, failed) = self.apply_changes(request);
        let vector_clock = self.commit_clock(&request.vector_clock)?;
        Ok(SyncResponse {
            vector_clock,
            changes: Vec::new(),
            conflicts,
            resolution_mode: request.resolution_mode,
            cursor: None,
            failed,
        })
    }

    /// Handles the `ack` phase: the client confirms it applied the delta.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub fn handle_ack(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.check_protocol(request)?;
        let vector_clock = self.commit_clock(&request.vector_clock)?;
        Ok(SyncResponse {
            vector_clock,
            changes: Vec::new(),
            conflicts: Vec::new(),
            resolution_mode: request.resolution_mode,
            cursor: None,
            failed: None,
        })
    }

    /// Returns this replica's clock: every stored version folded in.
    pub fn current_clock(&self) -> Result<VectorClock> {
        replica_clock(self.graph.as_ref())
    }

    fn check_protocol(&self, request: &SyncRequest) -> Result<()> {
        if request.protocol_version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(Error::ProtocolMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                got: request.protocol_version.clone(),
            })
        }
    }

    /// Applies the request's changes in order. Stops at the first failure
    /// and reports it as a marker; everything before it stays applied.
    fn apply_changes(&self, request: &SyncRequest) -> (Vec<Conflict>, Option<FailedChange>) {
        let mut conflicts = Vec::new();

        for (index, change) in request.changes.iter().enumerate() {
            let applied = self.apply_one(change, request.resolution_mode, &mut conflicts);
            if let Err(e) = applied {
                tracing::warn!(index, error = %e, "sync change failed to apply");
                return (
                    conflicts,
                    Some(FailedChange {
                        index,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }),
                );
            }
        }
        (conflicts, None)
    }

    fn apply_one(
        &self,
        change: &SyncChange,
        mode: ResolutionMode,
        conflicts: &mut Vec<Conflict>,
    ) -> Result<()> {
        if let Some(entity) = &change.entity {
            return self.apply_entity_change(entity, mode, conflicts);
        }
        if let Some(relationship) = &change.relationship {
            return match change.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    self.graph.apply_remote_relationship(relationship)
                },
                ChangeKind::Delete => {
                    // Deleting an unknown edge is an idempotent no-op.
                    self.graph.delete_relationship(&relationship.id).map(|_| ())
                },
            };
        }
        Err(Error::InvalidArgument(
            "change record carries neither entity nor relationship".to_string(),
        ))
    }

    fn apply_entity_change(
        &self,
        incoming: &Entity,
        mode: ResolutionMode,
        conflicts: &mut Vec<Conflict>,
    ) -> Result<()> {
        let Some(local) = self.graph.get_entity(&incoming.id, None)? else {
            return self.graph.apply_remote_entity(incoming);
        };

        // Tombstoning an already-deleted entity is a silent no-op.
        if incoming.is_tombstone() && local.is_tombstone() {
            return Ok(());
        }

        let history = self.graph.get_history(&incoming.id)?;
        match classify(&local, incoming, &history) {
            Disposition::LinearUpdate => self.graph.apply_remote_entity(incoming),
            Disposition::Subsumed => Ok(()),
            Disposition::Diverged => {
                let resolution = resolve(&local, incoming, mode, &self.device_id);
                if let Some(entity) = resolution.store {
                    self.graph.apply_remote_entity(&entity)?;
                }
                conflicts.push(resolution.conflict);
                Ok(())
            },
        }
    }

    /// Computes the delta for the peer's clock, batched. The cursor is the
    /// offset into the (deterministically ordered) change list.
    fn delta_for(
        &self,
        peer_clock: &VectorClock,
        cursor: Option<&str>,
    ) -> Result<(Vec<SyncChange>, Option<String>)> {
        let change_set = self.graph.store().changes_since(peer_clock)?;
        let all = wire_changes(change_set);

        let offset: usize = cursor
            .map(str::parse)
            .transpose()
            .map_err(|_| Error::InvalidArgument(format!("malformed cursor {cursor:?}")))?
            .unwrap_or(0);

        let page: Vec<SyncChange> = all.iter().skip(offset).take(self.batch_max).cloned().collect();
        let next = (offset + page.len() < all.len()).then(|| (offset + page.len()).to_string());
        Ok((page, next))
    }

    /// Recomputes this replica's clock, merges the peer's, and persists the
    /// result together with the exchange timestamp.
    fn commit_clock(&self, peer_clock: &VectorClock) -> Result<VectorClock> {
        let mut clock = self.current_clock()?;
        clock.merge(peer_clock);

        let store = self.graph.store();
        store.put_sync_metadata(
            metadata_keys::VECTOR_CLOCK,
            &serde_json::to_string(&clock).map_err(|e| Error::OperationFailed {
                operation: "encode_vector_clock".to_string(),
                cause: e.to_string(),
            })?,
        )?;
        store.put_sync_metadata(metadata_keys::LAST_SYNC_TIME, &Utc::now().to_rfc3339())?;
        store.put_sync_metadata(metadata_keys::DEVICE_ID, &self.device_id)?;
        Ok(clock)
    }
}

/// Folds every stored version into a clock. This is the replica's frontier
/// regardless of how the versions arrived (sync, tools, imports).
pub fn replica_clock(graph: &GraphService) -> Result<VectorClock> {
    let everything = graph.store().changes_since(&VectorClock::new())?;
    let mut clock = VectorClock::new();
    for entity in &everything.entities {
        clock.observe(&entity.version);
    }
    Ok(clock)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{EntityType, SourceType, Value, ValueMap};
    use crate::storage::InMemoryGraphStore;

    fn server() -> SyncService {
        let graph = Arc::new(GraphService::new(Arc::new(InMemoryGraphStore::new())).unwrap());
        SyncService::new(graph, "server", 1000)
    }

    fn request_with(changes: Vec<SyncChange>) -> SyncRequest {
        let mut req = SyncRequest::new("client-1", "u1");
        req.changes = changes;
        req
    }

    #[test]
    fn test_protocol_mismatch_is_hard_error() {
        let svc = server();
        let mut req = SyncRequest::new("client-1", "u1");
        req.protocol_version = "inbetweenies-v1".to_string();
        let err = svc.handle_request(&req).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_applies_and_returns_clock() {
        let svc = server();
        let entity = Entity::new(EntityType::Room, "Kitchen", ValueMap::new(), "u1");
        let mut req = request_with(vec![SyncChange::entity(ChangeKind::Create, entity.clone())]);
        req.vector_clock.observe(&entity.version);

        let resp = svc.handle_request(&req).unwrap();
        assert!(resp.conflicts.is_empty());
        assert!(resp.failed.is_none());
        assert!(resp.vector_clock.has_seen(&entity.version));
        // Client already holds its own write, so no delta comes back.
        assert!(resp.changes.is_empty());

        let stored = svc.graph.get_entity(&entity.id, None).unwrap().unwrap();
        assert_eq!(stored.name, "Kitchen");
    }

    #[test]
    fn test_delta_sent_for_stale_clock() {
        let svc = server();
        svc.graph
            .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "srv", SourceType::Manual)
            .unwrap();

        let resp = svc.handle_request(&SyncRequest::new("client-1", "u1")).unwrap();
        assert_eq!(resp.changes.len(), 1);
        assert_eq!(resp.changes[0].kind, ChangeKind::Create);
        assert!(resp.cursor.is_none());
    }

    #[test]
    fn test_batch_cap_and_cursor() {
        let graph = Arc::new(GraphService::new(Arc::new(InMemoryGraphStore::new())).unwrap());
        let svc = SyncService::new(Arc::clone(&graph), "server", 2);
        for i in 0..5 {
            graph
                .create_entity(
                    EntityType::Note,
                    &format!("note-{i}"),
                    ValueMap::new(),
                    "srv",
                    SourceType::Manual,
                )
                .unwrap();
        }

        let mut req = SyncRequest::new("client-1", "u1");
        let first = svc.handle_request(&req).unwrap();
        assert_eq!(first.changes.len(), 2);
        assert_eq!(first.cursor.as_deref(), Some("2"));

        req.cursor = first.cursor;
        let second = svc.handle_request(&req).unwrap();
        assert_eq!(second.changes.len(), 2);
        assert_eq!(second.cursor.as_deref(), Some("4"));

        req.cursor = second.cursor;
        let third = svc.handle_request(&req).unwrap();
        assert_eq!(third.changes.len(), 1);
        assert!(third.cursor.is_none());
    }

    #[test]
    fn test_exactly_at_batch_max_has_no_cursor() {
        let graph = Arc::new(GraphService::new(Arc::new(InMemoryGraphStore::new())).unwrap());
        let svc = SyncService::new(Arc::clone(&graph), "server", 3);
        for i in 0..3 {
            graph
                .create_entity(
                    EntityType::Note,
                    &format!("note-{i}"),
                    ValueMap::new(),
                    "srv",
                    SourceType::Manual,
                )
                .unwrap();
        }
        let resp = svc.handle_request(&SyncRequest::new("c", "u")).unwrap();
        assert_eq!(resp.changes.len(), 3);
        assert!(resp.cursor.is_none());
    }

    #[test]
    fn test_idempotent_replay_of_same_request() {
        let svc = server();
        let entity = Entity::new(EntityType::Room, "Kitchen", ValueMap::new(), "u1");
        let mut req = request_with(vec![SyncChange::entity(ChangeKind::Create, entity.clone())]);
        req.vector_clock.observe(&entity.version);

        svc.handle_request(&req).unwrap();
        let resp = svc.handle_request(&req).unwrap();
        assert!(resp.failed.is_none());
        assert_eq!(svc.graph.get_history(&entity.id).unwrap().len(), 1);
    }

    #[test]
    fn test_divergence_reports_conflict_lww() {
        let svc = server();
        let v0 = Entity::new(EntityType::Device, "Lamp", ValueMap::new(), "u0");
        svc.graph.apply_remote_entity(&v0).unwrap();

        let mut local = v0.next_version("server-user");
        local.content.insert("brightness".to_string(), Value::Int(50));
        svc.graph.apply_remote_entity(&local).unwrap();

        let mut remote = v0.next_version("client-user");
        remote.content.insert("brightness".to_string(), Value::Int(80));

        let mut req = request_with(vec![SyncChange::entity(ChangeKind::Update, remote.clone())]);
        req.vector_clock.observe(&v0.version);
        req.vector_clock.observe(&remote.version);

        let resp = svc.handle_request(&req).unwrap();
        assert_eq!(resp.conflicts.len(), 1);
        let conflict = &resp.conflicts[0];
        assert_eq!(conflict.entity_id, v0.id.to_string());
        assert_eq!(conflict.local_version, local.version.to_string());
        assert_eq!(conflict.remote_version, remote.version.to_string());

        let expected_winner = local.version.clone().max(remote.version.clone());
        assert_eq!(conflict.winning_version, expected_winner.to_string());
        // Both sides stay in history; the projection picks the winner.
        let latest = svc.graph.get_entity(&v0.id, None).unwrap().unwrap();
        assert_eq!(latest.version, expected_winner);
        assert_eq!(svc.graph.get_history(&v0.id).unwrap().len(), 3);
    }

    #[test]
    fn test_divergence_merge_mode_records_both_parents() {
        let svc = server();
        let v0 = Entity::new(EntityType::Device, "Lamp", ValueMap::new(), "u0");
        svc.graph.apply_remote_entity(&v0).unwrap();
        let local = v0.next_version("server-user");
        svc.graph.apply_remote_entity(&local).unwrap();
        let remote = v0.next_version("client-user");

        let mut req = request_with(vec![SyncChange::entity(ChangeKind::Update, remote.clone())]);
        req.resolution_mode = ResolutionMode::Merge;
        req.vector_clock.observe(&v0.version);
        req.vector_clock.observe(&remote.version);

        let resp = svc.handle_request(&req).unwrap();
        assert_eq!(resp.resolution_mode, ResolutionMode::Merge);
        assert_eq!(resp.conflicts.len(), 1);

        let latest = svc.graph.get_entity(&v0.id, None).unwrap().unwrap();
        assert_eq!(latest.parent_versions.len(), 2);
        assert_eq!(latest.version.writer(), "server");
    }

    #[test]
    fn test_partial_batch_failure_reports_prefix() {
        let svc = server();
        let good = Entity::new(EntityType::Room, "Kitchen", ValueMap::new(), "u1");
        // An update whose parent chain is unknown to the server.
        let orphan_parent = Entity::new(EntityType::Room, "Attic", ValueMap::new(), "u1");
        let orphan = orphan_parent.next_version("u1");

        let req = request_with(vec![
            SyncChange::entity(ChangeKind::Create, good.clone()),
            SyncChange::entity(ChangeKind::Update, orphan),
            SyncChange::entity(
                ChangeKind::Create,
                Entity::new(EntityType::Room, "Cellar", ValueMap::new(), "u1"),
            ),
        ]);

        let resp = svc.handle_request(&req).unwrap();
        let failed = resp.failed.unwrap();
        assert_eq!(failed.index, 1);
        assert_eq!(failed.kind, "parent_unknown");
        // The prefix stayed applied; the suffix was not attempted.
        assert!(svc.graph.get_entity(&good.id, None).unwrap().is_some());
        let cellar = svc
            .graph
            .list_entities(&crate::storage::EntityFilter::new().with_name_substring("Cellar"))
            .unwrap();
        assert!(cellar.is_empty());
    }

    #[test]
    fn test_ack_persists_clock() {
        let svc = server();
        let entity = Entity::new(EntityType::Room, "Kitchen", ValueMap::new(), "u9");
        let mut req = SyncRequest::new("client-1", "u9");
        req.vector_clock.observe(&entity.version);

        let resp = svc.handle_ack(&req).unwrap();
        assert!(resp.vector_clock.has_seen(&entity.version));

        let stored = svc
            .graph
            .store()
            .get_sync_metadata(metadata_keys::VECTOR_CLOCK)
            .unwrap()
            .unwrap();
        let parsed: VectorClock = serde_json::from_str(&stored).unwrap();
        assert!(parsed.has_seen(&entity.version));
    }
}
