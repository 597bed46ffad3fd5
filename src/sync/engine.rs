//! Client side of the Inbetweenies protocol.
//!
//! The engine owns a local replica (a [`GraphService`] over any store) and
//! drives the exchange state machine:
//!
//! ```text
//! IDLE -> COLLECTING -> SENDING -> APPLYING -> COMMITTING -> IDLE
//!              \             \________/
//!               \                |  transport failure
//!                \               v
//!                 `------ RETRY_BACKOFF (1s 2s 4s 8s 16s 30s) -> OFFLINE
//! ```
//!
//! Every retry replays the whole exchange; the store's idempotent replay
//! semantics make the already-applied prefix a no-op, so a retry resumes
//! at the first unapplied change.

use crate::models::sync::metadata_keys;
use crate::models::{
    ChangeKind, Conflict, RelationshipId, ResolutionMode, SyncChange, SyncRequest, SyncResponse,
    VectorClock,
};
use crate::services::GraphService;
use crate::sync::service::replica_clock;
use crate::sync::transport::{SyncPhase, SyncTransport};
use crate::sync::wire_changes;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::instrument;

/// Default backoff schedule; the sixth failed attempt parks the engine.
const DEFAULT_BACKOFF: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(30),
];

/// Engine state, observable for status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing in flight.
    Idle,
    /// Computing pending changes from the local store.
    Collecting,
    /// Request in flight.
    Sending,
    /// Writing the server's delta into the local replica.
    Applying,
    /// Persisting the merged clock and acking.
    Committing,
    /// Waiting out a transport failure.
    RetryBackoff {
        /// Zero-based retry attempt.
        attempt: usize,
    },
    /// Gave up after exhausting the backoff schedule.
    Offline,
}

/// Outcome of one successful sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Change records sent to the server.
    pub pushed: usize,
    /// Change records applied locally.
    pub pulled: usize,
    /// Conflicts the server reported.
    pub conflicts: Vec<Conflict>,
}

fn acquire<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Client sync engine over a generic transport.
pub struct SyncEngine<T: SyncTransport> {
    graph: Arc<GraphService>,
    transport: T,
    device_id: String,
    user_id: String,
    resolution_mode: ResolutionMode,
    batch_max: usize,
    backoff: Vec<Duration>,
    state: Mutex<SyncState>,
    /// Hard deletes leave no row behind, so they are logged until the next
    /// successful exchange.
    pending_deletes: Mutex<Vec<SyncChange>>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates an engine over a local replica and a transport.
    pub fn new(
        graph: Arc<GraphService>,
        transport: T,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            transport,
            device_id: device_id.into(),
            user_id: user_id.into(),
            resolution_mode: ResolutionMode::default(),
            batch_max: 1000,
            backoff: DEFAULT_BACKOFF.to_vec(),
            state: Mutex::new(SyncState::Idle),
            pending_deletes: Mutex::new(Vec::new()),
        }
    }

    /// Selects the conflict resolution mode stated in every request.
    #[must_use]
    pub const fn with_resolution_mode(mut self, mode: ResolutionMode) -> Self {
        self.resolution_mode = mode;
        self
    }

    /// Overrides the per-exchange batch cap.
    #[must_use]
    pub const fn with_batch_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max;
        self
    }

    /// Overrides the backoff schedule (tests use millisecond delays).
    #[must_use]
    pub fn with_backoff_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.backoff = schedule;
        self
    }

    /// Returns the local replica service.
    #[must_use]
    pub fn graph(&self) -> &Arc<GraphService> {
        &self.graph
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *acquire(&self.state)
    }

    fn set_state(&self, state: SyncState) {
        *acquire(&self.state) = state;
    }

    /// Deletes a local relationship and logs the delete for the next
    /// exchange.
    pub fn delete_relationship(&self, id: &RelationshipId) -> Result<bool> {
        let Some(rel) = self.graph.store().get_relationship(id)? else {
            return Ok(false);
        };
        let deleted = self.graph.delete_relationship(id)?;
        if deleted {
            acquire(&self.pending_deletes)
                .push(SyncChange::relationship(ChangeKind::Delete, rel));
        }
        Ok(deleted)
    }

    /// Runs one full sync, retrying transport failures with exponential
    /// backoff. After the schedule is exhausted the engine goes
    /// [`SyncState::Offline`] and returns the last error.
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut attempt = 0usize;
        loop {
            match self.exchange().await {
                Ok(report) => {
                    self.set_state(SyncState::Idle);
                    metrics::counter!("homegraph_sync_exchanges_total").increment(1);
                    return Ok(report);
                },
                Err(e) if e.is_retryable() => {
                    if attempt >= self.backoff.len() {
                        tracing::warn!(error = %e, "sync retries exhausted, going offline");
                        self.set_state(SyncState::Offline);
                        return Err(e);
                    }
                    tracing::debug!(attempt, error = %e, "sync failed, backing off");
                    self.set_state(SyncState::RetryBackoff { attempt });
                    tokio::time::sleep(self.backoff[attempt]).await;
                    attempt += 1;
                },
                Err(e) => {
                    // Hard errors (protocol mismatch, invalid argument) are
                    // not retried.
                    self.set_state(SyncState::Idle);
                    return Err(e);
                },
            }
        }
    }

    /// One exchange: request + any pushes + cursor follow-ups + ack.
    async fn exchange(&self) -> Result<SyncReport> {
        self.set_state(SyncState::Collecting);
        let mut report = SyncReport::default();
        let pending = self.collect_pending()?;
        report.pushed = pending.len();

        let local_clock = replica_clock(self.graph.as_ref())?;
        let mut batches = pending.chunks(self.batch_max.max(1));
        let first_batch: Vec<SyncChange> = batches.next().map(<[_]>::to_vec).unwrap_or_default();

        self.set_state(SyncState::Sending);
        let mut request = self.base_request(local_clock.clone());
        request.changes = first_batch;
        let mut response = self.transport.exchange(SyncPhase::Request, &request).await?;
        self.check_failed(&response)?;
        report.conflicts.extend(response.conflicts.drain(..));

        self.set_state(SyncState::Applying);
        report.pulled += self.apply_delta(&response.changes)?;

        // Follow the cursor until the server has nothing left. The delta is
        // drained before any pushes so the server-side change list stays
        // stable under the cursor.
        while let Some(cursor) = response.cursor.take() {
            let mut follow = self.base_request(local_clock.clone());
            follow.cursor = Some(cursor);
            response = self.transport.exchange(SyncPhase::Request, &follow).await?;
            self.set_state(SyncState::Applying);
            report.pulled += self.apply_delta(&response.changes)?;
        }

        // Remaining local batches travel through the push phase.
        for batch in batches {
            let mut push = self.base_request(local_clock.clone());
            push.changes = batch.to_vec();
            let mut push_response = self.transport.exchange(SyncPhase::Push, &push).await?;
            self.check_failed(&push_response)?;
            report.conflicts.extend(push_response.conflicts.drain(..));
        }

        self.set_state(SyncState::Committing);
        let mut final_clock = replica_clock(self.graph.as_ref())?;
        final_clock.merge(&response.vector_clock);
        self.persist_clock(&final_clock)?;

        let ack = self.base_request(final_clock);
        let _ = self.transport.exchange(SyncPhase::Ack, &ack).await?;

        acquire(&self.pending_deletes).clear();
        Ok(report)
    }

    fn base_request(&self, clock: VectorClock) -> SyncRequest {
        let mut request = SyncRequest::new(&self.device_id, &self.user_id);
        request.vector_clock = clock;
        request.resolution_mode = self.resolution_mode;
        request
    }

    /// Pending = everything the server has not acknowledged (its clock as
    /// of the last commit) plus logged relationship deletes.
    fn collect_pending(&self) -> Result<Vec<SyncChange>> {
        let last_clock = self.load_clock()?;
        let change_set = self.graph.store().changes_since(&last_clock)?;
        let mut changes = wire_changes(change_set);
        changes.extend(acquire(&self.pending_deletes).iter().cloned());
        Ok(changes)
    }

    /// Applies a delta batch in delivered order. Failures abort the batch
    /// as retryable; replays of the applied prefix are no-ops.
    fn apply_delta(&self, changes: &[SyncChange]) -> Result<usize> {
        let mut applied = 0;
        for change in changes {
            if let Some(entity) = &change.entity {
                self.graph.apply_remote_entity(entity)?;
            } else if let Some(relationship) = &change.relationship {
                match change.kind {
                    ChangeKind::Create | ChangeKind::Update => {
                        self.graph.apply_remote_relationship(relationship)?;
                    },
                    ChangeKind::Delete => {
                        let _ = self.graph.delete_relationship(&relationship.id)?;
                    },
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// A server-side failure marker means the unapplied suffix must be
    /// resent; surfaced as retryable so the backoff loop replays.
    fn check_failed(&self, response: &SyncResponse) -> Result<()> {
        match &response.failed {
            None => Ok(()),
            Some(failed) => Err(Error::StoreUnavailable {
                operation: format!("sync_apply[{}]", failed.index),
                cause: format!("{}: {}", failed.kind, failed.message),
            }),
        }
    }

    fn load_clock(&self) -> Result<VectorClock> {
        let stored = self
            .graph
            .store()
            .get_sync_metadata(metadata_keys::VECTOR_CLOCK)?;
        match stored {
            None => Ok(VectorClock::new()),
            Some(json) => serde_json::from_str(&json).map_err(|e| Error::OperationFailed {
                operation: "decode_vector_clock".to_string(),
                cause: e.to_string(),
            }),
        }
    }

    fn persist_clock(&self, clock: &VectorClock) -> Result<()> {
        let store = self.graph.store();
        store.put_sync_metadata(
            metadata_keys::VECTOR_CLOCK,
            &serde_json::to_string(clock).map_err(|e| Error::OperationFailed {
                operation: "encode_vector_clock".to_string(),
                cause: e.to_string(),
            })?,
        )?;
        store.put_sync_metadata(metadata_keys::LAST_SYNC_TIME, &Utc::now().to_rfc3339())?;
        store.put_sync_metadata(metadata_keys::DEVICE_ID, &self.device_id)?;
        Ok(())
    }
}
