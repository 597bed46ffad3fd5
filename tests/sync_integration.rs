//! Inbetweenies end-to-end tests: a client replica over an in-memory store
//! syncing against a server replica through the loopback transport.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use homegraph::models::{ResolutionMode, Value, ValueMap};
use homegraph::services::GraphService;
use homegraph::storage::{GraphStore, InMemoryGraphStore, SqliteGraphStore};
use homegraph::sync::{replica_clock, LoopbackTransport, SyncEngine, SyncService};
use homegraph::{EntityType, SourceType};
use std::sync::Arc;

struct Harness {
    server: Arc<GraphService>,
    service: Arc<SyncService>,
}

impl Harness {
    fn new(batch_max: usize) -> Self {
        let store = SqliteGraphStore::in_memory().expect("server store");
        let server = Arc::new(GraphService::new(Arc::new(store)).expect("server service"));
        let service = Arc::new(SyncService::new(
            Arc::clone(&server),
            "server",
            batch_max,
        ));
        Self { server, service }
    }

    fn client(&self, device_id: &str, user_id: &str) -> SyncEngine<LoopbackTransport> {
        let graph = Arc::new(
            GraphService::new(Arc::new(InMemoryGraphStore::new())).expect("client service"),
        );
        SyncEngine::new(
            graph,
            LoopbackTransport::new(Arc::clone(&self.service)),
            device_id,
            user_id,
        )
    }
}

fn assert_converged(a: &GraphService, b: &GraphService) {
    // P5: equal clocks, and equal latest per id on both replicas.
    assert_eq!(
        replica_clock(a).unwrap(),
        replica_clock(b).unwrap(),
        "vector clocks diverge"
    );
    let a_entities = a
        .list_entities(&homegraph::storage::EntityFilter::new().include_deleted())
        .unwrap();
    let b_entities = b
        .list_entities(&homegraph::storage::EntityFilter::new().include_deleted())
        .unwrap();
    assert_eq!(a_entities.len(), b_entities.len(), "entity counts diverge");
    for entity in &a_entities {
        let other = b.get_entity(&entity.id, None).unwrap().unwrap();
        assert_eq!(entity.version, other.version, "latest diverges for {}", entity.id);
    }
}

#[tokio::test]
async fn test_push_and_pull_converge() {
    let harness = Harness::new(1000);
    let client = harness.client("laptop", "u1");

    // Client writes offline.
    let room = client
        .graph()
        .create_entity(
            EntityType::Room,
            "Living Room",
            ValueMap::new(),
            "u1",
            SourceType::Manual,
        )
        .unwrap();

    // Server writes concurrently (different entity).
    harness
        .server
        .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "srv", SourceType::Manual)
        .unwrap();

    let report = client.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pulled, 1);
    assert!(report.conflicts.is_empty());

    assert!(harness
        .server
        .get_entity(&room.id, None)
        .unwrap()
        .is_some());
    assert_converged(client.graph(), &harness.server);
}

/// S2: concurrent divergence resolved by last-write-wins; the conflict is
/// reported with both versions named.
#[tokio::test]
async fn test_concurrent_divergence_lww() {
    let harness = Harness::new(1000);
    let client = harness.client("laptop", "u1");

    // Shared ancestor v0, synced to both sides.
    let lamp = client
        .graph()
        .create_entity(
            EntityType::Device,
            "Lamp",
            ValueMap::new(),
            "u1",
            SourceType::Manual,
        )
        .unwrap();
    client.sync().await.unwrap();

    // Divergent edits: server and client touch the same field.
    let server_edit = harness
        .server
        .update_entity(
            &lamp.id,
            [("brightness".to_string(), Value::Int(50))].into_iter().collect(),
            None,
            "U1",
        )
        .unwrap();
    let client_edit = client
        .graph()
        .update_entity(
            &lamp.id,
            [("brightness".to_string(), Value::Int(80))].into_iter().collect(),
            None,
            "U2",
        )
        .unwrap();

    let report = client.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.entity_id, lamp.id.to_string());
    assert_eq!(conflict.local_version, server_edit.version.to_string());
    assert_eq!(conflict.remote_version, client_edit.version.to_string());
    assert_eq!(conflict.resolution, ResolutionMode::Lww);

    let expected_winner = server_edit.version.clone().max(client_edit.version.clone());
    assert_eq!(conflict.winning_version, expected_winner.to_string());

    // Both replicas agree on the winner.
    assert_converged(client.graph(), &harness.server);
    let latest = harness.server.get_entity(&lamp.id, None).unwrap().unwrap();
    assert_eq!(latest.version, expected_winner);
}

/// Merge mode produces a merged version with both parents on the server,
/// which then flows back to the client.
#[tokio::test]
async fn test_concurrent_divergence_merge_mode() {
    let harness = Harness::new(1000);
    let client = harness
        .client("laptop", "u1")
        .with_resolution_mode(ResolutionMode::Merge);

    let lamp = client
        .graph()
        .create_entity(
            EntityType::Device,
            "Lamp",
            ValueMap::new(),
            "u1",
            SourceType::Manual,
        )
        .unwrap();
    client.sync().await.unwrap();

    harness
        .server
        .update_entity(
            &lamp.id,
            [
                ("is_reachable".to_string(), Value::Bool(false)),
                (
                    "capabilities".to_string(),
                    Value::List(vec![Value::from("on_off")]),
                ),
            ]
            .into_iter()
            .collect(),
            Some("Lamp"),
            "U1",
        )
        .unwrap();
    client
        .graph()
        .update_entity(
            &lamp.id,
            [
                ("is_reachable".to_string(), Value::Bool(true)),
                (
                    "capabilities".to_string(),
                    Value::List(vec![Value::from("dim")]),
                ),
            ]
            .into_iter()
            .collect(),
            Some("Reading Lamp"),
            "U2",
        )
        .unwrap();

    let report = client.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ResolutionMode::Merge);

    assert_converged(client.graph(), &harness.server);
    let merged = harness.server.get_entity(&lamp.id, None).unwrap().unwrap();
    assert_eq!(merged.parent_versions.len(), 2);
    // Longer name wins, availability ORs, lists union.
    assert_eq!(merged.name, "Reading Lamp");
    assert_eq!(merged.content.get("is_reachable"), Some(&Value::Bool(true)));
    assert_eq!(
        merged
            .content
            .get("capabilities")
            .and_then(Value::as_list)
            .map(<[Value]>::len),
        Some(2)
    );
}

/// S6 / P4: replaying an identical exchange is a no-op.
#[tokio::test]
async fn test_idempotent_resync() {
    let harness = Harness::new(1000);
    let client = harness.client("laptop", "u1");

    let note = client
        .graph()
        .create_entity(EntityType::Note, "memo", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();

    client.sync().await.unwrap();
    // The network blipped after the server applied; the client retries the
    // whole exchange.
    let report = client.sync().await.unwrap();
    assert_eq!(report.pushed, 0, "nothing new to push after the first sync");

    assert_eq!(harness.server.get_history(&note.id).unwrap().len(), 1);
    assert_converged(client.graph(), &harness.server);
}

/// Deltas respect the batch cap: exactly at the cap there is no cursor,
/// one over it takes a second page.
#[tokio::test]
async fn test_batch_boundary_at_and_over_cap() {
    for (entities, expect_pulled) in [(4_usize, 4_usize), (5, 5)] {
        let harness = Harness::new(4);
        for i in 0..entities {
            harness
                .server
                .create_entity(
                    EntityType::Note,
                    &format!("note-{i}"),
                    ValueMap::new(),
                    "srv",
                    SourceType::Manual,
                )
                .unwrap();
        }
        let client = harness.client("laptop", "u1");
        let report = client.sync().await.unwrap();
        assert_eq!(report.pulled, expect_pulled);
        assert_converged(client.graph(), &harness.server);
    }
}

/// R3: a delta applied to a peer leaves nothing for the same frontier.
#[tokio::test]
async fn test_changes_since_drains_after_apply() {
    let harness = Harness::new(1000);
    for i in 0..3 {
        harness
            .server
            .create_entity(
                EntityType::Room,
                &format!("room-{i}"),
                ValueMap::new(),
                "srv",
                SourceType::Manual,
            )
            .unwrap();
    }

    let client = harness.client("laptop", "u1");
    client.sync().await.unwrap();

    // The client's frontier now covers everything the server holds.
    let client_clock = replica_clock(client.graph()).unwrap();
    let remaining = harness
        .server
        .store()
        .changes_since(&client_clock)
        .unwrap();
    assert!(remaining.is_empty());
}

/// Relationships and their hard deletes travel both directions.
#[tokio::test]
async fn test_relationship_sync_and_delete() {
    let harness = Harness::new(1000);
    let client = harness.client("laptop", "u1");

    let kitchen = client
        .graph()
        .create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    let lamp = client
        .graph()
        .create_entity(EntityType::Device, "Lamp", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    let rel = client
        .graph()
        .create_relationship(
            &lamp.id,
            &kitchen.id,
            homegraph::RelationshipType::LocatedIn,
            ValueMap::new(),
            "u1",
        )
        .unwrap();

    client.sync().await.unwrap();
    assert_eq!(
        harness.server.store().relationships_to(&kitchen.id).unwrap().len(),
        1
    );

    // Hard delete locally, then propagate.
    assert!(client.delete_relationship(&rel.id).unwrap());
    client.sync().await.unwrap();
    assert!(harness
        .server
        .store()
        .relationships_to(&kitchen.id)
        .unwrap()
        .is_empty());
}

/// Two clients converge through the server.
#[tokio::test]
async fn test_two_clients_converge() {
    let harness = Harness::new(1000);
    let alice = harness.client("laptop-a", "alice");
    let bob = harness.client("laptop-b", "bob");

    alice
        .graph()
        .create_entity(EntityType::Room, "Studio", ValueMap::new(), "alice", SourceType::Manual)
        .unwrap();
    bob.graph()
        .create_entity(EntityType::Room, "Garage", ValueMap::new(), "bob", SourceType::Manual)
        .unwrap();

    alice.sync().await.unwrap();
    bob.sync().await.unwrap();
    // Alice needs one more round to pick up Bob's write.
    alice.sync().await.unwrap();

    assert_converged(alice.graph(), &harness.server);
    assert_converged(bob.graph(), &harness.server);
    assert_converged(alice.graph(), bob.graph());
}

/// Tombstones propagate like any other version.
#[tokio::test]
async fn test_delete_propagates() {
    let harness = Harness::new(1000);
    let client = harness.client("laptop", "u1");

    let note = client
        .graph()
        .create_entity(EntityType::Note, "memo", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    client.sync().await.unwrap();

    client.graph().delete_entity(&note.id, "u1").unwrap();
    client.sync().await.unwrap();

    let latest = harness.server.get_entity(&note.id, None).unwrap().unwrap();
    assert!(latest.is_tombstone());
    assert_converged(client.graph(), &harness.server);
}
