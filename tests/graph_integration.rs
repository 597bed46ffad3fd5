//! Graph store and traversal integration tests.
//!
//! Covers the linear-edit lifecycle, path finding over room connections,
//! the versioning invariants, and storage round-trips against the on-disk
//! `SQLite` backend.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use homegraph::models::{Value, ValueMap};
use homegraph::services::GraphService;
use homegraph::storage::{EntityFilter, GraphStore, SqliteGraphStore};
use homegraph::{EntityType, RelationshipType, SourceType};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn disk_service(temp_dir: &TempDir) -> GraphService {
    let db_path = temp_dir.path().join("graph.db");
    let store = SqliteGraphStore::new(&db_path).expect("Failed to open store");
    GraphService::new(Arc::new(store)).expect("Failed to build service")
}

fn content(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Linear edit: create, rename, check history and the latest projection.
#[test]
fn test_linear_edit_lifecycle() {
    let temp = TempDir::new().unwrap();
    let svc = disk_service(&temp);

    let room = svc
        .create_entity(
            EntityType::Room,
            "Living Room",
            content(&[("floor", Value::Int(1))]),
            "U1",
            SourceType::Manual,
        )
        .unwrap();

    let updated = svc
        .update_entity(&room.id, ValueMap::new(), Some("Family Room"), "U1")
        .unwrap();

    let history = svc.get_history(&room.id).unwrap();
    assert_eq!(history.len(), 2);

    // Latest is the renamed version.
    let latest = svc.get_entity(&room.id, None).unwrap().unwrap();
    assert_eq!(latest.name, "Family Room");
    assert_eq!(latest.version, updated.version);

    // P1: every parent listed by any version exists under the same id.
    for version in &history {
        for parent in &version.parent_versions {
            assert!(
                history.iter().any(|e| &e.version == parent),
                "parent {parent} missing from history"
            );
        }
    }

    // P2: the latest is the lexicographically greatest stored version.
    let greatest = history.iter().map(|e| &e.version).max().unwrap();
    assert_eq!(&latest.version, greatest);

    // P3: entity_type never changes across versions.
    assert!(history.iter().all(|e| e.entity_type == EntityType::Room));
}

/// Path finding over room connections, including edge removal.
#[test]
fn test_room_path_appears_and_disappears() {
    let temp = TempDir::new().unwrap();
    let svc = disk_service(&temp);

    let r1 = svc
        .create_entity(EntityType::Room, "R1", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    let r2 = svc
        .create_entity(EntityType::Room, "R2", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    let r3 = svc
        .create_entity(EntityType::Room, "R3", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();

    svc.create_relationship(&r1.id, &r2.id, RelationshipType::ConnectsTo, ValueMap::new(), "u1")
        .unwrap();
    let bridge = svc
        .create_relationship(&r2.id, &r3.id, RelationshipType::ConnectsTo, ValueMap::new(), "u1")
        .unwrap();

    assert_eq!(
        svc.find_path(&r1.id, &r3.id, 10),
        vec![r1.id.clone(), r2.id.clone(), r3.id.clone()]
    );

    svc.delete_relationship(&bridge.id).unwrap();
    assert!(svc.find_path(&r1.id, &r3.id, 10).is_empty());
}

/// The index stays coherent with the store across a reopen.
#[test]
fn test_index_rebuild_after_reopen() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("graph.db");

    let (r1_id, r2_id) = {
        let store = SqliteGraphStore::new(&db_path).unwrap();
        let svc = GraphService::new(Arc::new(store)).unwrap();
        let r1 = svc
            .create_entity(EntityType::Room, "R1", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        let r2 = svc
            .create_entity(EntityType::Room, "R2", ValueMap::new(), "u1", SourceType::Manual)
            .unwrap();
        svc.create_relationship(&r1.id, &r2.id, RelationshipType::ConnectsTo, ValueMap::new(), "u1")
            .unwrap();
        (r1.id, r2.id)
    };

    // Fresh process: the index is rebuilt from the store on startup.
    let store = SqliteGraphStore::new(&db_path).unwrap();
    let svc = GraphService::new(Arc::new(store)).unwrap();
    assert_eq!(svc.find_path(&r1_id, &r2_id, 5).len(), 2);
}

/// Boundary behaviors: empty name, nested content with arrays and maps.
#[test]
fn test_empty_name_and_nested_content_roundtrip() {
    let temp = TempDir::new().unwrap();
    let svc = disk_service(&temp);

    let nested = content(&[
        (
            "schedule",
            Value::Map(content(&[
                ("days", Value::List(vec![Value::from("mon"), Value::from("wed")])),
                ("hour", Value::Int(7)),
            ])),
        ),
        (
            "temperatures",
            Value::List(vec![Value::Float(19.5), Value::Float(21.0)]),
        ),
    ]);

    let entity = svc
        .create_entity(EntityType::Schedule, "", nested.clone(), "u1", SourceType::Manual)
        .unwrap();

    let fetched = svc
        .get_entity(&entity.id, Some(&entity.version))
        .unwrap()
        .unwrap();
    assert_eq!(fetched.name, "");
    assert_eq!(fetched.content, nested);
}

/// Tombstoned entities vanish from listings but stay in history.
#[test]
fn test_tombstone_listing_and_history() {
    let temp = TempDir::new().unwrap();
    let svc = disk_service(&temp);

    let note = svc
        .create_entity(EntityType::Note, "scratch", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    svc.delete_entity(&note.id, "u1").unwrap();

    assert!(svc.list_entities(&EntityFilter::new()).unwrap().is_empty());
    assert_eq!(
        svc.list_entities(&EntityFilter::new().include_deleted())
            .unwrap()
            .len(),
        1
    );
    assert_eq!(svc.get_history(&note.id).unwrap().len(), 2);
}

/// Search returns score breakdowns and ranks the exact name match first.
#[test]
fn test_search_scores_and_breakdown() {
    let temp = TempDir::new().unwrap();
    let svc = disk_service(&temp);

    svc.create_entity(EntityType::Room, "Kitchen", ValueMap::new(), "u1", SourceType::Manual)
        .unwrap();
    svc.create_entity(
        EntityType::Device,
        "Toaster",
        content(&[("location", Value::from("kitchen counter"))]),
        "u1",
        SourceType::Manual,
    )
    .unwrap();

    let hits = svc.search("kitchen", &[]).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].entity.name, "Kitchen");
    assert!(hits[0].score > hits[1].score);
    assert!(hits[0]
        .field_scores
        .iter()
        .any(|(field, _)| field == "name_exact"));
    assert!(hits[1]
        .field_scores
        .iter()
        .any(|(field, _)| field == "content.location"));
}

proptest! {
    /// Content maps survive the store's JSON blob encoding bit-for-bit.
    #[test]
    fn prop_content_roundtrips_through_store(
        ints in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..6),
        strings in proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,24}", 0..6),
        flags in proptest::collection::btree_map("[a-z]{1,8}", any::<bool>(), 0..6),
    ) {
        let mut map = ValueMap::new();
        for (k, v) in ints {
            map.insert(format!("i_{k}"), Value::Int(v));
        }
        for (k, v) in strings {
            map.insert(format!("s_{k}"), Value::from(v));
        }
        for (k, v) in flags {
            map.insert(format!("b_{k}"), Value::Bool(v));
        }

        let store = SqliteGraphStore::in_memory().unwrap();
        let entity = homegraph::Entity::new(EntityType::Note, "prop", map.clone(), "u1");
        store.put_entity(&entity).unwrap();
        let back = store
            .get_entity(&entity.id, Some(&entity.version))
            .unwrap()
            .unwrap();
        prop_assert_eq!(back.content, map);
    }
}
