//! Conflict detection and resolution.
//!
//! Detection walks the parent graph: an incoming version that descends from
//! the local latest is a plain fast-forward, one that is an ancestor is
//! already subsumed, anything else is a divergence. Resolution is
//! deterministic for a given `(local, incoming)` pair, so two replicas that
//! resolve the same conflict without coordination converge.

use crate::models::{
    Conflict, Entity, ResolutionMode, SourceType, Value, ValueMap, VersionId, TOMBSTONE_KEY,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Boolean fields that OR together when merging.
const AVAILABILITY_FIELDS: &[&str] = &["is_reachable", "is_active", "is_enabled"];

/// How an incoming version relates to the local latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The incoming version descends from the local latest: fast-forward.
    LinearUpdate,
    /// The local latest already descends from the incoming version.
    Subsumed,
    /// Neither descends from the other.
    Diverged,
}

/// Collects the transitive ancestors of `version` over `history` (the known
/// versions of one entity id) plus `extra` (an incoming version not yet
/// stored).
fn ancestors(version: &VersionId, history: &[Entity], extra: Option<&Entity>) -> HashSet<VersionId> {
    let mut parents_of: HashMap<&VersionId, &[VersionId]> = history
        .iter()
        .map(|e| (&e.version, e.parent_versions.as_slice()))
        .collect();
    if let Some(e) = extra {
        parents_of.insert(&e.version, e.parent_versions.as_slice());
    }

    let mut seen: HashSet<VersionId> = HashSet::new();
    let mut queue: VecDeque<&VersionId> = VecDeque::from([version]);
    while let Some(current) = queue.pop_front() {
        if let Some(parents) = parents_of.get(current) {
            for parent in *parents {
                if seen.insert(parent.clone()) {
                    queue.push_back(parent);
                }
            }
        }
    }
    seen
}

/// Classifies an incoming version against the local latest.
///
/// `history` must contain every stored version of the entity. Versions with
/// an untracked ancestry (neither side reachable from the other) classify
/// as [`Disposition::Diverged`].
#[must_use]
pub fn classify(local_latest: &Entity, incoming: &Entity, history: &[Entity]) -> Disposition {
    if incoming.version == local_latest.version {
        return Disposition::Subsumed;
    }
    if ancestors(&incoming.version, history, Some(incoming)).contains(&local_latest.version) {
        return Disposition::LinearUpdate;
    }
    if ancestors(&local_latest.version, history, Some(incoming)).contains(&incoming.version) {
        return Disposition::Subsumed;
    }
    Disposition::Diverged
}

/// The outcome of resolving one divergence.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// A version to store, when resolution produced one: the incoming
    /// record under `lww` (history retains both sides; the latest-per-id
    /// projection picks the greater), or the merged version under `merge`.
    pub store: Option<Entity>,
    /// The conflict report for the response.
    pub conflict: Conflict,
}

/// Resolves a divergence between `local` and `incoming`.
///
/// Under `lww` the greater version string wins outright; the losing side
/// stays in history. Under `merge` a new version is produced that records
/// both parents and merges fields: deletion beats a concurrent update, the
/// longer name wins, availability booleans OR, lists union, and every other
/// field takes the winner's value.
#[must_use]
pub fn resolve(
    local: &Entity,
    incoming: &Entity,
    mode: ResolutionMode,
    resolver_id: &str,
) -> Resolution {
    let incoming_wins = incoming.version > local.version;
    let (winner, loser) = if incoming_wins {
        (incoming, local)
    } else {
        (local, incoming)
    };

    match mode {
        ResolutionMode::Lww => Resolution {
            store: Some(incoming.clone()),
            conflict: Conflict {
                entity_id: local.id.to_string(),
                local_version: local.version.to_string(),
                remote_version: incoming.version.to_string(),
                winning_version: winner.version.to_string(),
                resolution: mode,
            },
        },
        ResolutionMode::Merge => {
            let merged = merge_versions(winner, loser, resolver_id);
            Resolution {
                conflict: Conflict {
                    entity_id: local.id.to_string(),
                    local_version: local.version.to_string(),
                    remote_version: incoming.version.to_string(),
                    winning_version: merged.version.to_string(),
                    resolution: mode,
                },
                store: Some(merged),
            }
        },
    }
}

/// Produces the merged version of two divergent siblings.
fn merge_versions(winner: &Entity, loser: &Entity, resolver_id: &str) -> Entity {
    let now = chrono::Utc::now();
    let mut content = merge_content(&winner.content, &loser.content);

    // Deletion always wins over a concurrent update.
    if winner.is_tombstone() || loser.is_tombstone() {
        content.insert(TOMBSTONE_KEY.to_string(), Value::Bool(true));
    }

    let name = if loser.name.len() > winner.name.len() {
        loser.name.clone()
    } else {
        winner.name.clone()
    };

    Entity {
        id: winner.id.clone(),
        version: VersionId::after(&winner.version, resolver_id),
        entity_type: winner.entity_type,
        name,
        content,
        source_type: SourceType::Generated,
        user_id: resolver_id.to_string(),
        parent_versions: vec![winner.version.clone(), loser.version.clone()],
        created_at: now,
        updated_at: now,
    }
}

/// Field-aware content merge. The winner's value prevails except where a
/// special rule applies.
fn merge_content(winner: &ValueMap, loser: &ValueMap) -> ValueMap {
    let mut merged = winner.clone();

    for (key, loser_value) in loser {
        match merged.get(key) {
            None => {
                merged.insert(key.clone(), loser_value.clone());
            },
            Some(winner_value) => {
                if AVAILABILITY_FIELDS.contains(&key.as_str()) {
                    if let (Some(a), Some(b)) = (winner_value.as_bool(), loser_value.as_bool()) {
                        merged.insert(key.clone(), Value::Bool(a || b));
                    }
                } else if let (Value::List(a), Value::List(b)) = (winner_value, loser_value) {
                    let mut union = a.clone();
                    for item in b {
                        if !union.contains(item) {
                            union.push(item.clone());
                        }
                    }
                    merged.insert(key.clone(), Value::List(union));
                }
                // Otherwise the winner's value stands.
            },
        }
    }
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    fn base() -> Entity {
        Entity::new(EntityType::Device, "Lamp", ValueMap::new(), "u0")
    }

    /// Two divergent children of the same ancestor, written by different
    /// writers. Which one carries the greater version depends on the wall
    /// clock, so tests compare against `max` rather than assuming a side.
    fn diverged_pair() -> (Entity, Entity, Entity) {
        let v0 = base();
        let mut v1a = v0.next_version("u1");
        v1a.content.insert("brightness".to_string(), Value::Int(50));
        let mut v1b = v0.next_version("u2");
        v1b.content.insert("brightness".to_string(), Value::Int(80));
        (v0, v1a, v1b)
    }

    #[test]
    fn test_classify_linear_update() {
        let v0 = base();
        let v1 = v0.next_version("u1");
        let history = vec![v0.clone()];
        assert_eq!(classify(&v0, &v1, &history), Disposition::LinearUpdate);
    }

    #[test]
    fn test_classify_subsumed() {
        let v0 = base();
        let v1 = v0.next_version("u1");
        let history = vec![v0.clone(), v1.clone()];
        // Re-receiving the ancestor.
        assert_eq!(classify(&v1, &v0, &history), Disposition::Subsumed);
        // Re-receiving the exact latest.
        assert_eq!(classify(&v1, &v1, &history), Disposition::Subsumed);
    }

    #[test]
    fn test_classify_diverged() {
        let (v0, v1a, v1b) = diverged_pair();
        let history = vec![v0, v1a.clone()];
        assert_eq!(classify(&v1a, &v1b, &history), Disposition::Diverged);
    }

    #[test]
    fn test_classify_transitive_fast_forward() {
        let v0 = base();
        let v1 = v0.next_version("u1");
        let v2 = v1.next_version("u1");
        let history = vec![v0.clone(), v1, v2.clone()];
        // v2 descends from v0 through v1.
        assert_eq!(classify(&v0, &v2, &history), Disposition::LinearUpdate);
    }

    #[test]
    fn test_lww_greater_version_wins() {
        let (_, v1a, v1b) = diverged_pair();
        let resolution = resolve(&v1a, &v1b, ResolutionMode::Lww, "server");
        let expected_winner = if v1b.version > v1a.version { &v1b } else { &v1a };
        assert_eq!(
            resolution.conflict.winning_version,
            expected_winner.version.to_string()
        );
        // The incoming side is stored either way; the projection decides.
        assert_eq!(resolution.store.unwrap().version, v1b.version);
    }

    #[test]
    fn test_merge_records_both_parents() {
        let (_, v1a, v1b) = diverged_pair();
        let resolution = resolve(&v1a, &v1b, ResolutionMode::Merge, "server");
        let merged = resolution.store.unwrap();
        assert_eq!(merged.parent_versions.len(), 2);
        assert!(merged.parent_versions.contains(&v1a.version));
        assert!(merged.parent_versions.contains(&v1b.version));
        assert!(merged.version > v1a.version);
        assert!(merged.version > v1b.version);
        assert_eq!(merged.user_id, "server");
        assert_eq!(merged.source_type, SourceType::Generated);
    }

    #[test]
    fn test_merge_longer_name_wins() {
        let (_, mut v1a, mut v1b) = diverged_pair();
        v1a.name = "Lamp".to_string();
        v1b.name = "Reading Lamp".to_string();
        let merged = resolve(&v1a, &v1b, ResolutionMode::Merge, "s")
            .store
            .unwrap();
        assert_eq!(merged.name, "Reading Lamp");
    }

    #[test]
    fn test_merge_availability_booleans_or() {
        let (_, mut v1a, mut v1b) = diverged_pair();
        v1a.content
            .insert("is_reachable".to_string(), Value::Bool(false));
        v1b.content
            .insert("is_reachable".to_string(), Value::Bool(true));
        let merged = resolve(&v1a, &v1b, ResolutionMode::Merge, "s")
            .store
            .unwrap();
        assert_eq!(
            merged.content.get("is_reachable"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_merge_lists_union() {
        let (_, mut v1a, mut v1b) = diverged_pair();
        v1a.content.insert(
            "capabilities".to_string(),
            Value::List(vec![Value::from("on_off"), Value::from("dim")]),
        );
        v1b.content.insert(
            "capabilities".to_string(),
            Value::List(vec![Value::from("dim"), Value::from("color")]),
        );
        let merged = resolve(&v1a, &v1b, ResolutionMode::Merge, "s")
            .store
            .unwrap();
        let caps = merged.content.get("capabilities").unwrap().as_list().unwrap();
        assert_eq!(caps.len(), 3);
    }

    #[test]
    fn test_merge_deletion_wins() {
        let (v0, v1a, _) = diverged_pair();
        let tomb = v0.tombstone("u2");
        let merged = resolve(&v1a, &tomb, ResolutionMode::Merge, "s")
            .store
            .unwrap();
        assert!(merged.is_tombstone());
    }

    #[test]
    fn test_merge_scalar_takes_winner_value() {
        let (_, v1a, v1b) = diverged_pair();
        let merged = resolve(&v1a, &v1b, ResolutionMode::Merge, "s")
            .store
            .unwrap();
        let winner_brightness = if v1b.version > v1a.version {
            v1b.content.get("brightness")
        } else {
            v1a.content.get("brightness")
        };
        assert_eq!(merged.content.get("brightness"), winner_brightness);
    }

    #[test]
    fn test_resolution_is_symmetric_under_merge() {
        // Both replicas resolving the same pair (swapped roles) must agree
        // on the merged content.
        let (_, v1a, v1b) = diverged_pair();
        let left = resolve(&v1a, &v1b, ResolutionMode::Merge, "s").store.unwrap();
        let right = resolve(&v1b, &v1a, ResolutionMode::Merge, "s").store.unwrap();
        assert_eq!(left.content, right.content);
        assert_eq!(left.name, right.name);
    }
}
