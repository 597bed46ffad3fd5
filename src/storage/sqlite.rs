//! `SQLite` graph store.
//!
//! Persists entity versions, relationship edges, sync metadata, and auth
//! configuration in a single database file. Free-form maps are stored as
//! JSON blobs. The latest-per-id projection is maintained in its own table
//! inside the same transaction as each version insert.

// SQLite returns i64; counts and offsets are non-negative and small.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::models::value::{decode_map, encode_map};
use crate::models::{
    Entity, EntityId, EntityRelationship, EntityType, RelationshipId, RelationshipType,
    SourceType, VectorClock, VersionId,
};
use crate::storage::traits::{ChangeSet, EntityFilter, GraphStore, SearchHit, StoreStats};
use crate::storage::{
    relationship_change_kind, relationship_frontier, score_entity, validate_put, PutDisposition,
};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::instrument;

/// Current storage schema version, recorded in `sync_metadata`.
const SCHEMA_VERSION: &str = "1";

/// Helper to acquire the connection mutex with poison recovery.
fn acquire_lock(mutex: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("sqlite store mutex was poisoned, recovering");
            metrics::counter!("homegraph_store_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Maps a rusqlite error to the retryable storage fault.
fn store_err(operation: &str) -> impl FnOnce(rusqlite::Error) -> Error + '_ {
    move |e| Error::StoreUnavailable {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(v: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(v).single().unwrap_or_default()
}

/// `SQLite`-backed [`GraphStore`].
///
/// # Concurrency Model
///
/// A `Mutex<Connection>` serializes statement execution; WAL mode and
/// `busy_timeout` handle concurrent processes. Per-entity write ordering is
/// the responsibility of the service layer above.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
    /// Path to the database (None for in-memory).
    db_path: Option<PathBuf>,
}

impl SqliteGraphStore {
    /// Opens (creating if needed) a store at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the database cannot be opened or the
    /// schema cannot be initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path).map_err(store_err("open_store"))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("open_store_memory"))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);

        // WAL for concurrent readers; busy_timeout instead of immediate
        // SQLITE_BUSY under multi-process access.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "busy_timeout", "5000");
        let _ = conn.pragma_update(None, "foreign_keys", "ON");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT NOT NULL,
                version TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                source_type TEXT NOT NULL,
                user_id TEXT NOT NULL,
                parent_versions TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_type
                ON entities(entity_type);
            CREATE INDEX IF NOT EXISTS idx_entities_updated
                ON entities(updated_at);
            CREATE INDEX IF NOT EXISTS idx_entities_id_created
                ON entities(id, created_at DESC);

            CREATE TABLE IF NOT EXISTS entity_latest (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entity_relationships (
                id TEXT PRIMARY KEY,
                from_entity_id TEXT NOT NULL,
                from_entity_version TEXT NOT NULL,
                to_entity_id TEXT NOT NULL,
                to_entity_version TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                properties TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_relationships_from
                ON entity_relationships(from_entity_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_to
                ON entity_relationships(to_entity_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_type
                ON entity_relationships(relationship_type);

            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(store_err("initialize_schema"))?;

        conn.execute(
            "INSERT INTO sync_metadata (key, value, updated_at) VALUES ('schema_version', ?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![SCHEMA_VERSION, to_micros(Utc::now())],
        )
        .map_err(store_err("record_schema_version"))?;

        Ok(())
    }

    /// Parses an entity from a database row.
    fn parse_entity_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
        let id: String = row.get("id")?;
        let version: String = row.get("version")?;
        let entity_type_str: String = row.get("entity_type")?;
        let name: String = row.get("name")?;
        let content_blob: String = row.get("content")?;
        let source_type_str: String = row.get("source_type")?;
        let user_id: String = row.get("user_id")?;
        let parents_blob: String = row.get("parent_versions")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;

        let entity_type = EntityType::parse(&entity_type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown entity type {entity_type_str}").into(),
            )
        })?;
        let source_type = SourceType::parse(&source_type_str).unwrap_or_default();
        let content = decode_map(&content_blob).unwrap_or_default();
        let parent_versions: Vec<VersionId> =
            serde_json::from_str(&parents_blob).unwrap_or_default();

        Ok(Entity {
            id: EntityId::new(id),
            version: VersionId::from_raw(version),
            entity_type,
            name,
            content,
            source_type,
            user_id,
            parent_versions,
            created_at: from_micros(created_at),
            updated_at: from_micros(updated_at),
        })
    }

    /// Parses a relationship from a database row.
    fn parse_relationship_row(row: &Row<'_>) -> rusqlite::Result<EntityRelationship> {
        let id: String = row.get("id")?;
        let from_entity_id: String = row.get("from_entity_id")?;
        let from_entity_version: String = row.get("from_entity_version")?;
        let to_entity_id: String = row.get("to_entity_id")?;
        let to_entity_version: String = row.get("to_entity_version")?;
        let relationship_type_str: String = row.get("relationship_type")?;
        let properties_blob: String = row.get("properties")?;
        let user_id: String = row.get("user_id")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;

        let relationship_type =
            RelationshipType::parse(&relationship_type_str).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    format!("unknown relationship type {relationship_type_str}").into(),
                )
            })?;

        Ok(EntityRelationship {
            id: RelationshipId::new(id),
            from_entity_id: EntityId::new(from_entity_id),
            from_entity_version: VersionId::from_raw(from_entity_version),
            to_entity_id: EntityId::new(to_entity_id),
            to_entity_version: VersionId::from_raw(to_entity_version),
            relationship_type,
            properties: decode_map(&properties_blob).unwrap_or_default(),
            user_id,
            created_at: from_micros(created_at),
            updated_at: from_micros(updated_at),
        })
    }

    fn history_locked(conn: &Connection, id: &EntityId) -> Result<Vec<Entity>> {
        let mut stmt = conn
            .prepare("SELECT * FROM entities WHERE id = ?1 ORDER BY version ASC")
            .map_err(store_err("get_history_prepare"))?;
        let entities = stmt
            .query_map(params![id.as_str()], Self::parse_entity_row)
            .map_err(store_err("get_history"))?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(entities)
    }

    fn endpoint_exists(conn: &Connection, id: &EntityId, version: &VersionId) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM entities WHERE id = ?1 AND version = ?2",
            params![id.as_str(), version.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
        .map_err(store_err("endpoint_exists"))
    }

    /// Reads an auth-configuration value (password hash record, signing key
    /// pointer).
    pub fn get_auth_config(&self, key: &str) -> Result<Option<String>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT value FROM auth_config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err("get_auth_config"))
    }

    /// Writes an auth-configuration value.
    pub fn put_auth_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO auth_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(store_err("put_auth_config"))?;
        Ok(())
    }
}

impl GraphStore for SqliteGraphStore {
    #[instrument(skip(self, entity), fields(entity_id = %entity.id, version = %entity.version))]
    fn put_entity(&self, entity: &Entity) -> Result<()> {
        let mut conn = acquire_lock(&self.conn);

        let tx = conn.transaction().map_err(store_err("put_entity_begin"))?;

        let history = Self::history_locked(&tx, &entity.id)?;
        if validate_put(&history, entity)? == PutDisposition::Replay {
            return Ok(());
        }

        let content_blob = encode_map(&entity.content)?;
        let parents_blob =
            serde_json::to_string(&entity.parent_versions).map_err(|e| Error::OperationFailed {
                operation: "encode_parent_versions".to_string(),
                cause: e.to_string(),
            })?;

        tx.execute(
            "INSERT INTO entities (
                id, version, entity_type, name, content, source_type,
                user_id, parent_versions, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entity.id.as_str(),
                entity.version.as_str(),
                entity.entity_type.as_str(),
                entity.name,
                content_blob,
                entity.source_type.as_str(),
                entity.user_id,
                parents_blob,
                to_micros(entity.created_at),
                to_micros(entity.updated_at),
            ],
        )
        .map_err(store_err("put_entity_insert"))?;

        tx.execute(
            "INSERT INTO entity_latest (id, version) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version
             WHERE excluded.version > entity_latest.version",
            params![entity.id.as_str(), entity.version.as_str()],
        )
        .map_err(store_err("put_entity_latest"))?;

        tx.commit().map_err(store_err("put_entity_commit"))?;

        metrics::counter!("homegraph_entity_versions_stored_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self), fields(entity_id = %id))]
    fn get_entity(&self, id: &EntityId, version: Option<&VersionId>) -> Result<Option<Entity>> {
        let conn = acquire_lock(&self.conn);
        let result = match version {
            Some(v) => conn
                .query_row(
                    "SELECT * FROM entities WHERE id = ?1 AND version = ?2",
                    params![id.as_str(), v.as_str()],
                    Self::parse_entity_row,
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT e.* FROM entities e
                     JOIN entity_latest l ON e.id = l.id AND e.version = l.version
                     WHERE e.id = ?1",
                    params![id.as_str()],
                    Self::parse_entity_row,
                )
                .optional(),
        };
        result.map_err(store_err("get_entity"))
    }

    #[instrument(skip(self, filter))]
    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let conn = acquire_lock(&self.conn);

        let mut sql = String::from(
            "SELECT e.* FROM entities e
             JOIN entity_latest l ON e.id = l.id AND e.version = l.version",
        );
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(entity_type) = filter.entity_type {
            conditions.push("e.entity_type = ?".to_string());
            args.push(Box::new(entity_type.as_str().to_string()));
        }
        if let Some(ref needle) = filter.name_substring {
            conditions.push("e.name LIKE ? ESCAPE '\\'".to_string());
            let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            args.push(Box::new(format!("%{escaped}%")));
        }
        if let Some(since) = filter.modified_since {
            conditions.push("e.updated_at > ?".to_string());
            args.push(Box::new(to_micros(since)));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY e.id ASC");

        let mut stmt = conn.prepare(&sql).map_err(store_err("list_entities_prepare"))?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(AsRef::as_ref).collect();
        let rows: Vec<Entity> = stmt
            .query_map(arg_refs.as_slice(), Self::parse_entity_row)
            .map_err(store_err("list_entities"))?
            .filter_map(std::result::Result::ok)
            .collect();

        // Tombstone elision happens here, after the page source, so the
        // projection table needs no deleted flag.
        let offset = filter.offset.unwrap_or(0);
        let mut out: Vec<Entity> = rows
            .into_iter()
            .filter(|e| filter.include_deleted || !e.is_tombstone())
            .skip(offset)
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(entity_id = %id))]
    fn get_history(&self, id: &EntityId) -> Result<Vec<Entity>> {
        let conn = acquire_lock(&self.conn);
        Self::history_locked(&conn, id)
    }

    #[instrument(skip(self, relationship), fields(relationship_id = %relationship.id))]
    fn put_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        let conn = acquire_lock(&self.conn);

        for (id, version) in [
            (
                &relationship.from_entity_id,
                &relationship.from_entity_version,
            ),
            (&relationship.to_entity_id, &relationship.to_entity_version),
        ] {
            if !Self::endpoint_exists(&conn, id, version)? {
                return Err(Error::NotFound(format!(
                    "relationship endpoint {id}@{version} does not exist"
                )));
            }
        }

        let properties_blob = encode_map(&relationship.properties)?;
        conn.execute(
            "INSERT INTO entity_relationships (
                id, from_entity_id, from_entity_version, to_entity_id,
                to_entity_version, relationship_type, properties, user_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                from_entity_id = excluded.from_entity_id,
                from_entity_version = excluded.from_entity_version,
                to_entity_id = excluded.to_entity_id,
                to_entity_version = excluded.to_entity_version,
                relationship_type = excluded.relationship_type,
                properties = excluded.properties,
                user_id = excluded.user_id,
                updated_at = excluded.updated_at",
            params![
                relationship.id.as_str(),
                relationship.from_entity_id.as_str(),
                relationship.from_entity_version.as_str(),
                relationship.to_entity_id.as_str(),
                relationship.to_entity_version.as_str(),
                relationship.relationship_type.as_str(),
                properties_blob,
                relationship.user_id,
                to_micros(relationship.created_at),
                to_micros(relationship.updated_at),
            ],
        )
        .map_err(store_err("put_relationship"))?;

        metrics::counter!("homegraph_relationships_stored_total").increment(1);
        Ok(())
    }

    #[instrument(skip(self), fields(relationship_id = %id))]
    fn delete_relationship(&self, id: &RelationshipId) -> Result<bool> {
        let conn = acquire_lock(&self.conn);
        let rows = conn
            .execute(
                "DELETE FROM entity_relationships WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(store_err("delete_relationship"))?;
        if rows > 0 {
            metrics::counter!("homegraph_relationships_deleted_total").increment(1);
        }
        Ok(rows > 0)
    }

    fn get_relationship(&self, id: &RelationshipId) -> Result<Option<EntityRelationship>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT * FROM entity_relationships WHERE id = ?1",
            params![id.as_str()],
            Self::parse_relationship_row,
        )
        .optional()
        .map_err(store_err("get_relationship"))
    }

    fn relationships_from(&self, id: &EntityId) -> Result<Vec<EntityRelationship>> {
        self.query_relationships(
            "SELECT * FROM entity_relationships WHERE from_entity_id = ?1 ORDER BY id",
            id.as_str(),
        )
    }

    fn relationships_to(&self, id: &EntityId) -> Result<Vec<EntityRelationship>> {
        self.query_relationships(
            "SELECT * FROM entity_relationships WHERE to_entity_id = ?1 ORDER BY id",
            id.as_str(),
        )
    }

    fn relationships_by_type(&self, rt: RelationshipType) -> Result<Vec<EntityRelationship>> {
        self.query_relationships(
            "SELECT * FROM entity_relationships WHERE relationship_type = ?1 ORDER BY id",
            rt.as_str(),
        )
    }

    fn list_relationships(&self) -> Result<Vec<EntityRelationship>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare("SELECT * FROM entity_relationships ORDER BY id")
            .map_err(store_err("list_relationships_prepare"))?;
        let rels = stmt
            .query_map([], Self::parse_relationship_row)
            .map_err(store_err("list_relationships"))?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rels)
    }

    #[instrument(skip(self, clock))]
    fn changes_since(&self, clock: &VectorClock) -> Result<ChangeSet> {
        let conn = acquire_lock(&self.conn);

        let mut stmt = conn
            .prepare("SELECT * FROM entities ORDER BY version ASC")
            .map_err(store_err("changes_since_prepare"))?;
        let entities: Vec<Entity> = stmt
            .query_map([], Self::parse_entity_row)
            .map_err(store_err("changes_since_entities"))?
            .filter_map(std::result::Result::ok)
            .filter(|e| !clock.has_seen(&e.version))
            .collect();

        let mut stmt = conn
            .prepare("SELECT * FROM entity_relationships ORDER BY id")
            .map_err(store_err("changes_since_rel_prepare"))?;
        let relationships: Vec<_> = stmt
            .query_map([], Self::parse_relationship_row)
            .map_err(store_err("changes_since_relationships"))?
            .filter_map(std::result::Result::ok)
            .filter(|r| !clock.has_seen(&relationship_frontier(r)))
            .map(|r| (relationship_change_kind(&r), r))
            .collect();

        Ok(ChangeSet {
            entities,
            relationships,
        })
    }

    #[instrument(skip(self))]
    fn search(&self, query: &str, types: &[EntityType]) -> Result<Vec<SearchHit>> {
        let latest = self.list_entities(&EntityFilter::new())?;
        let query_lower = query.to_lowercase();
        let mut hits: Vec<SearchHit> = latest
            .into_iter()
            .filter(|e| types.is_empty() || types.contains(&e.entity_type))
            .filter_map(|e| {
                score_entity(&e, &query_lower).map(|(score, field_scores)| SearchHit {
                    entity: e,
                    score,
                    field_scores,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(hits)
    }

    fn get_sync_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT value FROM sync_metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err("get_sync_metadata"))
    }

    fn put_sync_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, to_micros(Utc::now())],
        )
        .map_err(store_err("put_sync_metadata"))?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let latest = self.list_entities(&EntityFilter::new())?;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for e in &latest {
            *by_type.entry(e.entity_type.to_string()).or_default() += 1;
        }

        let conn = acquire_lock(&self.conn);
        let version_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
            .map_err(store_err("stats_versions"))?;
        let relationship_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entity_relationships", [], |row| {
                row.get(0)
            })
            .map_err(store_err("stats_relationships"))?;

        Ok(StoreStats {
            entity_count: latest.len(),
            version_count: version_count as usize,
            relationship_count: relationship_count as usize,
            entities_by_type: by_type.into_iter().collect(),
        })
    }
}

impl SqliteGraphStore {
    fn query_relationships(&self, sql: &str, arg: &str) -> Result<Vec<EntityRelationship>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(sql).map_err(store_err("query_relationships_prepare"))?;
        let rels = stmt
            .query_map(params![arg], Self::parse_relationship_row)
            .map_err(store_err("query_relationships"))?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rels)
    }
}
