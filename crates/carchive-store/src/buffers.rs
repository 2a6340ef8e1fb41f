use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use carchive_core::{BufferId, BufferItemId, EntityRef};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persistence class of a buffer.
/// Ephemeral buffers are swept at process end, session buffers live for one
/// CLI/API session, persistent buffers stay until deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    Ephemeral,
    Session,
    Persistent,
}

impl Default for BufferKind {
    fn default() -> Self {
        Self::Session
    }
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ephemeral => write!(f, "ephemeral"),
            Self::Session => write!(f, "session"),
            Self::Persistent => write!(f, "persistent"),
        }
    }
}

impl std::str::FromStr for BufferKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(Self::Ephemeral),
            "session" => Ok(Self::Session),
            "persistent" => Ok(Self::Persistent),
            other => Err(format!("unknown buffer kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferRow {
    pub id: BufferId,
    pub name: String,
    pub kind: BufferKind,
    pub session_scope: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferItemRow {
    pub id: BufferItemId,
    pub buffer_id: BufferId,
    pub entity: EntityRef,
    pub position: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// An item to insert. `position: None` means "unordered": the item sorts after
/// all positioned items, in insertion order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferItemSpec {
    pub entity: EntityRef,
    pub position: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl BufferItemSpec {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            position: None,
            metadata: None,
        }
    }

    pub fn at(entity: EntityRef, position: i64) -> Self {
        Self {
            entity,
            position: Some(position),
            metadata: None,
        }
    }
}

/// Creation parameters for a buffer, optionally pre-seeded with items.
#[derive(Clone, Debug, Default)]
pub struct NewBuffer {
    pub name: String,
    pub kind: BufferKind,
    pub session_scope: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub items: Vec<BufferItemSpec>,
}

impl NewBuffer {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct BufferPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

pub struct BufferRepo {
    db: Database,
}

impl BufferRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create a buffer with its initial items in one transaction.
    /// Fails with DuplicateName when `(name, session_scope)` is taken.
    #[instrument(skip(self, spec), fields(name = %spec.name, kind = %spec.kind))]
    pub fn create(&self, spec: &NewBuffer) -> Result<BufferRow, StoreError> {
        self.db.with_tx(|conn| Self::create_in(conn, spec))
    }

    /// Transaction-scoped variant of [`create`](Self::create), for callers that
    /// batch the creation with other writes.
    pub fn create_in(conn: &Connection, spec: &NewBuffer) -> Result<BufferRow, StoreError> {
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM results_buffers WHERE name = ?1 AND session_scope IS ?2",
                rusqlite::params![spec.name, spec.session_scope],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::DuplicateName {
                name: spec.name.clone(),
                scope: spec.session_scope.clone(),
            });
        }

        let id = BufferId::new();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO results_buffers (id, name, kind, session_scope, description, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id.as_str(),
                spec.name,
                spec.kind.to_string(),
                spec.session_scope,
                spec.description,
                spec.metadata.as_ref().map(serde_json::Value::to_string),
                now,
                now,
            ],
        )?;

        for item in &spec.items {
            insert_item(conn, &id, item, item.position)?;
        }

        Ok(BufferRow {
            id,
            name: spec.name.clone(),
            kind: spec.kind,
            session_scope: spec.session_scope.clone(),
            description: spec.description.clone(),
            metadata: spec.metadata.clone(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a buffer by id; absence is not an error.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn get(&self, id: &BufferId) -> Result<Option<BufferRow>, StoreError> {
        self.db.with_conn(|conn| Self::get_in(conn, id))
    }

    pub fn get_in(conn: &Connection, id: &BufferId) -> Result<Option<BufferRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, session_scope, description, metadata, created_at, updated_at
             FROM results_buffers WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_buffer(row)?)),
            None => Ok(None),
        }
    }

    /// Look up a buffer by name within a session scope.
    #[instrument(skip(self), fields(name, scope))]
    pub fn get_by_name(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<BufferRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, session_scope, description, metadata, created_at, updated_at
                 FROM results_buffers WHERE name = ?1 AND session_scope IS ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![name, scope])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_buffer(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List buffers, optionally narrowed by scope and kind, newest first.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        scope: Option<&str>,
        kind: Option<BufferKind>,
    ) -> Result<Vec<BufferRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, name, kind, session_scope, description, metadata, created_at, updated_at
                 FROM results_buffers WHERE 1=1",
            );
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(scope) = scope {
                sql.push_str(&format!(" AND session_scope IS ?{}", params.len() + 1));
                params.push(Box::new(scope.to_string()));
            }
            if let Some(kind) = kind {
                sql.push_str(&format!(" AND kind = ?{}", params.len() + 1));
                params.push(Box::new(kind.to_string()));
            }
            sql.push_str(" ORDER BY created_at DESC, id DESC");

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_buffer(row)?);
            }
            Ok(results)
        })
    }

    /// Partial update of name/description/metadata.
    /// Renaming re-checks `(name, session_scope)` uniqueness.
    #[instrument(skip(self, patch), fields(buffer_id = %id))]
    pub fn update(&self, id: &BufferId, patch: &BufferPatch) -> Result<BufferRow, StoreError> {
        self.db.with_tx(|conn| {
            let current = Self::get_in(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("buffer {id}")))?;

            if let Some(name) = &patch.name {
                if *name != current.name {
                    let taken: Option<String> = conn
                        .query_row(
                            "SELECT id FROM results_buffers
                             WHERE name = ?1 AND session_scope IS ?2 AND id != ?3",
                            rusqlite::params![name, current.session_scope, id.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if taken.is_some() {
                        return Err(StoreError::DuplicateName {
                            name: name.clone(),
                            scope: current.session_scope.clone(),
                        });
                    }
                }
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE results_buffers SET
                    name = COALESCE(?1, name),
                    description = COALESCE(?2, description),
                    metadata = COALESCE(?3, metadata),
                    updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    patch.name,
                    patch.description,
                    patch.metadata.as_ref().map(serde_json::Value::to_string),
                    now,
                    id.as_str(),
                ],
            )?;

            Self::get_in(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("buffer {id}")))
        })
    }

    /// Delete a buffer and its items. Idempotent: returns whether a row went away.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn delete(&self, id: &BufferId) -> Result<bool, StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "DELETE FROM buffer_items WHERE buffer_id = ?1",
                [id.as_str()],
            )?;
            let rows = conn.execute(
                "DELETE FROM results_buffers WHERE id = ?1",
                [id.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Remove all items from a buffer without deleting the buffer itself.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn clear(&self, id: &BufferId) -> Result<bool, StoreError> {
        self.db.with_tx(|conn| {
            if Self::get_in(conn, id)?.is_none() {
                return Ok(false);
            }
            conn.execute(
                "DELETE FROM buffer_items WHERE buffer_id = ?1",
                [id.as_str()],
            )?;
            touch(conn, id)?;
            Ok(true)
        })
    }

    /// Append items, skipping identity keys already present in the buffer (and
    /// duplicates within the batch). All-or-nothing; returns the number of rows
    /// actually inserted.
    #[instrument(skip(self, items), fields(buffer_id = %id, batch = items.len()))]
    pub fn add_items(
        &self,
        id: &BufferId,
        items: &[BufferItemSpec],
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| Self::append_items_in(conn, id, items))
    }

    /// Transaction-scoped variant of [`add_items`](Self::add_items).
    pub fn append_items_in(
        conn: &Connection,
        id: &BufferId,
        items: &[BufferItemSpec],
    ) -> Result<usize, StoreError> {
        if Self::get_in(conn, id)?.is_none() {
            return Err(StoreError::NotFound(format!("buffer {id}")));
        }

        let mut present: HashSet<EntityRef> = Self::list_items_in(conn, id)?
            .into_iter()
            .map(|item| item.entity)
            .collect();

        // Unpositioned rows sort after every positioned row, so once a buffer
        // holds any, appending with assigned positions would jump the queue.
        // In that case new rows stay unpositioned and rowid order keeps them
        // at the tail.
        let unpositioned: i64 = conn.query_row(
            "SELECT COUNT(*) FROM buffer_items WHERE buffer_id = ?1 AND position IS NULL",
            [id.as_str()],
            |row| row.get(0),
        )?;
        let max_pos: Option<i64> = conn.query_row(
            "SELECT MAX(position) FROM buffer_items WHERE buffer_id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )?;
        let mut next_pos = if unpositioned > 0 {
            None
        } else {
            Some(max_pos.map_or(0, |p| p + 1))
        };

        let mut inserted = 0;
        for item in items {
            if !present.insert(item.entity.clone()) {
                continue;
            }
            let position = match item.position {
                Some(p) => Some(p),
                None => match next_pos.as_mut() {
                    Some(p) => {
                        let assigned = *p;
                        *p += 1;
                        Some(assigned)
                    }
                    None => None,
                },
            };
            insert_item(conn, id, item, position)?;
            inserted += 1;
        }

        if inserted > 0 {
            touch(conn, id)?;
        }
        Ok(inserted)
    }

    /// Items sorted by non-null position ascending, then unpositioned items in
    /// insertion order. This is the observable iteration order for display and
    /// conversion, so it must stay stable.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn list_items(&self, id: &BufferId) -> Result<Vec<BufferItemRow>, StoreError> {
        self.db.with_conn(|conn| Self::list_items_in(conn, id))
    }

    pub fn list_items_in(
        conn: &Connection,
        id: &BufferId,
    ) -> Result<Vec<BufferItemRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, buffer_id, message_id, conversation_id, chunk_id, agent_output_id, position, metadata
             FROM buffer_items WHERE buffer_id = ?1
             ORDER BY position IS NULL, position ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_item(row)?);
        }
        Ok(results)
    }

    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn count_items(&self, id: &BufferId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM buffer_items WHERE buffer_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Drop all ephemeral buffers; returns how many buffers were removed.
    #[instrument(skip(self))]
    pub fn purge_ephemeral(&self) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "DELETE FROM buffer_items WHERE buffer_id IN
                   (SELECT id FROM results_buffers WHERE kind = 'ephemeral')",
                [],
            )?;
            let rows = conn.execute(
                "DELETE FROM results_buffers WHERE kind = 'ephemeral'",
                [],
            )?;
            Ok(rows)
        })
    }

    /// Drop session and ephemeral buffers belonging to a finished session scope.
    /// Persistent buffers in the scope are kept.
    #[instrument(skip(self), fields(scope))]
    pub fn purge_session_scope(&self, scope: &str) -> Result<usize, StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "DELETE FROM buffer_items WHERE buffer_id IN
                   (SELECT id FROM results_buffers
                    WHERE session_scope = ?1 AND kind IN ('session', 'ephemeral'))",
                [scope],
            )?;
            let rows = conn.execute(
                "DELETE FROM results_buffers
                 WHERE session_scope = ?1 AND kind IN ('session', 'ephemeral')",
                [scope],
            )?;
            Ok(rows)
        })
    }
}

fn insert_item(
    conn: &Connection,
    buffer_id: &BufferId,
    item: &BufferItemSpec,
    position: Option<i64>,
) -> Result<(), StoreError> {
    let (message_id, conversation_id, chunk_id, agent_output_id) = item.entity.parts();
    conn.execute(
        "INSERT INTO buffer_items (id, buffer_id, message_id, conversation_id, chunk_id, agent_output_id, position, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            BufferItemId::new().as_str(),
            buffer_id.as_str(),
            message_id,
            conversation_id,
            chunk_id,
            agent_output_id,
            position,
            item.metadata.as_ref().map(serde_json::Value::to_string),
        ],
    )?;
    Ok(())
}

fn touch(conn: &Connection, id: &BufferId) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE results_buffers SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
    )?;
    Ok(())
}

fn row_to_buffer(row: &rusqlite::Row<'_>) -> Result<BufferRow, StoreError> {
    let kind_str: String = row_helpers::get(row, 2, "results_buffers", "kind")?;
    let metadata = row_helpers::get_opt::<String>(row, 5, "results_buffers", "metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "results_buffers", "metadata"))
        .transpose()?;

    Ok(BufferRow {
        id: BufferId::from_raw(row_helpers::get::<String>(row, 0, "results_buffers", "id")?),
        name: row_helpers::get(row, 1, "results_buffers", "name")?,
        kind: row_helpers::parse_enum(&kind_str, "results_buffers", "kind")?,
        session_scope: row_helpers::get_opt(row, 3, "results_buffers", "session_scope")?,
        description: row_helpers::get_opt(row, 4, "results_buffers", "description")?,
        metadata,
        created_at: row_helpers::get(row, 6, "results_buffers", "created_at")?,
        updated_at: row_helpers::get(row, 7, "results_buffers", "updated_at")?,
    })
}

fn row_to_item(row: &rusqlite::Row<'_>) -> Result<BufferItemRow, StoreError> {
    let entity = EntityRef::from_parts(
        row_helpers::get_opt(row, 2, "buffer_items", "message_id")?,
        row_helpers::get_opt(row, 3, "buffer_items", "conversation_id")?,
        row_helpers::get_opt(row, 4, "buffer_items", "chunk_id")?,
        row_helpers::get_opt(row, 5, "buffer_items", "agent_output_id")?,
    )
    .map_err(|e| StoreError::CorruptRow {
        table: "buffer_items",
        column: "message_id",
        detail: e.to_string(),
    })?;
    let metadata = row_helpers::get_opt::<String>(row, 7, "buffer_items", "metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "buffer_items", "metadata"))
        .transpose()?;

    Ok(BufferItemRow {
        id: BufferItemId::from_raw(row_helpers::get::<String>(row, 0, "buffer_items", "id")?),
        buffer_id: BufferId::from_raw(row_helpers::get::<String>(row, 1, "buffer_items", "buffer_id")?),
        entity,
        position: row_helpers::get_opt(row, 6, "buffer_items", "position")?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use carchive_core::{ConversationId, MessageId};

    fn repo() -> BufferRepo {
        BufferRepo::new(Database::in_memory().unwrap())
    }

    fn msg(n: u32) -> EntityRef {
        EntityRef::Message(MessageId::from_raw(format!("msg_{n}")))
    }

    fn conv(n: u32) -> EntityRef {
        EntityRef::Conversation(ConversationId::from_raw(format!("conv_{n}")))
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("results")).unwrap();
        assert!(buffer.id.as_str().starts_with("buf_"));
        assert_eq!(buffer.kind, BufferKind::Session);

        let fetched = repo.get(&buffer.id).unwrap().unwrap();
        assert_eq!(fetched.name, "results");
    }

    #[test]
    fn get_missing_is_none_not_error() {
        let repo = repo();
        assert!(repo.get(&BufferId::from_raw("buf_missing")).unwrap().is_none());
    }

    #[test]
    fn create_with_initial_items() {
        let repo = repo();
        let mut spec = NewBuffer::named("seeded");
        spec.items = vec![BufferItemSpec::new(msg(1)), BufferItemSpec::new(conv(7))];
        let buffer = repo.create(&spec).unwrap();

        let items = repo.list_items(&buffer.id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].entity, msg(1));
        assert_eq!(items[1].entity, conv(7));
    }

    #[test]
    fn duplicate_name_same_scope_rejected() {
        let repo = repo();
        let mut spec = NewBuffer::named("results");
        spec.session_scope = Some("cli-1".into());
        repo.create(&spec).unwrap();

        let err = repo.create(&spec).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }), "got: {err}");
    }

    #[test]
    fn duplicate_name_different_scope_allowed() {
        let repo = repo();
        let mut a = NewBuffer::named("results");
        a.session_scope = Some("cli-1".into());
        repo.create(&a).unwrap();

        let mut b = NewBuffer::named("results");
        b.session_scope = Some("cli-2".into());
        repo.create(&b).unwrap();

        let found = repo.get_by_name("results", Some("cli-2")).unwrap().unwrap();
        assert_eq!(found.session_scope.as_deref(), Some("cli-2"));
    }

    #[test]
    fn create_surfaces_storage_errors() {
        let repo = repo();
        repo.database()
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE buffer_items; DROP TABLE results_buffers;")
                    .map_err(StoreError::from)
            })
            .unwrap();

        // A broken store must not read as "name available".
        let err = repo.create(&NewBuffer::named("x")).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)), "got: {err}");
    }

    #[test]
    fn duplicate_name_null_scope_rejected() {
        let repo = repo();
        repo.create(&NewBuffer::named("scratch")).unwrap();
        let err = repo.create(&NewBuffer::named("scratch")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));
    }

    #[test]
    fn failed_create_inserts_nothing() {
        let repo = repo();
        repo.create(&NewBuffer::named("taken")).unwrap();

        let mut spec = NewBuffer::named("taken");
        spec.items = vec![BufferItemSpec::new(msg(1))];
        assert!(repo.create(&spec).is_err());

        // Only the first buffer's (empty) item list exists.
        let all = repo.list(None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(repo.count_items(&all[0].id).unwrap(), 0);
    }

    #[test]
    fn update_patches_fields() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("old")).unwrap();

        let patch = BufferPatch {
            name: Some("new".into()),
            description: Some("kept results".into()),
            metadata: Some(serde_json::json!({"source": "search"})),
        };
        let updated = repo.update(&buffer.id, &patch).unwrap();
        assert_eq!(updated.name, "new");
        assert_eq!(updated.description.as_deref(), Some("kept results"));
        assert_eq!(updated.metadata.unwrap()["source"], "search");
    }

    #[test]
    fn update_missing_is_not_found() {
        let repo = repo();
        let err = repo
            .update(&BufferId::from_raw("buf_missing"), &BufferPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn rename_to_taken_name_rejected() {
        let repo = repo();
        repo.create(&NewBuffer::named("a")).unwrap();
        let b = repo.create(&NewBuffer::named("b")).unwrap();

        let patch = BufferPatch {
            name: Some("a".into()),
            ..Default::default()
        };
        let err = repo.update(&b.id, &patch).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("gone")).unwrap();
        assert!(repo.delete(&buffer.id).unwrap());
        assert!(!repo.delete(&buffer.id).unwrap());
        assert!(repo.get(&buffer.id).unwrap().is_none());
    }

    #[test]
    fn delete_cascades_to_items() {
        let repo = repo();
        let mut spec = NewBuffer::named("full");
        spec.items = vec![BufferItemSpec::new(msg(1))];
        let buffer = repo.create(&spec).unwrap();
        repo.delete(&buffer.id).unwrap();

        let orphans: i64 = repo
            .database()
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM buffer_items", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn clear_keeps_buffer() {
        let repo = repo();
        let mut spec = NewBuffer::named("full");
        spec.items = vec![BufferItemSpec::new(msg(1)), BufferItemSpec::new(msg(2))];
        let buffer = repo.create(&spec).unwrap();

        assert!(repo.clear(&buffer.id).unwrap());
        assert_eq!(repo.count_items(&buffer.id).unwrap(), 0);
        assert!(repo.get(&buffer.id).unwrap().is_some());

        assert!(!repo.clear(&BufferId::from_raw("buf_missing")).unwrap());
    }

    #[test]
    fn add_items_skips_duplicates() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("dedup")).unwrap();

        let added = repo
            .add_items(&buffer.id, &[BufferItemSpec::new(msg(1)), BufferItemSpec::new(msg(2))])
            .unwrap();
        assert_eq!(added, 2);

        // Same identity key again: skipped, not an error.
        let added = repo
            .add_items(&buffer.id, &[BufferItemSpec::new(msg(1)), BufferItemSpec::new(msg(3))])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(repo.count_items(&buffer.id).unwrap(), 3);
    }

    #[test]
    fn add_items_dedups_within_batch() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("batch")).unwrap();
        let added = repo
            .add_items(&buffer.id, &[BufferItemSpec::new(msg(1)), BufferItemSpec::new(msg(1))])
            .unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn same_id_different_kind_is_distinct() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("kinds")).unwrap();
        let a = EntityRef::Message(MessageId::from_raw("shared"));
        let b = EntityRef::Conversation(ConversationId::from_raw("shared"));
        let added = repo
            .add_items(&buffer.id, &[BufferItemSpec::new(a), BufferItemSpec::new(b)])
            .unwrap();
        assert_eq!(added, 2);
    }

    #[test]
    fn add_items_to_missing_buffer_fails() {
        let repo = repo();
        let err = repo
            .add_items(&BufferId::from_raw("buf_missing"), &[BufferItemSpec::new(msg(1))])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn add_items_touches_updated_at() {
        let repo = repo();
        let buffer = repo.create(&NewBuffer::named("touched")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.add_items(&buffer.id, &[BufferItemSpec::new(msg(1))]).unwrap();
        let after = repo.get(&buffer.id).unwrap().unwrap();
        assert!(after.updated_at > buffer.updated_at);
    }

    #[test]
    fn ordering_positions_first_then_insertion_order() {
        let repo = repo();
        let mut spec = NewBuffer::named("ordered");
        spec.items = vec![
            BufferItemSpec::new(msg(10)),      // unpositioned, inserted first
            BufferItemSpec::at(msg(2), 5),
            BufferItemSpec::new(conv(11)),     // unpositioned, inserted second
            BufferItemSpec::at(msg(1), 2),
        ];
        let buffer = repo.create(&spec).unwrap();

        let order: Vec<EntityRef> = repo
            .list_items(&buffer.id)
            .unwrap()
            .into_iter()
            .map(|item| item.entity)
            .collect();
        assert_eq!(order, vec![msg(1), msg(2), msg(10), conv(11)]);
    }

    #[test]
    fn appended_items_sort_after_existing() {
        let repo = repo();
        let mut spec = NewBuffer::named("grow");
        spec.items = vec![BufferItemSpec::at(msg(1), 0), BufferItemSpec::at(msg(2), 1)];
        let buffer = repo.create(&spec).unwrap();

        repo.add_items(&buffer.id, &[BufferItemSpec::new(msg(3))]).unwrap();
        let order: Vec<EntityRef> = repo
            .list_items(&buffer.id)
            .unwrap()
            .into_iter()
            .map(|item| item.entity)
            .collect();
        assert_eq!(order, vec![msg(1), msg(2), msg(3)]);
    }

    #[test]
    fn append_after_unpositioned_items_keeps_them_first() {
        let repo = repo();
        let mut spec = NewBuffer::named("tail");
        spec.items = vec![BufferItemSpec::new(msg(1)), BufferItemSpec::new(msg(2))];
        let buffer = repo.create(&spec).unwrap();

        repo.add_items(&buffer.id, &[BufferItemSpec::new(msg(3))]).unwrap();
        repo.add_items(&buffer.id, &[BufferItemSpec::new(msg(4))]).unwrap();

        let order: Vec<EntityRef> = repo
            .list_items(&buffer.id)
            .unwrap()
            .into_iter()
            .map(|item| item.entity)
            .collect();
        assert_eq!(order, vec![msg(1), msg(2), msg(3), msg(4)]);
    }

    #[test]
    fn list_filters_by_scope_and_kind() {
        let repo = repo();
        let mut a = NewBuffer::named("a");
        a.session_scope = Some("cli-1".into());
        a.kind = BufferKind::Persistent;
        repo.create(&a).unwrap();

        let mut b = NewBuffer::named("b");
        b.session_scope = Some("cli-1".into());
        repo.create(&b).unwrap();

        repo.create(&NewBuffer::named("c")).unwrap();

        assert_eq!(repo.list(Some("cli-1"), None).unwrap().len(), 2);
        assert_eq!(repo.list(Some("cli-1"), Some(BufferKind::Persistent)).unwrap().len(), 1);
        assert_eq!(repo.list(None, None).unwrap().len(), 3);
    }

    #[test]
    fn purge_ephemeral_removes_only_ephemeral() {
        let repo = repo();
        let mut e = NewBuffer::named("scratch");
        e.kind = BufferKind::Ephemeral;
        e.items = vec![BufferItemSpec::new(msg(1))];
        repo.create(&e).unwrap();
        repo.create(&NewBuffer::named("kept")).unwrap();

        assert_eq!(repo.purge_ephemeral().unwrap(), 1);
        assert_eq!(repo.list(None, None).unwrap().len(), 1);
    }

    #[test]
    fn purge_session_scope_keeps_persistent() {
        let repo = repo();
        let mut s = NewBuffer::named("session-buf");
        s.session_scope = Some("cli-1".into());
        repo.create(&s).unwrap();

        let mut p = NewBuffer::named("pinned");
        p.session_scope = Some("cli-1".into());
        p.kind = BufferKind::Persistent;
        repo.create(&p).unwrap();

        assert_eq!(repo.purge_session_scope("cli-1").unwrap(), 1);
        let left = repo.list(Some("cli-1"), None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, BufferKind::Persistent);
    }

    #[test]
    fn buffer_kind_parse_roundtrip() {
        for kind in [BufferKind::Ephemeral, BufferKind::Session, BufferKind::Persistent] {
            let parsed: BufferKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
