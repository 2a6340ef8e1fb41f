use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use carchive_core::{CollectionId, CollectionItemId, CollectionRef};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionRow {
    pub id: CollectionId,
    pub name: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionItemRow {
    pub id: CollectionItemId,
    pub collection_id: CollectionId,
    pub entity: CollectionRef,
    pub metadata: Option<serde_json::Value>,
}

/// Durable named groupings of archive entities. Unlike buffers, collections
/// have no lifecycle kind and never reference agent outputs directly.
pub struct CollectionRepo {
    db: Database,
}

impl CollectionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a collection with its items in one transaction.
    #[instrument(skip(self, items, metadata), fields(name, items = items.len()))]
    pub fn create(
        &self,
        name: &str,
        metadata: Option<&serde_json::Value>,
        items: &[CollectionRef],
    ) -> Result<CollectionRow, StoreError> {
        self.db
            .with_tx(|conn| Self::create_in(conn, name, metadata, items))
    }

    /// Transaction-scoped variant of [`create`](Self::create).
    pub fn create_in(
        conn: &Connection,
        name: &str,
        metadata: Option<&serde_json::Value>,
        items: &[CollectionRef],
    ) -> Result<CollectionRow, StoreError> {
        let id = CollectionId::new();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO collections (id, name, metadata, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                id.as_str(),
                name,
                metadata.map(serde_json::Value::to_string),
                now,
            ],
        )?;

        for entity in items {
            let (message_id, conversation_id, chunk_id) = entity.parts();
            conn.execute(
                "INSERT INTO collection_items (id, collection_id, message_id, conversation_id, chunk_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    CollectionItemId::new().as_str(),
                    id.as_str(),
                    message_id,
                    conversation_id,
                    chunk_id,
                ],
            )?;
        }

        Ok(CollectionRow {
            id,
            name: name.to_string(),
            metadata: metadata.cloned(),
            created_at: now,
        })
    }

    #[instrument(skip(self), fields(collection_id = %id))]
    pub fn get(&self, id: &CollectionId) -> Result<Option<CollectionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, metadata, created_at FROM collections WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_collection(row)?)),
                None => Ok(None),
            }
        })
    }

    /// All collections, newest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<CollectionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, metadata, created_at FROM collections
                 ORDER BY created_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_collection(row)?);
            }
            Ok(results)
        })
    }

    /// Items in insertion order.
    #[instrument(skip(self), fields(collection_id = %id))]
    pub fn items(&self, id: &CollectionId) -> Result<Vec<CollectionItemRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, collection_id, message_id, conversation_id, chunk_id, metadata
                 FROM collection_items WHERE collection_id = ?1
                 ORDER BY rowid ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_item(row)?);
            }
            Ok(results)
        })
    }

    /// Delete a collection and its items. Idempotent.
    #[instrument(skip(self), fields(collection_id = %id))]
    pub fn delete(&self, id: &CollectionId) -> Result<bool, StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "DELETE FROM collection_items WHERE collection_id = ?1",
                [id.as_str()],
            )?;
            let rows = conn.execute("DELETE FROM collections WHERE id = ?1", [id.as_str()])?;
            Ok(rows > 0)
        })
    }
}

fn row_to_collection(row: &rusqlite::Row<'_>) -> Result<CollectionRow, StoreError> {
    let metadata = row_helpers::get_opt::<String>(row, 2, "collections", "metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "collections", "metadata"))
        .transpose()?;
    Ok(CollectionRow {
        id: CollectionId::from_raw(row_helpers::get::<String>(row, 0, "collections", "id")?),
        name: row_helpers::get(row, 1, "collections", "name")?,
        metadata,
        created_at: row_helpers::get(row, 3, "collections", "created_at")?,
    })
}

fn row_to_item(row: &rusqlite::Row<'_>) -> Result<CollectionItemRow, StoreError> {
    let entity = CollectionRef::from_parts(
        row_helpers::get_opt(row, 2, "collection_items", "message_id")?,
        row_helpers::get_opt(row, 3, "collection_items", "conversation_id")?,
        row_helpers::get_opt(row, 4, "collection_items", "chunk_id")?,
    )
    .map_err(|e| StoreError::CorruptRow {
        table: "collection_items",
        column: "message_id",
        detail: e.to_string(),
    })?;
    let metadata = row_helpers::get_opt::<String>(row, 5, "collection_items", "metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "collection_items", "metadata"))
        .transpose()?;

    Ok(CollectionItemRow {
        id: CollectionItemId::from_raw(row_helpers::get::<String>(row, 0, "collection_items", "id")?),
        collection_id: CollectionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "collection_items",
            "collection_id",
        )?),
        entity,
        metadata,
    })
}
