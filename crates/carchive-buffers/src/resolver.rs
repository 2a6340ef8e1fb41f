use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use carchive_core::{BufferId, EntityRef};
use carchive_store::{EntityReader, StoreError};

use crate::BufferEngine;

/// A buffer item joined with its archive entity. Field meaning varies by kind:
/// conversations surface their title as `content`, only messages carry a role
/// or media flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub entity: EntityRef,
    pub role: Option<String>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub has_media: bool,
}

/// Resolution output: live entities in buffer order, plus the count of items
/// whose archive rows no longer exist.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub entities: Vec<ResolvedEntity>,
    pub dropped: usize,
}

/// Look up one reference. `None` means the archive row is gone (a dangling
/// item), which callers treat as skippable rather than fatal.
pub(crate) fn resolve_ref(
    reader: &dyn EntityReader,
    entity: &EntityRef,
) -> Result<Option<ResolvedEntity>, StoreError> {
    let resolved = match entity {
        EntityRef::Message(id) => reader.read_message(id)?.map(|m| ResolvedEntity {
            entity: entity.clone(),
            role: Some(m.role),
            content: m.content,
            created_at: m.created_at,
            has_media: m.has_media,
        }),
        EntityRef::Conversation(id) => reader.read_conversation(id)?.map(|c| ResolvedEntity {
            entity: entity.clone(),
            role: None,
            content: c.title,
            created_at: c.created_at,
            has_media: false,
        }),
        EntityRef::Chunk(id) => reader.read_chunk(id)?.map(|c| ResolvedEntity {
            entity: entity.clone(),
            role: None,
            content: c.content,
            created_at: c.created_at,
            has_media: false,
        }),
        EntityRef::AgentOutput(id) => reader.read_agent_output(id)?.map(|g| ResolvedEntity {
            entity: entity.clone(),
            role: None,
            content: Some(g.content),
            created_at: g.created_at,
            has_media: false,
        }),
    };
    Ok(resolved)
}

impl BufferEngine {
    /// Resolve every item of a buffer against the archive, in buffer order.
    /// Dangling items are dropped and counted, not errors.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn resolve(&self, id: &BufferId) -> Result<Resolution, StoreError> {
        self.require_buffer(id)?;

        let items = self.buffers().list_items(id)?;
        let mut entities = Vec::with_capacity(items.len());
        let mut dropped = 0;
        for item in items {
            match resolve_ref(self.reader(), &item.entity)? {
                Some(resolved) => entities.push(resolved),
                None => {
                    warn!(entity = %item.entity, "buffer item no longer resolves, skipping");
                    dropped += 1;
                }
            }
        }

        Ok(Resolution { entities, dropped })
    }
}
