use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use carchive_core::{
    AgentOutputId, ChunkId, ConversationId, EntityKind, EntityRef, MessageId,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: Option<ConversationId>,
    pub role: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub has_media: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentOutputRecord {
    pub id: AgentOutputId,
    pub target: EntityRef,
    pub output_type: String,
    pub agent_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Read access to archive entities, keyed by id. Absence is `None`, never an
/// error: buffers may hold references to rows deleted since they were added.
pub trait EntityReader: Send + Sync {
    fn read_message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError>;
    fn read_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError>;
    fn read_chunk(&self, id: &ChunkId) -> Result<Option<ChunkRecord>, StoreError>;
    fn read_agent_output(
        &self,
        id: &AgentOutputId,
    ) -> Result<Option<AgentOutputRecord>, StoreError>;
}

/// Archive entity storage backed by the shared database.
pub struct ArchiveRepo {
    db: Database,
}

impl ArchiveRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(role))]
    pub fn insert_message(
        &self,
        conversation_id: Option<&ConversationId>,
        role: &str,
        content: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, StoreError> {
        let id = MessageId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.map(|c| c.as_str().to_string()),
                    role,
                    content,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn attach_media(
        &self,
        message_id: &MessageId,
        media_type: &str,
        file_path: &str,
    ) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let media_id = uuid::Uuid::now_v7().to_string();
            conn.execute(
                "INSERT INTO media (id, media_type, file_path, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![media_id, media_type, file_path, Utc::now().to_rfc3339()],
            )?;
            conn.execute(
                "INSERT INTO message_media (id, message_id, media_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    uuid::Uuid::now_v7().to_string(),
                    message_id.as_str(),
                    media_id,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, title))]
    pub fn insert_conversation(
        &self,
        title: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<ConversationId, StoreError> {
        let id = ConversationId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), title, created_at.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    #[instrument(skip(self, content))]
    pub fn insert_chunk(
        &self,
        message_id: Option<&MessageId>,
        content: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<ChunkId, StoreError> {
        let id = ChunkId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chunks (id, message_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.as_str(),
                    message_id.map(|m| m.as_str().to_string()),
                    content,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    #[instrument(skip(self, content), fields(target = %target, output_type, agent_name))]
    pub fn insert_agent_output(
        &self,
        target: &EntityRef,
        output_type: &str,
        agent_name: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<AgentOutputId, StoreError> {
        let id = AgentOutputId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_outputs (id, target_kind, target_id, output_type, agent_name, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    target.kind().to_string(),
                    target.id_str(),
                    output_type,
                    agent_name,
                    content,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }
}

impl EntityReader for ArchiveRepo {
    fn read_message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.role, m.content, m.created_at,
                        EXISTS (SELECT 1 FROM message_media mm WHERE mm.message_id = m.id)
                 FROM messages m WHERE m.id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }

    fn read_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, title, created_at FROM conversations WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let created: String = row_helpers::get(row, 2, "conversations", "created_at")?;
                    Ok(Some(ConversationRecord {
                        id: ConversationId::from_raw(row_helpers::get::<String>(
                            row,
                            0,
                            "conversations",
                            "id",
                        )?),
                        title: row_helpers::get_opt(row, 1, "conversations", "title")?,
                        created_at: row_helpers::parse_timestamp(
                            &created,
                            "conversations",
                            "created_at",
                        )?,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    fn read_chunk(&self, id: &ChunkId) -> Result<Option<ChunkRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, content, created_at FROM chunks WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let created: String = row_helpers::get(row, 2, "chunks", "created_at")?;
                    Ok(Some(ChunkRecord {
                        id: ChunkId::from_raw(row_helpers::get::<String>(row, 0, "chunks", "id")?),
                        content: row_helpers::get_opt(row, 1, "chunks", "content")?,
                        created_at: row_helpers::parse_timestamp(&created, "chunks", "created_at")?,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    fn read_agent_output(
        &self,
        id: &AgentOutputId,
    ) -> Result<Option<AgentOutputRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_kind, target_id, output_type, agent_name, content, created_at
                 FROM agent_outputs WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_agent_output(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let created: String = row_helpers::get(row, 4, "messages", "created_at")?;
    Ok(MessageRecord {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: row_helpers::get_opt::<String>(row, 1, "messages", "conversation_id")?
            .map(ConversationId::from_raw),
        role: row_helpers::get(row, 2, "messages", "role")?,
        content: row_helpers::get_opt(row, 3, "messages", "content")?,
        created_at: row_helpers::parse_timestamp(&created, "messages", "created_at")?,
        has_media: row_helpers::get::<bool>(row, 5, "messages", "has_media")?,
    })
}

fn row_to_agent_output(row: &rusqlite::Row<'_>) -> Result<AgentOutputRecord, StoreError> {
    let kind_str: String = row_helpers::get(row, 1, "agent_outputs", "target_kind")?;
    let kind: EntityKind = row_helpers::parse_enum(&kind_str, "agent_outputs", "target_kind")?;
    let target_id: String = row_helpers::get(row, 2, "agent_outputs", "target_id")?;
    let target = match kind {
        EntityKind::Message => EntityRef::Message(MessageId::from_raw(target_id)),
        EntityKind::Conversation => EntityRef::Conversation(ConversationId::from_raw(target_id)),
        EntityKind::Chunk => EntityRef::Chunk(ChunkId::from_raw(target_id)),
        EntityKind::AgentOutput => EntityRef::AgentOutput(AgentOutputId::from_raw(target_id)),
    };
    let created: String = row_helpers::get(row, 6, "agent_outputs", "created_at")?;

    Ok(AgentOutputRecord {
        id: AgentOutputId::from_raw(row_helpers::get::<String>(row, 0, "agent_outputs", "id")?),
        target,
        output_type: row_helpers::get(row, 3, "agent_outputs", "output_type")?,
        agent_name: row_helpers::get(row, 4, "agent_outputs", "agent_name")?,
        content: row_helpers::get(row, 5, "agent_outputs", "content")?,
        created_at: row_helpers::parse_timestamp(&created, "agent_outputs", "created_at")?,
    })
}
