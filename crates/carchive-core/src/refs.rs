//! Tagged references into the archive.
//!
//! A buffer item points at exactly one archive entity. The storage layer keeps
//! one nullable column per entity kind; `EntityRef::from_parts` is the checked
//! boundary that turns those columns back into a value that cannot be ambiguous.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{AgentOutputId, ChunkId, ConversationId, MessageId};

/// The entity kinds a buffer item can reference.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Conversation,
    Chunk,
    AgentOutput,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Conversation => write!(f, "conversation"),
            Self::Chunk => write!(f, "chunk"),
            Self::AgentOutput => write!(f, "agent_output"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "conversation" => Ok(Self::Conversation),
            "chunk" => Ok(Self::Chunk),
            "agent_output" => Ok(Self::AgentOutput),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// A reference that did not name exactly one entity.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("item must reference exactly one entity, found {found} non-null ids")]
pub struct ExclusivityError {
    pub found: usize,
}

/// Reference to exactly one archive entity.
///
/// Identity for set operations is the `(kind, id)` pair; two refs are the same
/// element iff both match. Derived `Eq`/`Hash` give exactly that.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRef {
    Message(MessageId),
    Conversation(ConversationId),
    Chunk(ChunkId),
    AgentOutput(AgentOutputId),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Message(_) => EntityKind::Message,
            Self::Conversation(_) => EntityKind::Conversation,
            Self::Chunk(_) => EntityKind::Chunk,
            Self::AgentOutput(_) => EntityKind::AgentOutput,
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::Message(id) => id.as_str(),
            Self::Conversation(id) => id.as_str(),
            Self::Chunk(id) => id.as_str(),
            Self::AgentOutput(id) => id.as_str(),
        }
    }

    /// Build from one-column-per-kind data, rejecting anything that does not
    /// reference exactly one entity.
    pub fn from_parts(
        message_id: Option<String>,
        conversation_id: Option<String>,
        chunk_id: Option<String>,
        agent_output_id: Option<String>,
    ) -> Result<Self, ExclusivityError> {
        let found = [
            message_id.is_some(),
            conversation_id.is_some(),
            chunk_id.is_some(),
            agent_output_id.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if found != 1 {
            return Err(ExclusivityError { found });
        }
        if let Some(id) = message_id {
            Ok(Self::Message(MessageId::from_raw(id)))
        } else if let Some(id) = conversation_id {
            Ok(Self::Conversation(ConversationId::from_raw(id)))
        } else if let Some(id) = chunk_id {
            Ok(Self::Chunk(ChunkId::from_raw(id)))
        } else {
            // found == 1 and the first three were None
            Ok(Self::AgentOutput(AgentOutputId::from_raw(
                agent_output_id.unwrap_or_default(),
            )))
        }
    }

    /// Decompose into `(message_id, conversation_id, chunk_id, agent_output_id)`
    /// column values; exactly one is `Some`.
    pub fn parts(&self) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
        match self {
            Self::Message(id) => (Some(id.as_str()), None, None, None),
            Self::Conversation(id) => (None, Some(id.as_str()), None, None),
            Self::Chunk(id) => (None, None, Some(id.as_str()), None),
            Self::AgentOutput(id) => (None, None, None, Some(id.as_str())),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id_str())
    }
}

/// Reference stored in a collection item. Collections never hold agent outputs;
/// exports substitute the output's target entity instead.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionRef {
    Message(MessageId),
    Conversation(ConversationId),
    Chunk(ChunkId),
}

impl CollectionRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Message(_) => EntityKind::Message,
            Self::Conversation(_) => EntityKind::Conversation,
            Self::Chunk(_) => EntityKind::Chunk,
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::Message(id) => id.as_str(),
            Self::Conversation(id) => id.as_str(),
            Self::Chunk(id) => id.as_str(),
        }
    }

    /// Same shape as [`EntityRef::from_parts`], over the three storable kinds.
    pub fn from_parts(
        message_id: Option<String>,
        conversation_id: Option<String>,
        chunk_id: Option<String>,
    ) -> Result<Self, ExclusivityError> {
        let entity = EntityRef::from_parts(message_id, conversation_id, chunk_id, None)?;
        // from_parts with a None fourth column can only yield the three kinds below
        Self::try_from(entity).map_err(|_| ExclusivityError { found: 0 })
    }

    pub fn parts(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        match self {
            Self::Message(id) => (Some(id.as_str()), None, None),
            Self::Conversation(id) => (None, Some(id.as_str()), None),
            Self::Chunk(id) => (None, None, Some(id.as_str())),
        }
    }
}

impl TryFrom<EntityRef> for CollectionRef {
    type Error = EntityRef;

    /// Fails with the original ref when it is an agent output, which has no
    /// collection representation.
    fn try_from(entity: EntityRef) -> Result<Self, EntityRef> {
        match entity {
            EntityRef::Message(id) => Ok(Self::Message(id)),
            EntityRef::Conversation(id) => Ok(Self::Conversation(id)),
            EntityRef::Chunk(id) => Ok(Self::Chunk(id)),
            other @ EntityRef::AgentOutput(_) => Err(other),
        }
    }
}

impl From<CollectionRef> for EntityRef {
    fn from(r: CollectionRef) -> Self {
        match r {
            CollectionRef::Message(id) => Self::Message(id),
            CollectionRef::Conversation(id) => Self::Conversation(id),
            CollectionRef::Chunk(id) => Self::Chunk(id),
        }
    }
}
