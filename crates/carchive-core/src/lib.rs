pub mod ids;
pub mod refs;

pub use ids::{
    AgentOutputId, BufferId, BufferItemId, ChunkId, CollectionId, CollectionItemId,
    ConversationId, MessageId,
};
pub use refs::{CollectionRef, EntityKind, EntityRef, ExclusivityError};
