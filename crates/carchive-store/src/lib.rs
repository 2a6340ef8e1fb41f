//! SQLite-backed storage for the archive buffer system.
//!
//! Layout mirrors one repository struct per table group: [`BufferRepo`] for
//! working buffers, [`CollectionRepo`] for durable collections, and
//! [`ArchiveRepo`] for the archive entities buffers point at. All repositories
//! share one [`Database`] handle; multi-statement writes go through
//! [`Database::with_tx`] so they commit or roll back as a unit.

pub mod buffers;
pub mod collections;
pub mod database;
pub mod entities;
pub mod error;
pub mod row_helpers;
pub mod schema;

pub use buffers::{
    BufferItemRow, BufferItemSpec, BufferKind, BufferPatch, BufferRepo, BufferRow, NewBuffer,
};
pub use collections::{CollectionItemRow, CollectionRepo, CollectionRow};
pub use database::Database;
pub use entities::{
    AgentOutputRecord, ArchiveRepo, ChunkRecord, ConversationRecord, EntityReader, MessageRecord,
};
pub use error::StoreError;
