//! Operations over result buffers: resolving items against the archive,
//! filtering, set algebra, and export to durable collections.
//!
//! [`BufferEngine`] is the entry point. Reads and archive lookups happen
//! outside write transactions; each derivation then commits its buffer or
//! collection writes atomically through the store layer.

pub mod export;
pub mod filter;
pub mod resolver;
pub mod setops;

use std::sync::Arc;

use carchive_core::BufferId;
use carchive_store::{
    ArchiveRepo, BufferItemSpec, BufferRepo, BufferRow, CollectionRepo, Database, EntityReader,
    NewBuffer, StoreError,
};

pub use export::ExportReport;
pub use filter::FilterCriteria;
pub use resolver::{ResolvedEntity, Resolution};

/// Where a derived buffer operation writes its result.
#[derive(Clone, Debug)]
pub enum OpTarget {
    /// Create a new buffer; `None` uses the operation's default name.
    New { name: Option<String> },
    /// Append to an existing buffer, skipping items it already holds.
    Buffer(BufferId),
}

impl OpTarget {
    pub fn new_named(name: impl Into<String>) -> Self {
        Self::New {
            name: Some(name.into()),
        }
    }

    pub fn new_default() -> Self {
        Self::New { name: None }
    }
}

/// Outcome of a derivation: either a freshly created buffer or the number of
/// items appended to an existing one.
#[derive(Clone, Debug)]
pub enum BufferOpResult {
    Created(BufferRow),
    Appended { buffer: BufferId, inserted: usize },
}

impl BufferOpResult {
    /// The buffer the result landed in.
    pub fn buffer_id(&self) -> &BufferId {
        match self {
            Self::Created(row) => &row.id,
            Self::Appended { buffer, .. } => buffer,
        }
    }
}

pub struct BufferEngine {
    db: Database,
    buffers: BufferRepo,
    collections: CollectionRepo,
    reader: Arc<dyn EntityReader>,
}

impl BufferEngine {
    pub fn new(db: Database, reader: Arc<dyn EntityReader>) -> Self {
        Self {
            buffers: BufferRepo::new(db.clone()),
            collections: CollectionRepo::new(db.clone()),
            db,
            reader,
        }
    }

    /// Engine whose archive lookups go against the same database.
    pub fn with_archive(db: Database) -> Self {
        let reader = Arc::new(ArchiveRepo::new(db.clone()));
        Self::new(db, reader)
    }

    pub fn buffers(&self) -> &BufferRepo {
        &self.buffers
    }

    pub fn collections(&self) -> &CollectionRepo {
        &self.collections
    }

    pub(crate) fn reader(&self) -> &dyn EntityReader {
        self.reader.as_ref()
    }

    pub(crate) fn require_buffer(&self, id: &BufferId) -> Result<BufferRow, StoreError> {
        self.buffers
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(format!("buffer {id}")))
    }

    /// Commit derived items to the target. Item metadata travels with each
    /// spec, so "which source's metadata wins" is decided by the caller. New
    /// buffers inherit kind and scope from `origin` and number their items
    /// 0..n; appends reuse the store's dedup-and-extend semantics.
    pub(crate) fn commit_items(
        &self,
        target: &OpTarget,
        default_name: &str,
        origin: &BufferRow,
        items: Vec<BufferItemSpec>,
    ) -> Result<BufferOpResult, StoreError> {
        match target {
            OpTarget::New { name } => {
                let mut spec = NewBuffer::named(
                    name.clone().unwrap_or_else(|| default_name.to_string()),
                );
                spec.kind = origin.kind;
                spec.session_scope = origin.session_scope.clone();
                spec.items = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut item)| {
                        item.position = Some(i as i64);
                        item
                    })
                    .collect();
                Ok(BufferOpResult::Created(self.buffers.create(&spec)?))
            }
            OpTarget::Buffer(id) => {
                let inserted = self.buffers.add_items(id, &items)?;
                Ok(BufferOpResult::Appended {
                    buffer: id.clone(),
                    inserted,
                })
            }
        }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}
