use std::collections::HashSet;

use tracing::{instrument, warn};

use carchive_core::{BufferId, CollectionRef, EntityRef};
use carchive_store::{CollectionRepo, CollectionRow, StoreError};

use crate::resolver::resolve_ref;
use crate::BufferEngine;

/// Outcome of an export: the created collection plus the number of buffer
/// items that could not be carried over.
#[derive(Clone, Debug)]
pub struct ExportReport {
    pub collection: CollectionRow,
    pub dropped: usize,
}

impl BufferEngine {
    /// Export a buffer into a new durable collection.
    ///
    /// Agent output items are replaced by the entity the output was produced
    /// from, since collections only store messages, conversations, and chunks.
    /// Items that no longer resolve (or whose substituted target does not) are
    /// dropped and counted. The collection write is a single transaction.
    #[instrument(skip(self, description), fields(source = %source, name))]
    pub fn export_to_collection(
        &self,
        source: &BufferId,
        name: &str,
        description: Option<&str>,
    ) -> Result<ExportReport, StoreError> {
        self.require_buffer(source)?;

        let mut seen: HashSet<CollectionRef> = HashSet::new();
        let mut items: Vec<CollectionRef> = Vec::new();
        let mut dropped = 0;

        for item in self.buffers().list_items(source)? {
            let candidate = match &item.entity {
                EntityRef::AgentOutput(id) => match self.reader().read_agent_output(id)? {
                    Some(record) => record.target,
                    None => {
                        warn!(entity = %item.entity, "agent output missing, dropped from export");
                        dropped += 1;
                        continue;
                    }
                },
                direct => direct.clone(),
            };

            let collectible = match CollectionRef::try_from(candidate) {
                Ok(c) => c,
                Err(entity) => {
                    // An agent output targeting another agent output.
                    warn!(entity = %entity, "target not collectible, dropped from export");
                    dropped += 1;
                    continue;
                }
            };

            if resolve_ref(self.reader(), &collectible.clone().into())?.is_none() {
                warn!(entity = %item.entity, "entity no longer exists, dropped from export");
                dropped += 1;
                continue;
            }

            if seen.insert(collectible.clone()) {
                items.push(collectible);
            }
        }

        let metadata =
            description.map(|desc| serde_json::json!({ "description": desc }));
        let collection = self.database().with_tx(|conn| {
            CollectionRepo::create_in(conn, name, metadata.as_ref(), &items)
        })?;

        Ok(ExportReport { collection, dropped })
    }
}
