use std::collections::HashSet;

use tracing::instrument;

use carchive_core::{BufferId, EntityRef};
use carchive_store::{BufferItemRow, BufferItemSpec, BufferRow, StoreError};

use crate::{BufferEngine, BufferOpResult, OpTarget};

fn to_spec(item: BufferItemRow) -> BufferItemSpec {
    BufferItemSpec {
        entity: item.entity,
        position: None,
        metadata: item.metadata,
    }
}

impl BufferEngine {
    /// Items present in every input, in the first input's order. Requires at
    /// least two inputs; default name "Intersection".
    #[instrument(skip(self, target), fields(inputs = inputs.len()))]
    pub fn intersect(
        &self,
        inputs: &[BufferId],
        target: &OpTarget,
    ) -> Result<BufferOpResult, StoreError> {
        if inputs.len() < 2 {
            return Err(StoreError::InvalidInput(format!(
                "intersection needs at least 2 buffers, got {}",
                inputs.len()
            )));
        }
        let (origin, mut loaded) = self.load_inputs(inputs)?;

        let mut common: Option<HashSet<EntityRef>> = None;
        for items in &loaded {
            let keys: HashSet<EntityRef> = items.iter().map(|i| i.entity.clone()).collect();
            common = Some(match common {
                Some(acc) => acc.intersection(&keys).cloned().collect(),
                None => keys,
            });
        }
        let common = common.unwrap_or_default();

        // Item data (metadata) comes from the first input buffer.
        let mut seen = HashSet::new();
        let result: Vec<BufferItemSpec> = loaded
            .swap_remove(0)
            .into_iter()
            .filter(|item| common.contains(&item.entity) && seen.insert(item.entity.clone()))
            .map(to_spec)
            .collect();

        self.commit_items(target, "Intersection", &origin, result)
    }

    /// Items present in any input, first occurrence wins for ordering.
    /// With `deduplicate` off a new buffer keeps every occurrence; appending
    /// to an existing buffer always deduplicates. Default name "Union".
    #[instrument(skip(self, target), fields(inputs = inputs.len(), deduplicate))]
    pub fn union(
        &self,
        inputs: &[BufferId],
        deduplicate: bool,
        target: &OpTarget,
    ) -> Result<BufferOpResult, StoreError> {
        if inputs.is_empty() {
            return Err(StoreError::InvalidInput(
                "union needs at least 1 buffer".into(),
            ));
        }
        let (origin, loaded) = self.load_inputs(inputs)?;

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for items in loaded {
            for item in items {
                if deduplicate && !seen.insert(item.entity.clone()) {
                    continue;
                }
                result.push(to_spec(item));
            }
        }

        self.commit_items(target, "Union", &origin, result)
    }

    /// Items of `primary` whose identity key is not in the union of the
    /// exclude buffers, in primary order. Subtracting nothing yields a copy
    /// of the primary. Default name "Difference".
    #[instrument(skip(self, target), fields(primary = %primary, excludes = excludes.len()))]
    pub fn difference(
        &self,
        primary: &BufferId,
        excludes: &[BufferId],
        target: &OpTarget,
    ) -> Result<BufferOpResult, StoreError> {
        let origin = self.require_buffer(primary)?;
        let primary_items = self.buffers().list_items(primary)?;

        let mut removed = HashSet::new();
        for id in excludes {
            self.require_buffer(id)?;
            for item in self.buffers().list_items(id)? {
                removed.insert(item.entity);
            }
        }

        let result: Vec<BufferItemSpec> = primary_items
            .into_iter()
            .filter(|item| !removed.contains(&item.entity))
            .map(to_spec)
            .collect();

        self.commit_items(target, "Difference", &origin, result)
    }

    /// Load each input's items in buffer order; the first buffer is the origin
    /// new result buffers inherit kind and scope from.
    fn load_inputs(
        &self,
        inputs: &[BufferId],
    ) -> Result<(BufferRow, Vec<Vec<BufferItemRow>>), StoreError> {
        let origin = self.require_buffer(&inputs[0])?;
        let mut loaded = Vec::with_capacity(inputs.len());
        for id in inputs {
            self.require_buffer(id)?;
            loaded.push(self.buffers().list_items(id)?);
        }
        Ok((origin, loaded))
    }
}
