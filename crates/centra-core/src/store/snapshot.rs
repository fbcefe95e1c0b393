// ── Immutable snapshots ──
//
// The snapshot is the only state touched from more than one logical
// flow, and its discipline is swap-not-mutate: a snapshot is never
// edited after construction. Refreshes build a whole new one; push
// updates build a successor with a single record slot replaced.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::InstanceRecord;

/// An immutable aggregate view of every known instance: per-entity-type
/// ordered lists plus a derived id index for O(1) lookup.
///
/// The index is built in full before a snapshot becomes visible, so the
/// two can never disagree. Readers holding an older snapshot keep a
/// fully consistent (if stale) view.
#[derive(Debug, Default)]
pub struct Snapshot {
    lists: HashMap<String, Vec<Arc<InstanceRecord>>>,
    index: HashMap<String, Arc<InstanceRecord>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from per-entity-type record lists, deriving the
    /// index.
    pub(crate) fn from_lists(lists: HashMap<String, Vec<Arc<InstanceRecord>>>) -> Self {
        let mut index = HashMap::new();
        for records in lists.values() {
            for record in records {
                index.insert(record.instance_id.clone(), Arc::clone(record));
            }
        }
        Self { lists, index }
    }

    /// Resolve an instance id to its entity type and current record.
    pub fn resolve(&self, instance_id: &str) -> Option<&Arc<InstanceRecord>> {
        self.index.get(instance_id)
    }

    /// Look up one record by its full key.
    pub fn get(&self, entity_type: &str, instance_id: &str) -> Option<&Arc<InstanceRecord>> {
        self.index
            .get(instance_id)
            .filter(|record| record.entity_type == entity_type)
    }

    /// All records of one entity type, in poll order.
    pub fn list(&self, entity_type: &str) -> &[Arc<InstanceRecord>] {
        self.lists.get(entity_type).map_or(&[], Vec::as_slice)
    }

    /// Iterate over every record, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<InstanceRecord>> {
        self.index.values()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Successor snapshot with one record's slot replaced: an in-place
    /// list search by id, then the index assignment. The previous record
    /// object is untouched -- readers holding it are unaffected.
    pub(crate) fn with_record(&self, record: Arc<InstanceRecord>) -> Self {
        let mut lists = self.lists.clone();
        if let Some(list) = lists.get_mut(&record.entity_type) {
            if let Some(slot) = list
                .iter_mut()
                .find(|r| r.instance_id == record.instance_id)
            {
                *slot = Arc::clone(&record);
            }
        }

        let mut index = self.index.clone();
        index.insert(record.instance_id.clone(), record);

        Self { lists, index }
    }
}
