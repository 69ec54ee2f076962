use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::osm::elements::{ElementId, Tags};

/// A buffered tag edit of one way.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub id: ElementId,
    pub tags: Tags,
}

/// Way tag edits collected from the map until someone saves them.
///
/// Shared by all users of the process. One entry per way, the last queued
/// tag set wins.
#[derive(Default)]
pub struct PendingEdits {
    edits: Mutex<BTreeMap<ElementId, Tags>>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, way_id: ElementId, tags: Tags) {
        let replaced = self.edits.lock().insert(way_id, tags).is_some();
        log::info!(
            "Queued tags for way {}{}",
            way_id,
            if replaced { " (replacing earlier edit)" } else { "" }
        );
    }

    /// Ordered by way ID.
    pub fn snapshot(&self) -> Vec<PendingEdit> {
        self.edits
            .lock()
            .iter()
            .map(|(id, tags)| PendingEdit {
                id: *id,
                tags: tags.clone(),
            })
            .collect()
    }

    /// Drops the entry for `way_id` if it still holds `tags`. Returns whether it was dropped.
    pub fn acknowledge(&self, way_id: ElementId, tags: &Tags) -> bool {
        let mut edits = self.edits.lock();
        if edits.get(&way_id) == Some(tags) {
            edits.remove(&way_id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.edits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.lock().is_empty()
    }
}
