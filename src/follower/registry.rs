//! Registry of stacks under observation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::resource::ResourceLocator;

/// Concurrent map from remote stack identifier to owning resource.
///
/// Safe for concurrent insert, remove, lookup and iteration without
/// external locking.
#[derive(Debug, Default)]
pub struct FollowRegistry {
    entries: DashMap<String, ResourceLocator>,
}

impl FollowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry unless the identifier is already registered.
    ///
    /// Returns true if the entry was inserted.
    pub fn insert_if_absent(&self, stack_id: &str, locator: ResourceLocator) -> bool {
        match self.entries.entry(stack_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(locator);
                true
            }
        }
    }

    /// Removes an entry, returning its locator if it was present.
    pub fn remove(&self, stack_id: &str) -> Option<ResourceLocator> {
        self.entries.remove(stack_id).map(|(_, locator)| locator)
    }

    /// Returns true if the identifier is registered.
    #[must_use]
    pub fn contains(&self, stack_id: &str) -> bool {
        self.entries.contains_key(stack_id)
    }

    /// Copies the current entries.
    ///
    /// Iterating the copy holds no shard locks, so entries may be removed
    /// while the copy is being processed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ResourceLocator)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of registered stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
