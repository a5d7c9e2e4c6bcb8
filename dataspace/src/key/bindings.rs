//! Binding table from numeric resource ids to paths.

use crate::id::ResourceId;
use crate::key::ResourceKey;
use std::borrow::Cow;
use std::collections::HashMap;

/// Per-session table of resource id bindings.
///
/// Ids are issued from 1 upward and never reused. Declaring a path that is
/// already bound returns the existing id.
#[derive(Debug)]
pub struct ResourceBindings {
    next_id: u64,
    by_id: HashMap<ResourceId, String>,
}

impl ResourceBindings {
    /// Create an empty binding table.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_id: HashMap::new(),
        }
    }

    /// Bind a path to a fresh id, or return the id it is already bound to.
    pub fn declare(&mut self, name: impl Into<String>) -> ResourceId {
        let name = name.into();
        if let Some((id, _)) = self.by_id.iter().find(|(_, bound)| **bound == name) {
            return *id;
        }

        let id = ResourceId::new(self.next_id);
        self.next_id += 1;
        self.by_id.insert(id, name);
        id
    }

    /// Remove a binding. Returns the path it was bound to.
    pub fn undeclare(&mut self, id: ResourceId) -> Option<String> {
        self.by_id.remove(&id)
    }

    /// Look up the path bound to an id.
    pub fn name_of(&self, id: ResourceId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Resolve a key to its full path.
    ///
    /// Returns `None` when the key's id is not bound.
    pub fn resolve<'a>(&'a self, key: &'a ResourceKey) -> Option<Cow<'a, str>> {
        match key {
            ResourceKey::Name(name) => Some(Cow::Borrowed(name.as_str())),
            ResourceKey::Id(id) => self.name_of(*id).map(Cow::Borrowed),
            ResourceKey::IdWithSuffix(id, suffix) => self
                .name_of(*id)
                .map(|prefix| Cow::Owned(format!("{}{}", prefix, suffix))),
        }
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table has no bindings.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for ResourceBindings {
    fn default() -> Self {
        Self::new()
    }
}
