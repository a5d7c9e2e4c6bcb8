//! Resource key: a literal path or a numeric alias bound to one.

use crate::id::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a named resource, either literally or through a declared id.
///
/// # Variants
///
/// - `Name`: a literal path such as `/demo/example/item`
/// - `Id`: an id bound to a path by `Session::declare_resource`
/// - `IdWithSuffix`: an id whose bound path is extended by a suffix
///   (e.g. id bound to `/demo` plus suffix `/example/**`)
///
/// # Invariants
///
/// - Numeric variants must be resolved through a
///   [`ResourceBindings`](super::ResourceBindings) table before matching
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    Name(String),
    Id(ResourceId),
    IdWithSuffix(ResourceId, String),
}

impl ResourceKey {
    /// The numeric id, if this key is not a literal path.
    pub fn id(&self) -> Option<ResourceId> {
        match self {
            ResourceKey::Name(_) => None,
            ResourceKey::Id(id) | ResourceKey::IdWithSuffix(id, _) => Some(*id),
        }
    }

    /// Whether this key needs the binding table to be resolved.
    pub fn is_numeric(&self) -> bool {
        self.id().is_some()
    }
}

impl From<&str> for ResourceKey {
    fn from(name: &str) -> Self {
        ResourceKey::Name(name.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(name: String) -> Self {
        ResourceKey::Name(name)
    }
}

impl From<ResourceId> for ResourceKey {
    fn from(id: ResourceId) -> Self {
        ResourceKey::Id(id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Name(name) => write!(f, "{}", name),
            ResourceKey::Id(id) => write!(f, "{}", id),
            ResourceKey::IdWithSuffix(id, suffix) => write!(f, "{}{}", id, suffix),
        }
    }
}
