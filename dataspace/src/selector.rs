//! Query selectors: a resource key plus an opaque predicate.

use crate::error::SelectorError;
use crate::key::{self, ResourceBindings, ResourceKey};
use std::fmt;
use std::str::FromStr;

/// Separator between the key and the predicate in textual form.
const PREDICATE_SEPARATOR: char = '?';

/// A validated resource key with an optional predicate.
///
/// The key is always a resolved path: numeric resource ids are looked up in
/// the session's binding table when the selector is built. The predicate is
/// never interpreted here; it is forwarded to queryables as-is.
///
/// # Example
///
/// ```rust,ignore
/// let selector: Selector = "/demo/example/**?value>10".parse()?;
/// assert_eq!(selector.key(), "/demo/example/**");
/// assert_eq!(selector.predicate(), "value>10");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    key: String,
    predicate: String,
}

impl Selector {
    /// Build a selector from a path and a predicate.
    ///
    /// # Errors
    ///
    /// Returns the [`SelectorError`] reported by key validation.
    pub fn new(key: impl Into<String>, predicate: impl Into<String>) -> Result<Self, SelectorError> {
        let key = key.into();
        key::validate(&key)?;
        Ok(Self {
            key,
            predicate: predicate.into(),
        })
    }

    /// Parse the textual form `key?predicate`.
    ///
    /// Everything after the first `?` is the predicate.
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        match text.split_once(PREDICATE_SEPARATOR) {
            Some((key, predicate)) => Self::new(key, predicate),
            None => Self::new(text, ""),
        }
    }

    /// Build a selector from a resource key and a predicate, resolving
    /// numeric ids against `bindings`.
    ///
    /// A literal key may carry its own `?predicate`; it is used only when
    /// `predicate` is empty.
    ///
    /// # Errors
    ///
    /// - `SelectorError::UnresolvedKey` if the key's id is not bound
    /// - any validation error of the resolved path
    pub fn resolve(
        key: &ResourceKey,
        predicate: &str,
        bindings: &ResourceBindings,
    ) -> Result<Self, SelectorError> {
        let path = bindings
            .resolve(key)
            .ok_or_else(|| SelectorError::UnresolvedKey(key.to_string()))?;

        let mut selector = Self::parse(&path)?;
        if !predicate.is_empty() {
            selector.predicate = predicate.to_string();
        }
        Ok(selector)
    }

    /// The resolved key path.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The predicate, empty when none was given.
    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// Whether a published resource name falls under this selector.
    pub fn matches(&self, res_name: &str) -> bool {
        key::matches(res_name, &self.key)
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predicate.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}{}{}", self.key, PREDICATE_SEPARATOR, self.predicate)
        }
    }
}
