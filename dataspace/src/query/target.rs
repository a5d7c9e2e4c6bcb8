//! Target policies and per-query options.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

bitflags! {
    /// Kinds of queryables a query may address.
    ///
    /// # Flags
    ///
    /// - `STORAGE`: queryables backed by stored values
    /// - `EVAL`: queryables computing values on demand
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryableKind: u64 {
        const STORAGE = 1 << 0;
        const EVAL = 1 << 1;
        const ALL_KINDS = Self::STORAGE.bits() | Self::EVAL.bits();
    }
}

// Manual Serialize/Deserialize for QueryableKind
impl Serialize for QueryableKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryableKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u64::deserialize(deserializer)?;
        Ok(QueryableKind::from_bits_truncate(bits))
    }
}

/// Which of the matching queryables a query is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Target {
    /// The first-declared complete queryable, or every match if none is
    /// complete.
    BestMatching,
    /// Every matching queryable.
    #[default]
    All,
    /// Every matching queryable declared complete.
    AllComplete,
    /// At most `n` matching complete queryables.
    Complete(u64),
}

impl Target {
    /// Apply the policy to matches listed in declaration order.
    ///
    /// `is_complete` reports whether a candidate was declared complete.
    pub fn select<T>(&self, matching: Vec<T>, is_complete: impl Fn(&T) -> bool) -> Vec<T> {
        match self {
            Target::All => matching,
            Target::AllComplete => matching.into_iter().filter(|c| is_complete(c)).collect(),
            Target::BestMatching => {
                match matching.iter().position(|c| is_complete(c)) {
                    Some(best) => matching.into_iter().nth(best).into_iter().collect(),
                    None => matching,
                }
            }
            Target::Complete(n) => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX);
                matching
                    .into_iter()
                    .filter(|c| is_complete(c))
                    .take(n)
                    .collect()
            }
        }
    }
}

/// Routing policy of a query: allowed kinds plus target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTarget {
    pub kinds: QueryableKind,
    pub target: Target,
}

impl QueryTarget {
    /// Policy addressing `target` among queryables of `kinds`.
    pub fn new(kinds: QueryableKind, target: Target) -> Self {
        Self { kinds, target }
    }
}

impl Default for QueryTarget {
    fn default() -> Self {
        Self {
            kinds: QueryableKind::ALL_KINDS,
            target: Target::All,
        }
    }
}

/// How replies for the same resource name are filtered before delivery.
///
/// Consolidation happens on the querying session only and never travels on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueryConsolidation {
    /// Deliver every reply.
    #[default]
    None = 0,
    /// Deliver a reply only when its timestamp is strictly newer than the
    /// last one delivered for the same resource name.
    Monotonic = 1,
    /// Hold replies until the query ends, then deliver only the newest one
    /// per resource name.
    ///
    /// A stamped reply beats an unstamped one; between two unstamped replies
    /// the later arrival wins.
    Latest = 2,
}

/// Per-query options accepted by `Session::query_with`.
///
/// # Example
///
/// ```rust,ignore
/// let options = QueryOptions::default()
///     .with_target(QueryTarget::new(QueryableKind::STORAGE, Target::AllComplete))
///     .with_consolidation(QueryConsolidation::Monotonic)
///     .with_timeout(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub target: QueryTarget,
    pub consolidation: QueryConsolidation,
    /// Whether queryables declared on the querying session are addressed.
    pub local_routing: bool,
    /// Overrides the session's default query timeout.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_target(mut self, target: QueryTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_consolidation(mut self, consolidation: QueryConsolidation) -> Self {
        self.consolidation = consolidation;
        self
    }

    pub fn with_local_routing(mut self, local_routing: bool) -> Self {
        self.local_routing = local_routing;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            target: QueryTarget::default(),
            consolidation: QueryConsolidation::None,
            local_routing: true,
            timeout: None,
        }
    }
}
