//! Resource key matching.
//!
//! Keys are `/`-separated paths. In a selector, a `*` segment matches
//! exactly one segment and a `**` segment matches zero or more segments.
//! Matching is case-sensitive and covers the whole path.
//!
//! ```text
//! matches("a/b/c",   "a/**/c")  → true   (** absorbs "b")
//! matches("a/c",     "a/**/c")  → true   (** absorbs nothing)
//! matches("a/b/x/c", "a/*/c")   → false  (* is exactly one segment)
//! ```

use crate::error::SelectorError;
use crate::key::{ResourceBindings, ResourceKey};

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Wildcard matching exactly one segment.
pub const SINGLE_WILD: &str = "*";

/// Wildcard matching zero or more segments.
pub const MULTI_WILD: &str = "**";

/// Most segments a key may have.
pub const MAX_SEGMENTS: usize = 1024;

/// Whether a key contains wildcard segments.
pub fn has_wildcards(key: &str) -> bool {
    key.contains('*')
}

/// Check that a key is well formed.
///
/// # Errors
///
/// - `SelectorError::Empty` for an empty key
/// - `SelectorError::EmptySegment` for `a//b` or a trailing `/`
///   (a single leading `/` is allowed)
/// - `SelectorError::InvalidWildcard` for segments like `a*` or `***`
/// - `SelectorError::TooManySegments` above [`MAX_SEGMENTS`]
pub fn validate(key: &str) -> Result<(), SelectorError> {
    if key.is_empty() {
        return Err(SelectorError::Empty);
    }
    let segments = key.split(SEPARATOR).filter(|s| !s.is_empty()).count();
    if segments > MAX_SEGMENTS {
        return Err(SelectorError::TooManySegments {
            segments,
            max: MAX_SEGMENTS,
        });
    }

    for (index, segment) in key.split(SEPARATOR).enumerate() {
        if segment.is_empty() {
            if index == 0 {
                continue;
            }
            return Err(SelectorError::EmptySegment(key.to_string()));
        }
        if segment.contains('*') && segment != SINGLE_WILD && segment != MULTI_WILD {
            return Err(SelectorError::InvalidWildcard {
                key: key.to_string(),
                segment: segment.to_string(),
            });
        }
    }
    Ok(())
}

/// Whether a published resource name matches a selector key.
///
/// An empty selector matches nothing. A selector without wildcards is a
/// plain string comparison.
pub fn matches(published_name: &str, selector_key: &str) -> bool {
    if selector_key.is_empty() {
        return false;
    }
    if !has_wildcards(selector_key) {
        return published_name == selector_key;
    }

    let name: Vec<&str> = published_name.split(SEPARATOR).collect();
    let pattern: Vec<&str> = selector_key.split(SEPARATOR).collect();
    match_segments(&name, &pattern)
}

/// Glob over segments with a single backtrack point.
///
/// Only the most recent `**` ever needs to be revisited: when a later
/// literal fails, that `**` absorbs one more name segment and matching
/// resumes right after it.
fn match_segments(name: &[&str], pattern: &[&str]) -> bool {
    let mut n = 0;
    let mut p = 0;
    // (index of the last `**` in pattern, name index it currently resumes at)
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && pattern[p] == MULTI_WILD {
            backtrack = Some((p, n));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == SINGLE_WILD || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if let Some((star, resume)) = backtrack {
            p = star + 1;
            n = resume + 1;
            backtrack = Some((star, resume + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == MULTI_WILD {
        p += 1;
    }
    p == pattern.len()
}

/// Whether two keys, both possibly carrying wildcards, share at least one
/// concrete resource name.
///
/// Used to decide whether a queryable declared on a pattern (e.g.
/// `/demo/**`) can answer a query on another pattern (e.g. `/demo/*/item`).
pub fn intersects(left: &str, right: &str) -> bool {
    if left.is_empty() || right.is_empty() {
        return false;
    }
    if !has_wildcards(left) {
        return matches(left, right);
    }
    if !has_wildcards(right) {
        return matches(right, left);
    }

    let l: Vec<&str> = left.split(SEPARATOR).collect();
    let r: Vec<&str> = right.split(SEPARATOR).collect();
    intersect_segments(&l, &r)
}

/// Bottom-up table over suffixes: cell `(i, j)` tells whether `l[i..]` and
/// `r[j..]` intersect. Only rows `i` and `i + 1` are kept.
fn intersect_segments(l: &[&str], r: &[&str]) -> bool {
    // next[j] = cell (i + 1, j), row[j] = cell (i, j)
    let mut next = vec![false; r.len() + 1];
    let mut row = vec![false; r.len() + 1];

    for i in (0..=l.len()).rev() {
        for j in (0..=r.len()).rev() {
            row[j] = match (l.get(i).copied(), r.get(j).copied()) {
                (None, None) => true,
                (Some(a), _) if a == MULTI_WILD => next[j] || (j < r.len() && row[j + 1]),
                (_, Some(b)) if b == MULTI_WILD => row[j + 1] || (i < l.len() && next[j]),
                (Some(a), Some(b)) => (a == SINGLE_WILD || b == SINGLE_WILD || a == b) && next[j + 1],
                _ => false,
            };
        }
        std::mem::swap(&mut next, &mut row);
    }
    next[0]
}

/// Match a declared key against a selector, resolving numeric ids first.
///
/// An id that is not bound fails the match for this key only and logs a
/// warning.
pub fn key_intersects(bindings: &ResourceBindings, declared: &ResourceKey, selector_key: &str) -> bool {
    match bindings.resolve(declared) {
        Some(name) => intersects(&name, selector_key),
        None => {
            tracing::warn!(key = %declared, "unresolved resource id, skipping match");
            false
        }
    }
}
