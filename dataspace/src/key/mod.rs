//! Resource keys, id bindings and key matching.

pub mod bindings;
pub mod expr;
pub mod matcher;

// Re-exports
pub use bindings::ResourceBindings;
pub use expr::ResourceKey;
pub use matcher::{intersects, key_intersects, matches, validate, MAX_SEGMENTS};
