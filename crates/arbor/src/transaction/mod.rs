//! The transaction manager and its satellites.

/// Boomerang wave tracking for mutations that round-trip through other
/// cells.
pub mod boomerang;

/// Leader-side lease table.
pub mod lease;

/// Start/replicate/prepare/commit/abort lifecycle and timestamp holders.
pub mod manager;

/// Replicated and recently-finished transaction presence cache.
pub mod presence;
