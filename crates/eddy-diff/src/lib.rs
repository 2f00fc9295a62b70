//! List reconciliation for Eddy live queries.
//!
//! Brings an ordered list in line with a freshly computed one while
//! emitting a short sequence of index-based edits that a UI list (or any
//! mirror of the old list) can replay.
//!
//! # Key Types
//!
//! - [`ListChange`] -- one insert/remove/replace/reset edit
//! - [`ListDiff`] -- the ordered edits produced by one reconciliation
//! - [`reconcile`] -- the single forward pass that produces them

pub mod change;
pub mod reconcile;

pub use change::{ListChange, ListDiff};
pub use reconcile::reconcile;
