//! B+-tree cell decoding and traversal (components C4 cell layer, C5).
//!
//! Organization mirrors the layered iterator design this crate grew from:
//! `cell` decodes the bytes of one page's cells into branch/leaf shapes; `walker`
//! drives a depth-first traversal across pages using a pager-backed page source.

pub mod cell;
pub mod walker;

pub use cell::{BranchCell, LeafCell};
pub use walker::{PageSource, TreeWalker, Visitor};
