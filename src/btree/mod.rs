//! Component F — the copy-on-write B+tree.
//!
//! `node` is the on-page layout; `tree` is the search/insert/delete
//! algorithm, generic over a [`tree::PageSource`] so the transaction layer
//! can plug in the real page pool without this module touching mmap.

pub mod node;
pub mod tree;

pub use node::{branch_capacity, leaf_capacity, NODE_HEADER_OFFSET, DATA_OFFSET};
pub use tree::{Cursor, PathStep, PageSource, Tree, MAX_DEPTH};
