//! The B-tree/Recno page engine: page shapes live in
//! `crate::page::btree`, this module covers everything built on top of
//! them — allocation, overflow and off-page-duplicate chains, the tree
//! itself and its cursor protocol.

pub mod alloc;
pub mod comparator;
pub mod cursor;
pub mod dup;
pub mod overflow;
pub mod tree;

pub use comparator::{default_comparator, Comparator};
pub use cursor::{Cursor, CursorFlags};
pub use tree::{BTree, BTreeStats, PutMode, SearchMode};
