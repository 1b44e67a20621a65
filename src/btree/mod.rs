//! Concurrent B+ tree with multi-valued leaves.
//!
//! Leaf entries hold every ObjectId of a key, inline while small and
//! in a sorted overflow chain once the entry outgrows its leaf.

pub mod cursor;
pub mod key;
pub mod page;
pub mod tree;

pub use cursor::{fetch, fetch_next, CompOp, Cursor, CursorFlag};
pub use key::{compare_keys, KeyCol, KeyDesc, KeyKind, KeyValue};
pub use tree::{
    create_index, delete, drop_index, get_statistics, insert, PageInfo, PageInfoKind,
};
