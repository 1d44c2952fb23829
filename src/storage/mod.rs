//! Storage engine: pages, the disk page manager, node views and the
//! in-memory leaf mirror.

mod memnode;
mod node;
mod page;
mod pager;

pub use memnode::MemoryLeafNode;
pub use node::{
    node_kind, IndexEntry, IndexNode, LeafEntry, LeafNode, NodeKind, INDEX_ENTRY_LEN,
    LEAF_ENTRY_LEN, NODE_HEADER_LEN, NODE_INDEX, NODE_LEAF,
};
pub use page::Page;
pub use pager::{DiskPageManager, HEADER_PAGE_ID, MIN_PAGE_SIZE};
