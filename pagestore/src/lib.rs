//! `pagestore` is the page-oriented buffer pool of a versioned, append-only
//! tree store. It keeps the materialized record pages of every open resource
//! in one process-wide pool of native memory, bounded by a physical budget,
//! and reclaims pages with an MVCC-aware clock sweeper instead of per-reader
//! pin bookkeeping.
//!
//! The crate is organized around the page lifecycle:
//!
//! * [`segment_alloc`] hands out fixed size-class slices of anonymous mappings
//!   and takes them back when a page dies.
//! * [`page`] is the key-value leaf page that owns those slices and carries
//!   the atomic guard/version/hot state the rest of the crate relies on.
//! * [`page_cache`] maps composite page references to guarded pages.
//! * [`sweeper`] walks the cache shards in the background and returns dead
//!   pages' memory to the allocator.
//! * [`epochs`] tracks the oldest revision any live reader still needs.
//! * [`versioning`] rebuilds a revision's view of a page from its persisted
//!   fragments.
//! * [`intent_log`] owns a writer's uncommitted pages until commit/rollback.
//! * [`txn`] is the read/write transaction surface, [`buffer_manager`] the
//!   process-wide composition of all of the above.

pub mod buffer_manager;
pub mod config;
pub mod disk;
pub mod epochs;
pub mod intent_log;
pub mod metrics;
pub mod page;
pub mod page_cache;
pub mod segment_alloc;
pub mod sweeper;
pub mod task_mgr;
pub mod txn;
pub mod versioning;

pub use buffer_manager::{
    close_resource, open_resource, BufferManager, ResourceHandle, ResourceSpec,
};
pub use config::{PoolConf, ResourceConf};
pub use page::PageReference;
pub use txn::{FetchError, IndexKind, MutablePageView, PageView, ReadTxn, WriteTxn};
pub use versioning::VersioningType;

/// Number of record slots in one key-value leaf page.
pub const SLOTS_PER_PAGE: usize = 256;
