//!
//! The process-wide buffer manager: one instance composing the segment
//! allocator, the two segment-backed page caches, their sweepers, the epoch
//! tracker, and the object-level caches every resource shares.
//!
//! The instance is created lazily by the first [`open_resource`] call and
//! torn down by the last [`ResourceHandle`] drop: sweepers are cancelled and
//! awaited, the caches drained, and the allocator (with its mappings) dies
//! with the last `Arc` pointing at it. Re-initialization afterwards is
//! allowed and creates a fresh pool.
//!
//! The singleton is reachable only through resource handles; leaf code never
//! does a global lookup, it gets the manager passed down. The statics below
//! exist solely to wire `open_resource` calls from independent call sites to
//! the same pool.
//!
//! Handles must be dropped from synchronous contexts: teardown parks on the
//! sweeper tasks.
//!

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwapOption;
use camino::Utf8PathBuf;
use dashmap::DashMap;
use hashlink::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::id::{DatabaseId, ResourceId};
use utils::revision::Revision;

use crate::config::{PoolConf, ResourceConf};
use crate::disk::{ResourceStorage, RevisionRoot};
use crate::epochs::RevisionEpochs;
use crate::metrics::{OBJECT_CACHE_READ_ACCESSES, OBJECT_CACHE_READ_HITS};
use crate::page_cache::PageCache;
use crate::segment_alloc::SegmentAllocator;
use crate::sweeper::spawn_sweepers;
use crate::task_mgr::BACKGROUND_RUNTIME;
use crate::txn::{FetchError, ReadTxn, WriteTxn};

static BUFFER_MANAGER: Lazy<ArcSwapOption<BufferManager>> =
    Lazy::new(ArcSwapOption::empty);
static LIFECYCLE_LOCK: Mutex<()> = Mutex::new(());

/// Entry-capped LRU for plain heap objects (revision roots, names, path
/// summaries). These are not segment-backed: their capacity is a literal
/// count, independent of the physical budget.
pub struct ObjectCache<K, V> {
    name: &'static str,
    map: Mutex<LruCache<K, V>>,
}

impl<K: Eq + Hash, V: Clone> ObjectCache<K, V> {
    fn new(name: &'static str, capacity: usize) -> ObjectCache<K, V> {
        ObjectCache {
            name,
            map: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        OBJECT_CACHE_READ_ACCESSES
            .with_label_values(&[self.name])
            .inc();
        let hit = self.map.lock().get(key).cloned();
        if hit.is_some() {
            OBJECT_CACHE_READ_HITS
                .with_label_values(&[self.name])
                .inc();
        }
        hit
    }

    pub fn insert(&self, key: K, value: V) {
        self.map.lock().insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.map.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.map.lock().clear();
    }
}

/// Shared state of one open resource.
pub(crate) struct ResourceInner {
    pub(crate) database_id: DatabaseId,
    pub(crate) resource_id: ResourceId,
    pub(crate) conf: ResourceConf,
    pub(crate) storage: Arc<ResourceStorage>,
    /// Write single-flight: commits are not serializable at this layer, so
    /// at most one writer per resource exists at a time.
    pub(crate) write_flight: AtomicBool,
}

/// Everything needed to open one resource.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub database_id: DatabaseId,
    pub resource_id: ResourceId,
    pub path: Utf8PathBuf,
    pub conf: ResourceConf,
}

pub struct BufferManager {
    conf: PoolConf,
    allocator: Arc<SegmentAllocator>,
    record_page_cache: Arc<PageCache>,
    fragment_cache: Arc<PageCache>,
    epochs: Arc<RevisionEpochs>,

    revision_roots: ObjectCache<(DatabaseId, ResourceId, Revision), RevisionRoot>,
    names: ObjectCache<(DatabaseId, ResourceId, i32), Arc<str>>,
    path_summaries: ObjectCache<(DatabaseId, ResourceId, Revision), Arc<[u8]>>,

    resources: DashMap<(DatabaseId, ResourceId), Arc<ResourceInner>>,
    open_resources: AtomicUsize,
    cancel: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferManager {
    fn launch(conf: PoolConf) -> Arc<BufferManager> {
        let allocator = SegmentAllocator::new(&conf);
        let record_page_cache = Arc::new(PageCache::new(
            "record_page",
            conf.shards,
            conf.record_page_cache_weight(),
        ));
        let fragment_cache = Arc::new(PageCache::new(
            "record_page_fragment",
            conf.shards,
            conf.fragment_cache_weight(),
        ));
        let epochs = Arc::new(RevisionEpochs::new());
        let cancel = CancellationToken::new();

        let sweepers = spawn_sweepers(
            &[Arc::clone(&record_page_cache), Arc::clone(&fragment_cache)],
            Arc::clone(&epochs),
            Arc::clone(&allocator),
            conf.sweeper_interval,
            cancel.clone(),
        );
        info!(
            budget = conf.physical_budget_bytes,
            shards = conf.shards,
            sweepers = sweepers.len(),
            "buffer pool initialized"
        );

        Arc::new(BufferManager {
            revision_roots: ObjectCache::new("revision_root", conf.revision_root_cache_entries),
            names: ObjectCache::new("name", conf.name_cache_entries),
            path_summaries: ObjectCache::new(
                "path_summary",
                conf.path_summary_cache_entries,
            ),
            conf,
            allocator,
            record_page_cache,
            fragment_cache,
            epochs,
            resources: DashMap::new(),
            open_resources: AtomicUsize::new(0),
            cancel,
            sweepers: Mutex::new(sweepers),
        })
    }

    pub fn conf(&self) -> &PoolConf {
        &self.conf
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.allocator
    }

    pub fn record_page_cache(&self) -> &Arc<PageCache> {
        &self.record_page_cache
    }

    pub fn fragment_cache(&self) -> &Arc<PageCache> {
        &self.fragment_cache
    }

    pub fn epochs(&self) -> &RevisionEpochs {
        &self.epochs
    }

    pub fn names(&self) -> &ObjectCache<(DatabaseId, ResourceId, i32), Arc<str>> {
        &self.names
    }

    pub fn path_summaries(
        &self,
    ) -> &ObjectCache<(DatabaseId, ResourceId, Revision), Arc<[u8]>> {
        &self.path_summaries
    }

    fn open_resource_locked(
        self: &Arc<Self>,
        spec: ResourceSpec,
    ) -> anyhow::Result<ResourceHandle> {
        let key = (spec.database_id, spec.resource_id);
        if self.resources.contains_key(&key) {
            anyhow::bail!(
                "resource {}/{} is already open",
                spec.database_id,
                spec.resource_id
            );
        }
        let storage = ResourceStorage::open(&spec.path)
            .with_context(|| format!("could not open resource file {}", spec.path))?;
        let inner = Arc::new(ResourceInner {
            database_id: spec.database_id,
            resource_id: spec.resource_id,
            conf: spec.conf,
            storage: Arc::new(storage),
            write_flight: AtomicBool::new(false),
        });
        self.resources.insert(key, Arc::clone(&inner));
        self.open_resources.fetch_add(1, Ordering::AcqRel);
        Ok(ResourceHandle {
            mgr: Arc::clone(self),
            inner,
        })
    }

    /// Last-close teardown: stop the sweepers, drain every cache, drop the
    /// global reference. Runs under the lifecycle lock.
    fn teardown(&self) {
        self.cancel.cancel();
        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        BACKGROUND_RUNTIME.block_on(async {
            for handle in sweepers {
                let _ = handle.await;
            }
        });
        self.record_page_cache.drain();
        self.fragment_cache.drain();
        self.revision_roots.clear();
        self.names.clear();
        self.path_summaries.clear();
        info!(
            physical_bytes = self.allocator.physical_bytes(),
            slices_in_use = self.allocator.slices_in_use(),
            "buffer pool shut down"
        );
    }
}

///
/// A caller's capability on one open resource. Dropping the handle closes
/// the resource; dropping the last handle of the pool tears the pool down.
///
pub struct ResourceHandle {
    mgr: Arc<BufferManager>,
    inner: Arc<ResourceInner>,
}

impl ResourceHandle {
    pub fn database_id(&self) -> DatabaseId {
        self.inner.database_id
    }

    pub fn resource_id(&self) -> ResourceId {
        self.inner.resource_id
    }

    pub fn committed_revision(&self) -> Revision {
        self.inner.storage.committed_revision()
    }

    pub fn begin_read(&self, revision: Revision) -> Result<ReadTxn, FetchError> {
        ReadTxn::begin(
            Arc::clone(&self.mgr),
            Arc::clone(&self.inner),
            revision,
        )
    }

    pub fn begin_read_latest(&self) -> Result<ReadTxn, FetchError> {
        self.begin_read(self.committed_revision())
    }

    pub fn begin_write(&self, base_revision: Revision) -> Result<WriteTxn, FetchError> {
        WriteTxn::begin(
            Arc::clone(&self.mgr),
            Arc::clone(&self.inner),
            base_revision,
        )
    }

    /// Per-commit metadata, through the revision-root cache.
    pub fn revision_root(&self, revision: Revision) -> Option<RevisionRoot> {
        let key = (self.inner.database_id, self.inner.resource_id, revision);
        if let Some(root) = self.mgr.revision_roots.get(&key) {
            return Some(root);
        }
        let root = self.inner.storage.revision_root(revision)?;
        self.mgr.revision_roots.insert(key, root);
        Some(root)
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.mgr
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        let _guard = LIFECYCLE_LOCK.lock();
        let key = (self.inner.database_id, self.inner.resource_id);
        self.mgr.resources.remove(&key);
        self.mgr.epochs.forget_resource(key.0, key.1);
        if self.mgr.open_resources.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.mgr.teardown();
            BUFFER_MANAGER.store(None);
        }
    }
}

///
/// Open a resource, initializing the process-wide pool on first use.
/// `pool_conf` only takes effect for that first initialization; later calls
/// join the existing pool.
///
pub fn open_resource(spec: ResourceSpec, pool_conf: &PoolConf) -> anyhow::Result<ResourceHandle> {
    let _guard = LIFECYCLE_LOCK.lock();
    let mgr = match BUFFER_MANAGER.load_full() {
        Some(mgr) => {
            if mgr.conf != *pool_conf {
                warn!("buffer pool already initialized; ignoring differing pool configuration");
            }
            mgr
        }
        None => {
            pool_conf.validate()?;
            let mgr = BufferManager::launch(pool_conf.clone());
            BUFFER_MANAGER.store(Some(Arc::clone(&mgr)));
            mgr
        }
    };
    mgr.open_resource_locked(spec)
}

/// Explicit form of dropping the handle.
pub fn close_resource(handle: ResourceHandle) {
    drop(handle);
}
