//!
//! Global guarded page cache
//!
//! Maps composite [`PageReference`]s to materialized leaf pages. One instance
//! serves every open database and resource of the process; the composite key
//! is what keeps them apart, so the memory budget can flow to whichever
//! resource is hot.
//!
//! # Locking
//!
//! The mapping is split into independently locked shards; critical sections
//! only ever touch one shard's `HashMap` plus the atomics of a single page.
//! Guard acquisition happens *inside* the shard lock: any thread that
//! observed a page through the map holds a non-zero guard count by the time
//! it releases the lock, which is the whole eviction-safety argument: the
//! sweeper checks the count under the same lock.
//!
//! Loading is never done under a lock. On a miss the shard lock is dropped,
//! the loader runs, and the result is inserted under a fresh critical
//! section. Two threads may race the same cold key; the second one finds the
//! winner's entry on re-check, guards it, and retires its own duplicate. The
//! loser's work is wasted, the invariant "one mapped page per key" is not.
//!
//! # Weight
//!
//! Every mapped page contributes its `used_bytes` to its shard's weight,
//! guarded or not. Guards protect a page from *reset*, not from being counted
//!: a guard-exempt weigher would let guarded pages accumulate as zero-cost
//! immortals until the pool is all pinned memory the budget cannot see.
//!

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{IntCounter, UIntGauge};
use parking_lot::Mutex;
use strum_macros::IntoStaticStr;

use crate::metrics::{PAGE_CACHE_EVICTIONS, PAGE_CACHE_READ_ACCESSES, PAGE_CACHE_READ_HITS, PAGE_CACHE_USED_BYTES};
use crate::page::{KeyValueLeafPage, PageGuard, PageReference};

/// Why a mapping was removed; becomes the `reason` label of the eviction
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum EvictionReason {
    /// The clock sweeper retired a page below the revision watermark.
    Sweeper,
    /// A shard exceeded its weight limit.
    Size,
    /// Explicit removal: intent-log drain, poisoned page, teardown.
    Explicit,
    /// The mapping was replaced by a newer materialization of the same key.
    Replaced,
}

struct Shard {
    map: Mutex<HashMap<PageReference, Arc<KeyValueLeafPage>>>,
    used_bytes: AtomicU64,
    read_accesses: IntCounter,
    read_hits: IntCounter,
}

impl Shard {
    fn add_used(&self, bytes: u64, gauge: &UIntGauge) {
        self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
        gauge.add(bytes);
    }

    fn sub_used(&self, bytes: u64, gauge: &UIntGauge) {
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        gauge.sub(bytes);
    }
}

///
/// A sharded map from page reference to guarded leaf page.
///
pub struct PageCache {
    name: &'static str,
    shards: Box<[Shard]>,
    /// Weight limit of one shard; the cache-wide limit divided evenly.
    shard_weight_limit: u64,
    used_bytes_gauge: UIntGauge,
}

impl PageCache {
    pub fn new(name: &'static str, shards: usize, weight_limit: u64) -> PageCache {
        assert!(shards.is_power_of_two(), "shard count must be a power of two");
        let shards: Box<[Shard]> = (0..shards)
            .map(|i| Shard {
                map: Mutex::new(HashMap::new()),
                used_bytes: AtomicU64::new(0),
                read_accesses: PAGE_CACHE_READ_ACCESSES
                    .with_label_values(&[name, &i.to_string()]),
                read_hits: PAGE_CACHE_READ_HITS.with_label_values(&[name, &i.to_string()]),
            })
            .collect();
        let shard_weight_limit = weight_limit / shards.len() as u64;
        PageCache {
            name,
            shards,
            shard_weight_limit,
            used_bytes_gauge: PAGE_CACHE_USED_BYTES.with_label_values(&[name]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, page_ref: &PageReference) -> usize {
        let mut hasher = DefaultHasher::new();
        page_ref.hash(&mut hasher);
        hasher.finish() as usize & (self.shards.len() - 1)
    }

    fn shard(&self, page_ref: &PageReference) -> &Shard {
        &self.shards[self.shard_index(page_ref)]
    }

    ///
    /// Look up `page_ref`, loading and inserting on a miss. Returns a guard
    /// on the mapped page; the guard was acquired under the shard lock.
    ///
    /// `loader` runs without any lock held and may do I/O. It must return a
    /// fully materialized, unpublished page.
    ///
    pub fn get_and_guard<E>(
        &self,
        page_ref: &PageReference,
        loader: impl FnOnce() -> Result<Arc<KeyValueLeafPage>, E>,
    ) -> Result<PageGuard, E> {
        let shard = self.shard(page_ref);
        shard.read_accesses.inc();

        {
            let mut map = shard.map.lock();
            match map.get(page_ref) {
                Some(page) if !page.is_closed() && !page.is_poisoned() => {
                    page.acquire_guard_count();
                    page.mark_hot();
                    shard.read_hits.inc();
                    return Ok(PageGuard::adopt(Arc::clone(page)));
                }
                Some(_) => {
                    // A closed or poisoned page is a dead mapping; drop it so
                    // the load below replaces it.
                    let dead = map.remove(page_ref).expect("checked above");
                    shard.sub_used(dead.used_bytes(), &self.used_bytes_gauge);
                    self.count_eviction(EvictionReason::Replaced);
                }
                None => {}
            }
        }

        let loaded = loader()?;

        let mut map = shard.map.lock();
        match map.entry(*page_ref) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                // Lost the load race: adopt the winner, retire our duplicate.
                let winner = Arc::clone(entry.get());
                winner.acquire_guard_count();
                winner.mark_hot();
                drop(map);
                loaded.reset();
                Ok(PageGuard::adopt(winner))
            }
            Entry::Occupied(mut entry) => {
                let dead = entry.insert(Arc::clone(&loaded));
                shard.sub_used(dead.used_bytes(), &self.used_bytes_gauge);
                shard.add_used(loaded.used_bytes(), &self.used_bytes_gauge);
                self.count_eviction(EvictionReason::Replaced);
                loaded.acquire_guard_count();
                loaded.mark_hot();
                Ok(PageGuard::adopt(loaded))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&loaded));
                shard.add_used(loaded.used_bytes(), &self.used_bytes_gauge);
                loaded.acquire_guard_count();
                loaded.mark_hot();
                Ok(PageGuard::adopt(loaded))
            }
        }
    }

    /// Hit-only lookup: guard the mapped page if present and alive.
    pub fn try_get_and_guard(&self, page_ref: &PageReference) -> Option<PageGuard> {
        let shard = self.shard(page_ref);
        shard.read_accesses.inc();
        let map = shard.map.lock();
        let page = map.get(page_ref)?;
        if page.is_closed() || page.is_poisoned() {
            return None;
        }
        page.acquire_guard_count();
        page.mark_hot();
        shard.read_hits.inc();
        Some(PageGuard::adopt(Arc::clone(page)))
    }

    ///
    /// Remove a mapping. If the page is unguarded its segments return to the
    /// allocator immediately; a guarded page becomes an orphan reset by its
    /// final guard drop. Returns whether a mapping existed.
    ///
    pub fn remove(&self, page_ref: &PageReference, reason: EvictionReason) -> bool {
        let shard = self.shard(page_ref);
        let page = {
            let mut map = shard.map.lock();
            match map.remove(page_ref) {
                Some(page) => {
                    shard.sub_used(page.used_bytes(), &self.used_bytes_gauge);
                    page
                }
                None => return false,
            }
        };
        self.count_eviction(reason);
        // Off the map: no new guard can appear. close() either resets now or
        // defers to the last live guard.
        page.close();
        true
    }

    /// Sweeper entry point: remove `page_ref` only if it still maps to
    /// `expected` and is unguarded; reset it on success.
    pub(crate) fn try_evict(
        &self,
        page_ref: &PageReference,
        expected: &Arc<KeyValueLeafPage>,
        reason: EvictionReason,
    ) -> bool {
        let shard = self.shard(page_ref);
        let page = {
            let mut map = shard.map.lock();
            match map.get(page_ref) {
                Some(current)
                    if Arc::ptr_eq(current, expected) && current.guard_count() == 0 =>
                {
                    let page = map.remove(page_ref).expect("checked above");
                    shard.sub_used(page.used_bytes(), &self.used_bytes_gauge);
                    page
                }
                _ => return false,
            }
        };
        self.count_eviction(reason);
        // Unmapped with guard_count == 0, and guards are only ever acquired
        // under the shard lock we just held: reset cannot race a reader.
        page.reset();
        true
    }

    pub fn contains(&self, page_ref: &PageReference) -> bool {
        self.shard(page_ref).map.lock().contains_key(page_ref)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.used_bytes.load(Ordering::Acquire))
            .sum()
    }

    /// Snapshot of one shard's entries for a sweeper round. The snapshot is
    /// advisory; every eviction decision is re-validated under the lock.
    pub(crate) fn sweep_snapshot(
        &self,
        shard_index: usize,
    ) -> Vec<(PageReference, Arc<KeyValueLeafPage>)> {
        let map = self.shards[shard_index].map.lock();
        map.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
    }

    pub(crate) fn shard_over_weight(&self, shard_index: usize) -> bool {
        self.shard_weight_limit > 0
            && self.shards[shard_index].used_bytes.load(Ordering::Acquire) > self.shard_weight_limit
    }

    /// Close every mapping. Used on teardown and by tests.
    pub fn drain(&self) {
        for shard in self.shards.iter() {
            let entries: Vec<_> = {
                let mut map = shard.map.lock();
                let drained: Vec<_> = map.drain().collect();
                drained
            };
            for (_, page) in entries {
                shard.sub_used(page.used_bytes(), &self.used_bytes_gauge);
                self.count_eviction(EvictionReason::Explicit);
                page.close();
            }
        }
    }

    fn count_eviction(&self, reason: EvictionReason) {
        let reason: &'static str = reason.into();
        PAGE_CACHE_EVICTIONS
            .with_label_values(&[self.name, reason])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    use utils::id::{DatabaseId, ResourceId};
    use utils::revision::Revision;

    use crate::config::PoolConf;
    use crate::segment_alloc::{SegmentAllocator, SizeClass};

    fn test_ref(offset: i64) -> PageReference {
        PageReference {
            database_id: DatabaseId(1),
            resource_id: ResourceId(1),
            log_key: 0,
            page_offset: offset,
        }
    }

    fn test_page(
        alloc: &Arc<SegmentAllocator>,
        page_key: i64,
        revision: Revision,
    ) -> Arc<KeyValueLeafPage> {
        let page =
            KeyValueLeafPage::new(page_key, revision, SizeClass::K4, false, Arc::clone(alloc))
                .unwrap();
        page.put_record(0, b"payload", None).unwrap();
        page
    }

    #[test]
    fn miss_loads_and_hit_guards() {
        let alloc = SegmentAllocator::new(&PoolConf::default());
        let cache = PageCache::new("test_basic", 8, u64::MAX);
        let r = test_ref(1);

        let guard = cache
            .get_and_guard::<Infallible>(&r, || Ok(test_page(&alloc, 1, Revision(1))))
            .unwrap();
        assert_eq!(guard.guard_count(), 1);
        let second = cache
            .get_and_guard::<Infallible>(&r, || panic!("must not load on a hit"))
            .unwrap();
        assert_eq!(second.guard_count(), 2);
        assert!(Arc::ptr_eq(guard.page_arc(), second.page_arc()));
        drop(second);
        drop(guard);
        cache.drain();
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn concurrent_cold_load_single_mapping() {
        let alloc = SegmentAllocator::new(&PoolConf::default());
        let cache = Arc::new(PageCache::new("test_race", 8, u64::MAX));
        let r = test_ref(7);
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            let alloc = Arc::clone(&alloc);
            let loads = Arc::clone(&loads);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let guard = cache
                    .get_and_guard::<Infallible>(&r, || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(test_page(&alloc, 7, Revision(1)))
                    })
                    .unwrap();
                // Hold both guards long enough for the race to matter.
                std::thread::sleep(std::time::Duration::from_millis(10));
                assert!(guard.guard_count() >= 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
        // Both loaders may have run, but a duplicate page must have been
        // retired: exactly one mapped page remains.
        cache.drain();
        assert_eq!(alloc.slices_in_use(), 0);
        assert!(loads.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn remove_of_guarded_page_defers_reset() {
        let alloc = SegmentAllocator::new(&PoolConf::default());
        let cache = PageCache::new("test_orphan", 8, u64::MAX);
        let r = test_ref(3);
        let guard = cache
            .get_and_guard::<Infallible>(&r, || Ok(test_page(&alloc, 3, Revision(1))))
            .unwrap();

        assert!(cache.remove(&r, EvictionReason::Explicit));
        assert!(!cache.contains(&r));
        // Guard still protects the orphan.
        assert!(!guard.is_closed());
        assert_eq!(guard.get_record(0).unwrap().unwrap().data, b"payload");
        drop(guard);
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn try_evict_respects_guards_and_identity() {
        let alloc = SegmentAllocator::new(&PoolConf::default());
        let cache = PageCache::new("test_evict", 8, u64::MAX);
        let r = test_ref(4);
        let guard = cache
            .get_and_guard::<Infallible>(&r, || Ok(test_page(&alloc, 4, Revision(1))))
            .unwrap();
        let page = Arc::clone(guard.page_arc());

        assert!(!cache.try_evict(&r, &page, EvictionReason::Sweeper));
        drop(guard);
        assert!(cache.try_evict(&r, &page, EvictionReason::Sweeper));
        assert!(!cache.contains(&r));
        assert!(page.is_closed());
        assert_eq!(alloc.slices_in_use(), 0);
        // Stale eviction attempt after removal is a no-op.
        assert!(!cache.try_evict(&r, &page, EvictionReason::Sweeper));
    }

    #[test]
    fn weight_counts_guarded_pages() {
        let alloc = SegmentAllocator::new(&PoolConf::default());
        let cache = PageCache::new("test_weight", 8, u64::MAX);
        let r = test_ref(5);
        let guard = cache
            .get_and_guard::<Infallible>(&r, || Ok(test_page(&alloc, 5, Revision(1))))
            .unwrap();
        assert!(cache.used_bytes() > 0, "guarded page must have weight");
        drop(guard);
        cache.drain();
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn loader_error_leaves_cache_unchanged() {
        let cache = PageCache::new("test_err", 8, u64::MAX);
        let r = test_ref(6);
        let res = cache.get_and_guard(&r, || Err("boom"));
        assert_eq!(res.err(), Some("boom"));
        assert!(!cache.contains(&r));
        assert_eq!(cache.used_bytes(), 0);
    }
}
