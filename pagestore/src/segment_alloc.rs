//!
//! Native memory for leaf pages.
//!
//! All record payloads live in anonymous private mappings managed here, not
//! on the Rust heap. The allocator serves seven fixed size classes; each
//! class owns a list of *regions*, equal mmap'd blocks sliced into segments
//! of the class size. Slice ownership inside a region is tracked by an
//! atomic bitmap, so allocate/release are lock-free in the common case.
//!
//! # Physical vs. virtual memory
//!
//! Regions are never unmapped before the allocator shuts down. A `Segment`
//! handle that survived its page (stale cursor, late guard drop) therefore
//! points at mapped memory forever and can never become a wild pointer.
//! Bounding memory is done on the *physical* axis instead: when the resident
//! byte counter crosses the configured budget, fully-unused regions are
//! released with `MADV_DONTNEED`, which drops their backing pages but keeps
//! the virtual range valid. The next grant from such a region faults zero
//! pages back in and re-counts it against the budget.
//!
//! Physical release is strictly deferred to budget pressure. Releasing on the
//! last segment release would race a concurrent allocate that popped the
//! sibling slice a moment earlier and is about to write through it.
//!

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw, UncheckedAdvice};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::PoolConf;
use crate::metrics::{
    observe_physical_bytes, BUDGET_DENIED_ALLOCATIONS, REGIONS_RECLAIMED, SEGMENTS_IN_USE,
};

/// Smallest and largest region sizes; between them, regions target
/// [`TARGET_SLICES_PER_REGION`] slices.
pub const MIN_REGION_BYTES: usize = 1 << 20;
pub const MAX_REGION_BYTES: usize = 8 << 20;
const TARGET_SLICES_PER_REGION: usize = 32;

/// The seven segment sizes this allocator serves. Not configurable: the
/// on-disk fragment sizes and the cache weigher both assume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    K4,
    K8,
    K16,
    K32,
    K64,
    K128,
    K256,
}

impl SizeClass {
    pub const ALL: [SizeClass; 7] = [
        SizeClass::K4,
        SizeClass::K8,
        SizeClass::K16,
        SizeClass::K32,
        SizeClass::K64,
        SizeClass::K128,
        SizeClass::K256,
    ];

    pub fn bytes(self) -> usize {
        match self {
            SizeClass::K4 => 4 * 1024,
            SizeClass::K8 => 8 * 1024,
            SizeClass::K16 => 16 * 1024,
            SizeClass::K32 => 32 * 1024,
            SizeClass::K64 => 64 * 1024,
            SizeClass::K128 => 128 * 1024,
            SizeClass::K256 => 256 * 1024,
        }
    }

    /// Smallest class that fits `payload` bytes, or `None` if the payload
    /// exceeds the largest class.
    pub fn fitting(payload: usize) -> Option<SizeClass> {
        SizeClass::ALL.into_iter().find(|c| c.bytes() >= payload)
    }

    pub fn next_larger(self) -> Option<SizeClass> {
        let idx = self.index();
        SizeClass::ALL.get(idx + 1).copied()
    }

    pub fn smallest() -> SizeClass {
        SizeClass::K4
    }

    pub fn largest() -> SizeClass {
        SizeClass::K256
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::K4 => "4k",
            SizeClass::K8 => "8k",
            SizeClass::K16 => "16k",
            SizeClass::K32 => "32k",
            SizeClass::K64 => "64k",
            SizeClass::K128 => "128k",
            SizeClass::K256 => "256k",
        }
    }

    fn index(self) -> usize {
        match self {
            SizeClass::K4 => 0,
            SizeClass::K8 => 1,
            SizeClass::K16 => 2,
            SizeClass::K32 => 3,
            SizeClass::K64 => 4,
            SizeClass::K128 => 5,
            SizeClass::K256 => 6,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error(
        "physical budget exceeded: need {requested} more bytes, \
         {physical} of {budget} resident and no unused region to reclaim"
    )]
    BudgetExceeded {
        requested: usize,
        physical: u64,
        budget: u64,
    },

    #[error("mmap failed")]
    Map(#[from] std::io::Error),
}

/// One slice of a region: the memory a leaf page stores payload bytes in.
///
/// A segment is exclusively owned by at most one page at a time. It has no
/// destructor; whoever owns it must hand it back via
/// [`SegmentAllocator::release`] (pages do this in `reset()`).
pub struct Segment {
    base: NonNull<u8>,
    class: SizeClass,
    region_index: u32,
    slice_index: u32,
}

// SAFETY: a segment is a typed pointer into a region that stays mapped for
// the allocator's whole lifetime. Exclusive write access is established by
// the owning page's guard protocol, not by &mut, so handing the handle across
// threads is sound.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn len(&self) -> usize {
        self.class.bytes()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Read `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Caller must hold the owning page's guard (or be its sole writer) so
    /// that no reset can retire the segment while the slice is alive, and
    /// must have bounds-checked `offset + len <= self.len()`.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len());
        std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
    }

    /// Copy `data` into the segment at `offset`.
    ///
    /// # Safety
    ///
    /// Caller must be the segment's sole writer (page fill before publication
    /// or intent-log single-writer) and must have bounds-checked
    /// `offset + data.len() <= self.len()`.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len());
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("class", &self.class)
            .field("region", &self.region_index)
            .field("slice", &self.slice_index)
            .finish()
    }
}

/// An mmap'd block sliced into `total_slices` segments of one class.
struct Region {
    map: MmapRaw,
    class: SizeClass,
    total_slices: u32,
    /// Bit set = slice handed out. Trailing bits beyond `total_slices` are
    /// pre-set so the scan never yields them.
    bitmap: Box<[AtomicU64]>,
    unused_slices: AtomicI32,
    /// False after `MADV_DONTNEED`; physical bytes of a non-resident region
    /// are not counted against the budget.
    resident: AtomicBool,
}

impl Region {
    fn new(class: SizeClass, bytes: usize) -> Result<Region, AllocError> {
        let total_slices = (bytes / class.bytes()) as u32;
        let map: MmapRaw = MmapOptions::new().len(bytes).map_anon()?.into();

        let words = (total_slices as usize + 63) / 64;
        let bitmap: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let tail = total_slices as usize % 64;
        if tail != 0 {
            bitmap[words - 1].store(!0u64 << tail, Ordering::Relaxed);
        }

        Ok(Region {
            map,
            class,
            total_slices,
            bitmap,
            unused_slices: AtomicI32::new(total_slices as i32),
            resident: AtomicBool::new(true),
        })
    }

    fn bytes(&self) -> usize {
        self.total_slices as usize * self.class.bytes()
    }

    /// Claim one free slice, lock-free. Returns its index.
    fn try_reserve(&self) -> Option<u32> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            loop {
                let bits = word.load(Ordering::Acquire);
                let free = (!bits).trailing_zeros();
                if free == 64 {
                    break; // word full, next word
                }
                let mask = 1u64 << free;
                if word
                    .compare_exchange(bits, bits | mask, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.unused_slices.fetch_sub(1, Ordering::AcqRel);
                    return Some(word_idx as u32 * 64 + free);
                }
            }
        }
        None
    }

    /// Return a slice. Reports (and otherwise ignores) a double release.
    fn release(&self, slice: u32) {
        let word = &self.bitmap[slice as usize / 64];
        let mask = 1u64 << (slice % 64);
        let prev = word.fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            warn!(
                class = %self.class,
                slice,
                "release of a segment that was not allocated; ignoring"
            );
            return;
        }
        self.unused_slices.fetch_add(1, Ordering::AcqRel);
    }

    fn slice_ptr(&self, slice: u32) -> NonNull<u8> {
        debug_assert!(slice < self.total_slices);
        // SAFETY: slice < total_slices keeps the offset inside the mapping.
        let ptr = unsafe {
            self.map
                .as_mut_ptr()
                .add(slice as usize * self.class.bytes())
        };
        NonNull::new(ptr).expect("mmap returned null")
    }
}

struct ClassPool {
    class: SizeClass,
    region_bytes: usize,
    regions: RwLock<Vec<Arc<Region>>>,
}

///
/// The process-wide slab allocator behind every leaf page.
///
pub struct SegmentAllocator {
    pools: [ClassPool; 7],
    budget_bytes: u64,
    physical_bytes: AtomicU64,
    /// Signalled whenever an allocation had to fight the budget; sweepers
    /// listen on this to run a pressure round out of schedule.
    pressure: Notify,
}

impl SegmentAllocator {
    pub fn new(conf: &PoolConf) -> Arc<SegmentAllocator> {
        let budget = conf.physical_budget_bytes;
        let pools = SizeClass::ALL.map(|class| ClassPool {
            class,
            region_bytes: region_bytes_for(class, budget),
            regions: RwLock::new(Vec::new()),
        });
        Arc::new(SegmentAllocator {
            pools,
            budget_bytes: budget,
            physical_bytes: AtomicU64::new(0),
            pressure: Notify::new(),
        })
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Resident bytes currently counted against the budget.
    pub fn physical_bytes(&self) -> u64 {
        self.physical_bytes.load(Ordering::Acquire)
    }

    /// Sweepers park on this to react to budget pressure between rounds.
    pub fn pressure(&self) -> &Notify {
        &self.pressure
    }

    /// True when there is no headroom left to map one more region of the
    /// largest class: the sweepers' high-water signal for shedding
    /// reconstructible pages the revision watermark still covers.
    pub fn under_pressure(&self) -> bool {
        let largest_region = self
            .pools
            .iter()
            .map(|p| p.region_bytes)
            .max()
            .unwrap_or(0) as u64;
        self.physical_bytes.load(Ordering::Acquire) + largest_region > self.budget_bytes
    }

    ///
    /// Hand out one segment of `class`.
    ///
    /// Serving from an existing free slice never grows physical memory and
    /// cannot fail on budget grounds; only re-residenting a reclaimed region
    /// or mapping a fresh one is gated. Reclamation of fully-unused regions
    /// runs first whenever the grant would not fit under the budget, so a
    /// pool idling at its cap sheds cold regions before growing hot classes.
    ///
    pub fn allocate(&self, class: SizeClass) -> Result<Segment, AllocError> {
        self.reclaim_for(class.bytes());

        let pool = &self.pools[class.index()];
        loop {
            {
                let regions = pool.regions.read();
                // Resident regions first: a grant from them is free.
                for (idx, region) in regions.iter().enumerate() {
                    if !region.resident.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Some(slice) = region.try_reserve() {
                        return Ok(self.finish_grant(class, idx as u32, region, slice));
                    }
                }
                // Second pass: any region with a free slice, re-residenting
                // reclaimed ones. make_resident is a no-op on a region that
                // became resident since the first pass.
                for (idx, region) in regions.iter().enumerate() {
                    if let Some(slice) = region.try_reserve() {
                        if let Err(e) = self.make_resident(region) {
                            region.release(slice);
                            return Err(e);
                        }
                        return Ok(self.finish_grant(class, idx as u32, region, slice));
                    }
                }
            }
            self.map_region(pool)?;
        }
    }

    /// Return a segment to its pool. The memory is not zeroed and not
    /// physically released here; see the module comment.
    pub fn release(&self, segment: Segment) {
        let pool = &self.pools[segment.class.index()];
        let regions = pool.regions.read();
        let Some(region) = regions.get(segment.region_index as usize) else {
            warn!(
                class = %segment.class,
                region = segment.region_index,
                "release of a segment from an unknown region; ignoring"
            );
            return;
        };
        region.release(segment.slice_index);
        SEGMENTS_IN_USE
            .with_label_values(&[segment.class.as_str()])
            .dec();
    }

    /// Best-effort `MADV_DONTNEED` pass: releases fully-unused resident
    /// regions until `needed` more bytes fit under the budget. Returns how
    /// many regions were released.
    pub fn reclaim_for(&self, needed: usize) -> usize {
        let mut reclaimed = 0;
        while self.physical_bytes.load(Ordering::Acquire) + needed as u64 > self.budget_bytes {
            if !self.reclaim_one_region() {
                break;
            }
            reclaimed += 1;
        }
        if self.physical_bytes.load(Ordering::Acquire) + needed as u64 > self.budget_bytes {
            self.pressure.notify_waiters();
        }
        reclaimed
    }

    fn reclaim_one_region(&self) -> bool {
        for pool in &self.pools {
            let regions = pool.regions.read();
            for region in regions.iter() {
                if region.unused_slices.load(Ordering::Acquire) != region.total_slices as i32 {
                    continue;
                }
                if region
                    .resident
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                // Re-check after winning the flag: a reservation may have
                // raced us. If so, put the flag back and move on.
                if region.unused_slices.load(Ordering::Acquire) != region.total_slices as i32 {
                    region.resident.store(true, Ordering::Release);
                    continue;
                }
                // SAFETY: DONTNEED on an anonymous mapping drops its backing
                // pages; the range stays mapped and reads as zero afterwards.
                // Every slice is unused, so no live page data is lost. A
                // reservation can still race the advice; its slice's bytes
                // are undefined until written anyway, and the region
                // re-residents on its next grant.
                if let Err(e) = unsafe { region.map.unchecked_advise(UncheckedAdvice::DontNeed) } {
                    warn!("madvise(DONTNEED) failed: {e}");
                    region.resident.store(true, Ordering::Release);
                    continue;
                }
                let bytes = region.bytes() as u64;
                let now = self.physical_bytes.fetch_sub(bytes, Ordering::AcqRel) - bytes;
                observe_physical_bytes(now);
                REGIONS_RECLAIMED.inc();
                debug!(class = %pool.class, bytes, "reclaimed region");
                return true;
            }
        }
        false
    }

    /// Count a reclaimed region as resident again, reclaiming others to make
    /// room if needed.
    fn make_resident(&self, region: &Region) -> Result<(), AllocError> {
        // Winning the flag grants exclusive rights to re-count the region,
        // mirroring reclaim_one_region. Racing callers find it resident and
        // counted exactly once; their slice reservations stand either way.
        if region
            .resident
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let bytes = region.bytes() as u64;
        loop {
            let phys = self.physical_bytes.load(Ordering::Acquire);
            if phys + bytes > self.budget_bytes {
                if self.reclaim_one_region() {
                    continue;
                }
                region.resident.store(false, Ordering::Release);
                self.pressure.notify_waiters();
                BUDGET_DENIED_ALLOCATIONS.inc();
                return Err(AllocError::BudgetExceeded {
                    requested: bytes as usize,
                    physical: phys,
                    budget: self.budget_bytes,
                });
            }
            if self
                .physical_bytes
                .compare_exchange(phys, phys + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                observe_physical_bytes(phys + bytes);
                return Ok(());
            }
        }
    }

    fn map_region(&self, pool: &ClassPool) -> Result<(), AllocError> {
        let bytes = pool.region_bytes as u64;
        loop {
            let phys = self.physical_bytes.load(Ordering::Acquire);
            if phys + bytes > self.budget_bytes {
                if self.reclaim_one_region() {
                    continue;
                }
                self.pressure.notify_waiters();
                BUDGET_DENIED_ALLOCATIONS.inc();
                return Err(AllocError::BudgetExceeded {
                    requested: bytes as usize,
                    physical: phys,
                    budget: self.budget_bytes,
                });
            }
            if self
                .physical_bytes
                .compare_exchange(phys, phys + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let region = match Region::new(pool.class, pool.region_bytes) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                self.physical_bytes
                    .fetch_sub(bytes, Ordering::AcqRel);
                return Err(e);
            }
        };
        observe_physical_bytes(self.physical_bytes.load(Ordering::Acquire));
        let mut regions = pool.regions.write();
        regions.push(region);
        debug!(class = %pool.class, bytes, total_regions = regions.len(), "mapped region");
        Ok(())
    }

    fn finish_grant(
        &self,
        class: SizeClass,
        region_index: u32,
        region: &Region,
        slice: u32,
    ) -> Segment {
        SEGMENTS_IN_USE.with_label_values(&[class.as_str()]).inc();
        Segment {
            base: region.slice_ptr(slice),
            class,
            region_index,
            slice_index: slice,
        }
    }

    /// Sum of slices currently handed out, for accounting tests.
    pub fn slices_in_use(&self) -> u64 {
        let mut used = 0;
        for pool in &self.pools {
            for region in pool.regions.read().iter() {
                used += (region.total_slices as i64
                    - region.unused_slices.load(Ordering::Acquire) as i64)
                    as u64;
            }
        }
        used
    }
}

/// Region size for one class: ~32 slices, clamped to [1 MiB, 8 MiB], and
/// additionally capped to half the budget so at least two regions fit.
fn region_bytes_for(class: SizeClass, budget: u64) -> usize {
    let target = (class.bytes() * TARGET_SLICES_PER_REGION).clamp(MIN_REGION_BYTES, MAX_REGION_BYTES);
    let half_budget = (budget / 2) as usize / class.bytes() * class.bytes();
    target.min(half_budget.max(class.bytes()))
}
