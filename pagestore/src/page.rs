//!
//! The key-value leaf page and its guard protocol.
//!
//! A leaf page is a fixed-capacity container of up to [`SLOTS_PER_PAGE`]
//! records, serialized into one native memory segment (`slot_memory`) with an
//! optional second segment for dewey-id ordering keys. Pages in the cache are
//! immutable; pages owned by a transaction intent log have exactly one
//! writer. Either way there is never a writer racing a reader on page bytes,
//! which is what lets readers run without latches.
//!
//! Eviction safety does not use per-transaction pin maps. Every reader holds
//! a [`PageGuard`], a scoped handle backed by a single atomic count on the
//! page; while `guard_count > 0` nothing may call [`KeyValueLeafPage::reset`].
//! Guard acquisition happens under the owning cache shard's lock, and the
//! sweeper re-checks the count under that same lock, so the count cannot go
//! 0 -> 1 behind an eviction decision.
//!
//! `reset()` bumps the page's `version`. An observer that stashed a version
//! and finds a different one later is looking at a reused frame and must
//! refetch; the typed guard API makes that state unreachable, the version is
//! the backstop for anyone holding raw state across a guard drop.
//!

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, warn};
use utils::id::{DatabaseId, ResourceId};
use utils::revision::Revision;

use crate::metrics::{GUARD_HOLD_SECONDS, LEAKED_PAGE_RESETS};
use crate::segment_alloc::{AllocError, Segment, SegmentAllocator, SizeClass};
use crate::SLOTS_PER_PAGE;

/// Bytes of the per-record length prefix inside `slot_memory`.
const RECORD_HEADER_BYTES: usize = 4;

/// Cache identity of a page: the composite key. Disk stores only
/// `page_offset`; the ids and log key are ambient context re-attached by the
/// reader during deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageReference {
    pub database_id: DatabaseId,
    pub resource_id: ResourceId,
    pub log_key: i32,
    pub page_offset: i64,
}

impl fmt::Display for PageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.database_id, self.resource_id, self.log_key, self.page_offset
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("frame reused: version {actual}, observer expected {expected}")]
    FrameReused { expected: i32, actual: i32 },

    #[error("corrupt page {page_key}: slot {slot} {detail}")]
    Corrupt {
        page_key: i64,
        slot: usize,
        detail: &'static str,
    },

    #[error("slot {slot} out of range")]
    SlotOutOfRange { slot: usize },

    #[error("record of {len} bytes exceeds the largest segment class")]
    RecordTooLarge { len: usize },

    #[error("page is closed")]
    Closed,

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// One record, borrowed out of the page's segments. Valid for as long as the
/// borrow of the page, which the guard (or exclusive ownership) keeps safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub data: &'a [u8],
    pub dewey_id: Option<&'a [u8]>,
}

/// Snapshot of a page's reuse counter, for revalidating raw state held
/// without a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionToken(i32);

struct PageMemory {
    slot: Option<Segment>,
    dewey: Option<Segment>,
}

///
/// A fixed-capacity record page over one or two native memory segments.
///
pub struct KeyValueLeafPage {
    page_key: i64,
    revision: Revision,

    /// Byte offset of each record inside `slot_memory`; -1 = empty slot.
    slot_offsets: [AtomicI32; SLOTS_PER_PAGE],
    dewey_offsets: [AtomicI32; SLOTS_PER_PAGE],
    slot_write_pos: AtomicI32,
    dewey_write_pos: AtomicI32,

    guard_count: AtomicI32,
    /// Monotonic; bumped by every reset so observers detect frame reuse.
    version: AtomicI32,
    /// Second-chance bit: set on access, cleared by the sweeper.
    hot: AtomicBool,
    closed: AtomicBool,
    /// Set when the page was unmapped while guarded; the final guard drop
    /// performs the deferred reset.
    needs_reset: AtomicBool,
    poisoned: AtomicBool,

    memory: UnsafeCell<PageMemory>,
    allocator: Arc<SegmentAllocator>,
}

// SAFETY: `memory` is only mutated by reset() (exactly once, gated by the
// `closed` swap, with no live guards by protocol) and by grow_slot_memory()
// (single-writer pages only). All other fields are atomics.
unsafe impl Send for KeyValueLeafPage {}
unsafe impl Sync for KeyValueLeafPage {}

impl KeyValueLeafPage {
    pub fn new(
        page_key: i64,
        revision: Revision,
        class: SizeClass,
        dewey_ids: bool,
        allocator: Arc<SegmentAllocator>,
    ) -> Result<Arc<KeyValueLeafPage>, PageError> {
        let slot = allocator.allocate(class)?;
        let dewey = if dewey_ids {
            Some(allocator.allocate(SizeClass::smallest())?)
        } else {
            None
        };
        Ok(Arc::new(KeyValueLeafPage {
            page_key,
            revision,
            slot_offsets: std::array::from_fn(|_| AtomicI32::new(-1)),
            dewey_offsets: std::array::from_fn(|_| AtomicI32::new(-1)),
            slot_write_pos: AtomicI32::new(0),
            dewey_write_pos: AtomicI32::new(0),
            guard_count: AtomicI32::new(0),
            version: AtomicI32::new(0),
            hot: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            needs_reset: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            memory: UnsafeCell::new(PageMemory { slot: Some(slot), dewey }),
            allocator,
        }))
    }

    pub fn page_key(&self) -> i64 {
        self.page_key
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn guard_count(&self) -> i32 {
        self.guard_count.load(Ordering::Acquire)
    }

    pub fn version_token(&self) -> VersionToken {
        VersionToken(self.version.load(Ordering::Acquire))
    }

    /// Revalidate raw state captured earlier. `Err(FrameReused)` means the
    /// page was reset (and possibly refilled) since the token was taken; the
    /// caller must refetch through the cache.
    pub fn check_version(&self, token: VersionToken) -> Result<(), PageError> {
        let actual = self.version.load(Ordering::Acquire);
        if actual != token.0 {
            return Err(PageError::FrameReused {
                expected: token.0,
                actual,
            });
        }
        Ok(())
    }

    pub fn mark_hot(&self) {
        self.hot.store(true, Ordering::Relaxed);
    }

    /// Clears the second-chance bit, returning its prior value.
    pub fn take_hot(&self) -> bool {
        self.hot.swap(false, Ordering::Relaxed)
    }

    /// Payload bytes written into the page's segments. This is the page's
    /// cache weight; guards do not subtract from it.
    pub fn used_bytes(&self) -> u64 {
        (self.slot_write_pos.load(Ordering::Relaxed)
            + self.dewey_write_pos.load(Ordering::Relaxed)) as u64
    }

    /// Slots that currently hold a record.
    pub fn occupied_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..SLOTS_PER_PAGE).filter(|&i| self.slot_offsets[i].load(Ordering::Acquire) >= 0)
    }

    pub fn acquire_guard_count(&self) -> i32 {
        self.guard_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn release_guard_count(&self) {
        let prev = self.guard_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "guard count went negative");
        if prev == 1 && self.needs_reset.swap(false, Ordering::AcqRel) {
            // Orphan protocol: the page was unmapped while we held the last
            // guard; reclamation was deferred to us.
            self.reset();
        }
    }

    ///
    /// Store a record. Single-writer: only legal on a page that has not been
    /// published to the cache yet, or that the transaction intent log owns.
    ///
    /// The payload is length-prefixed in `slot_memory`; no bytes are zeroed
    /// anywhere, validity is `slot_offsets[slot] >= 0`. When the segment is
    /// full the page moves to the next size class, which is why cached
    /// (shared) pages must never take this path.
    ///
    pub fn put_record(
        &self,
        slot: usize,
        data: &[u8],
        dewey_id: Option<&[u8]>,
    ) -> Result<(), PageError> {
        if slot >= SLOTS_PER_PAGE {
            return Err(PageError::SlotOutOfRange { slot });
        }
        if self.is_closed() {
            return Err(PageError::Closed);
        }

        let offset = self.append(data, false)?;
        self.slot_offsets[slot].store(offset, Ordering::Release);

        if let Some(key) = dewey_id {
            let offset = self.append(key, true)?;
            self.dewey_offsets[slot].store(offset, Ordering::Release);
        } else {
            self.dewey_offsets[slot].store(-1, Ordering::Release);
        }
        Ok(())
    }

    /// Read the record in `slot`, or `None` for an empty slot.
    ///
    /// The caller must hold a guard on this page or own it exclusively; the
    /// public API enforces that by only exposing pages through
    /// [`PageGuard`]/page views.
    pub fn get_record(&self, slot: usize) -> Result<Option<Record<'_>>, PageError> {
        if slot >= SLOTS_PER_PAGE {
            return Err(PageError::SlotOutOfRange { slot });
        }
        let offset = self.slot_offsets[slot].load(Ordering::Acquire);
        if offset < 0 {
            return Ok(None);
        }
        let data = self.read_at(offset as usize, slot, false)?;
        let dewey_offset = self.dewey_offsets[slot].load(Ordering::Acquire);
        let dewey_id = if dewey_offset >= 0 {
            Some(self.read_at(dewey_offset as usize, slot, true)?)
        } else {
            None
        };
        Ok(Some(Record { data, dewey_id }))
    }

    /// Empty all slots without giving up the segments. Used by the intent
    /// log when a modification page is rebuilt in place.
    pub fn clear(&self) {
        for offsets in [&self.slot_offsets, &self.dewey_offsets] {
            for o in offsets.iter() {
                o.store(-1, Ordering::Release);
            }
        }
        self.slot_write_pos.store(0, Ordering::Release);
        self.dewey_write_pos.store(0, Ordering::Release);
    }

    ///
    /// Retire the page: bump `version`, tombstone every slot, return both
    /// segments to the allocator. Idempotent; the first caller wins.
    ///
    /// Caller contract: `guard_count == 0`, or the caller is the page's
    /// exclusive owner. The sweeper and the cache removal hook establish the
    /// former under the shard lock; the intent log establishes the latter by
    /// construction.
    ///
    pub fn reset(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        for offsets in [&self.slot_offsets, &self.dewey_offsets] {
            for o in offsets.iter() {
                o.store(-1, Ordering::Release);
            }
        }
        self.guard_count.store(0, Ordering::Release);

        // SAFETY: the `closed` swap above makes this the only thread ever to
        // reach here, and the caller contract rules out live readers.
        let memory = unsafe { &mut *self.memory.get() };
        if let Some(seg) = memory.slot.take() {
            self.allocator.release(seg);
        }
        if let Some(seg) = memory.dewey.take() {
            self.allocator.release(seg);
        }
    }

    ///
    /// Synchronized close: reset now if unguarded, otherwise leave an orphan
    /// whose final guard drop resets it. The sweeper never reaches this on a
    /// guarded page; this is the last line of defense for explicit removal.
    ///
    pub fn close(&self) {
        if self.guard_count.load(Ordering::Acquire) > 0 {
            warn!(
                page_key = self.page_key,
                revision = %self.revision,
                "close of a guarded page deferred to last guard drop"
            );
            self.needs_reset.store(true, Ordering::Release);
            // Re-check: the last guard may have dropped between the load and
            // the store, in which case nobody is left to see the flag.
            if self.guard_count.load(Ordering::Acquire) == 0
                && self.needs_reset.swap(false, Ordering::AcqRel)
            {
                self.reset();
            }
            return;
        }
        self.reset();
    }

    fn poison(&self, slot: usize, detail: &'static str) -> PageError {
        self.poisoned.store(true, Ordering::Release);
        error!(
            page_key = self.page_key,
            revision = %self.revision,
            slot,
            detail,
            "poisoning corrupt page"
        );
        PageError::Corrupt {
            page_key: self.page_key,
            slot,
            detail,
        }
    }

    fn segments(&self) -> &PageMemory {
        // SAFETY: see the Sync impl; callers hold a guard or own the page.
        unsafe { &*self.memory.get() }
    }

    fn read_at(&self, offset: usize, slot: usize, dewey: bool) -> Result<&[u8], PageError> {
        let memory = self.segments();
        let segment = if dewey { &memory.dewey } else { &memory.slot };
        let Some(segment) = segment else {
            return Err(PageError::Closed);
        };
        // A bounds violation here means the offset table and the segment
        // disagree, i.e. someone read through a stale reference across a
        // reset. Poison and bail; the caller revalidates via the version.
        if offset + RECORD_HEADER_BYTES > segment.len() {
            return Err(self.poison(slot, "offset beyond segment"));
        }
        // SAFETY: bounds checked above; segment liveness per caller contract.
        let len =
            u32::from_le_bytes(unsafe { segment.slice(offset, 4) }.try_into().unwrap()) as usize;
        if offset + RECORD_HEADER_BYTES + len > segment.len() {
            return Err(self.poison(slot, "payload beyond segment"));
        }
        // SAFETY: as above.
        Ok(unsafe { segment.slice(offset + RECORD_HEADER_BYTES, len) })
    }

    fn append(&self, data: &[u8], dewey: bool) -> Result<i32, PageError> {
        let write_pos = if dewey {
            &self.dewey_write_pos
        } else {
            &self.slot_write_pos
        };
        let needed = RECORD_HEADER_BYTES + data.len();
        loop {
            let pos = write_pos.load(Ordering::Acquire) as usize;
            {
                let memory = self.segments();
                let segment = if dewey { &memory.dewey } else { &memory.slot };
                let segment = segment.as_ref().ok_or(PageError::Closed)?;
                if pos + needed <= segment.len() {
                    // SAFETY: single-writer contract of put_record; bounds
                    // checked against the segment length just above.
                    unsafe {
                        segment.write(pos, &(data.len() as u32).to_le_bytes());
                        segment.write(pos + RECORD_HEADER_BYTES, data);
                    }
                    write_pos.store((pos + needed) as i32, Ordering::Release);
                    return Ok(pos as i32);
                }
            }
            self.grow(dewey, pos + needed)?;
        }
    }

    /// Move to the next size class, carrying the used prefix over. Offsets
    /// stay valid because records never move relative to the segment base.
    fn grow(&self, dewey: bool, needed: usize) -> Result<(), PageError> {
        // SAFETY: single-writer contract; no reader can hold a slice into the
        // old segment because the page is unpublished or intent-log-owned.
        let memory = unsafe { &mut *self.memory.get() };
        let slot = if dewey {
            &mut memory.dewey
        } else {
            &mut memory.slot
        };
        let old = slot.as_ref().ok_or(PageError::Closed)?;
        let mut class = old.class();
        loop {
            class = class
                .next_larger()
                .ok_or(PageError::RecordTooLarge { len: needed })?;
            if class.bytes() >= needed {
                break;
            }
        }
        let new = self.allocator.allocate(class)?;
        let used = if dewey {
            self.dewey_write_pos.load(Ordering::Acquire)
        } else {
            self.slot_write_pos.load(Ordering::Acquire)
        } as usize;
        // SAFETY: both segments are exclusively ours; `used` is within both.
        unsafe {
            new.write(0, old.slice(0, used));
        }
        let old = slot.replace(new).expect("checked above");
        self.allocator.release(old);
        Ok(())
    }
}

impl Drop for KeyValueLeafPage {
    fn drop(&mut self) {
        let memory = self.memory.get_mut();
        if memory.slot.is_some() || memory.dewey.is_some() {
            // All reclamation is supposed to flow through reset() on the
            // eviction, orphan guard-drop or intent-log drain paths. Count
            // the stray so tests can insist on zero.
            LEAKED_PAGE_RESETS.inc();
            error!(
                page_key = self.page_key,
                revision = %self.revision,
                "page dropped with live segments; returning them from drop"
            );
            if let Some(seg) = memory.slot.take() {
                self.allocator.release(seg);
            }
            if let Some(seg) = memory.dewey.take() {
                self.allocator.release(seg);
            }
        }
    }
}

impl fmt::Debug for KeyValueLeafPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueLeafPage")
            .field("page_key", &self.page_key)
            .field("revision", &self.revision)
            .field("guards", &self.guard_count())
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

///
/// Scoped read lease on a page. Existence of the guard forbids reset of the
/// target; dropping it releases the lease and finishes a deferred reset if
/// the page was orphaned meanwhile.
///
pub struct PageGuard {
    page: Arc<KeyValueLeafPage>,
    acquired_at: Instant,
}

impl PageGuard {
    /// Wrap a page whose guard count was already incremented (under the
    /// cache shard lock).
    pub(crate) fn adopt(page: Arc<KeyValueLeafPage>) -> PageGuard {
        PageGuard {
            page,
            acquired_at: Instant::now(),
        }
    }

    pub fn page(&self) -> &KeyValueLeafPage {
        &self.page
    }

    pub(crate) fn page_arc(&self) -> &Arc<KeyValueLeafPage> {
        &self.page
    }
}

impl std::ops::Deref for PageGuard {
    type Target = KeyValueLeafPage;

    fn deref(&self) -> &KeyValueLeafPage {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        GUARD_HOLD_SECONDS.observe(self.acquired_at.elapsed().as_secs_f64());
        self.page.release_guard_count();
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageGuard({:?})", self.page)
    }
}
