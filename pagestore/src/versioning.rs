//!
//! Reconstruction of a revision's view of a page from persisted fragments.
//!
//! A page is persisted as a chain of *fragments*: full images and deltas,
//! one per revision that touched the page. Which fragments a read needs, and
//! what the next commit has to write so future reads stay cheap, depends on
//! the resource's versioning strategy. Four are supported:
//!
//! * **Full**: every fragment is a complete image; reads take the latest.
//! * **Incremental**: deltas accumulate since the last full image; reads
//!   replay the whole run.
//! * **Differential**: each delta is cumulative against the last full
//!   image; reads combine exactly two fragments.
//! * **Sliding snapshot**: reads combine the fragments of a fixed-width
//!   revision window; a record about to slide out of the window is carried
//!   forward by the next commit, so no full images are ever needed.
//!
//! Combining is slot-wise newest-wins: walk the chain from newest to oldest
//! and fill every slot from the first fragment that has it.
//!
//! The caller owns the fragment guards (a `Vec<PageGuard>` whose drop
//! releases every one of them, on success and error paths alike). What this
//! module must guarantee is the symmetric property for pages it creates:
//! any intermediate page that does not end up in the returned container is
//! closed before returning. The sliding-snapshot combiner is the only one
//! that materializes such a page, and the
//! `pagestore_sliding_snapshot_intermediate_pages` gauge audits it.
//!

use std::sync::Arc;

use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use utils::revision::Revision;

use crate::metrics::SLIDING_SNAPSHOT_INTERMEDIATE_PAGES;
use crate::page::{KeyValueLeafPage, PageError, PageGuard, PageReference};
use crate::segment_alloc::{SegmentAllocator, SizeClass};

/// How a fragment was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    FullDump,
    Delta,
}

/// Index entry of one persisted fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMeta {
    pub revision: Revision,
    pub kind: FragmentKind,
    pub offset: u64,
}

/// The in-flight pages of one modified record page: the fully materialized
/// base (`complete`) and the change capture the next fragment will be built
/// from (`modified`). Depending on the strategy they may be one and the same
/// page; [`PageContainer::same_instance`] is how the intent log avoids
/// closing it twice.
pub struct PageContainer {
    complete: Arc<KeyValueLeafPage>,
    modified: Arc<KeyValueLeafPage>,
    fragment_refs: Vec<PageReference>,
}

impl PageContainer {
    pub fn new(
        complete: Arc<KeyValueLeafPage>,
        modified: Arc<KeyValueLeafPage>,
        fragment_refs: Vec<PageReference>,
    ) -> PageContainer {
        PageContainer {
            complete,
            modified,
            fragment_refs,
        }
    }

    pub fn complete(&self) -> &Arc<KeyValueLeafPage> {
        &self.complete
    }

    pub fn modified(&self) -> &Arc<KeyValueLeafPage> {
        &self.modified
    }

    pub fn fragment_refs(&self) -> &[PageReference] {
        &self.fragment_refs
    }

    pub fn same_instance(&self) -> bool {
        Arc::ptr_eq(&self.complete, &self.modified)
    }

    /// Bytes the container still holds in pool memory.
    pub fn used_bytes(&self) -> u64 {
        if self.same_instance() {
            self.complete.used_bytes()
        } else {
            self.complete.used_bytes() + self.modified.used_bytes()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningType {
    Full,
    Incremental,
    Differential,
    SlidingSnapshot { window: u32 },
}

impl VersioningType {
    ///
    /// Pick the fragments a read of `target` needs, newest first.
    ///
    /// `available` is the page's fragment index, ascending by revision; only
    /// fragments at or below `target` are considered.
    ///
    pub fn fragment_selection(&self, available: &[FragmentMeta], target: Revision) -> Vec<FragmentMeta> {
        let upto: Vec<FragmentMeta> = available
            .iter()
            .copied()
            .filter(|m| m.revision <= target)
            .collect();
        let Some(latest) = upto.last().copied() else {
            return Vec::new();
        };
        match *self {
            VersioningType::Full => vec![latest],
            VersioningType::Incremental => {
                // Newest back to (and including) the run's full image.
                let mut out = Vec::new();
                for meta in upto.iter().rev() {
                    out.push(*meta);
                    if meta.kind == FragmentKind::FullDump {
                        break;
                    }
                }
                out
            }
            VersioningType::Differential => {
                let mut out = vec![latest];
                if latest.kind != FragmentKind::FullDump {
                    if let Some(full) = upto
                        .iter()
                        .rev()
                        .find(|m| m.kind == FragmentKind::FullDump)
                    {
                        out.push(*full);
                    }
                }
                out
            }
            VersioningType::SlidingSnapshot { window } => {
                let take = (window as usize).min(upto.len());
                upto[upto.len() - take..].iter().rev().copied().collect()
            }
        }
    }

    /// What kind of fragment the next commit of this page writes, given how
    /// many fragments its chain holds since (and including) the last full
    /// image.
    pub fn next_fragment_kind(&self, chain_len_since_full: usize, full_dump_period: u32) -> FragmentKind {
        match *self {
            VersioningType::Full => FragmentKind::FullDump,
            VersioningType::Incremental | VersioningType::Differential => {
                if chain_len_since_full == 0 || chain_len_since_full >= full_dump_period as usize {
                    FragmentKind::FullDump
                } else {
                    FragmentKind::Delta
                }
            }
            // The carry-forward in combine_for_modification keeps every
            // window self-sufficient; full images never become necessary.
            VersioningType::SlidingSnapshot { .. } => FragmentKind::Delta,
        }
    }

    ///
    /// Materialize the page view `fragments` (newest first, non-empty)
    /// describe. The result carries the newest fragment's revision.
    ///
    pub fn combine_for_read(
        &self,
        fragments: &[PageGuard],
        dewey_ids: bool,
        allocator: &Arc<SegmentAllocator>,
    ) -> Result<Arc<KeyValueLeafPage>, PageError> {
        assert!(!fragments.is_empty(), "combine of an empty fragment chain");
        let revision = fragments[0].revision();
        let effective = self.effective_fragments(fragments);
        combine_into(revision, effective, dewey_ids, allocator)
    }

    ///
    /// Like [`Self::combine_for_read`], but also prepares the page the next
    /// fragment will be captured on. `new_revision` is the revision the
    /// surrounding write transaction is going to commit.
    ///
    pub fn combine_for_modification(
        &self,
        fragments: &[PageGuard],
        fragment_refs: Vec<PageReference>,
        new_revision: Revision,
        dewey_ids: bool,
        allocator: &Arc<SegmentAllocator>,
    ) -> Result<PageContainer, PageError> {
        assert!(!fragments.is_empty(), "combine of an empty fragment chain");
        let effective = self.effective_fragments(fragments);
        let complete = combine_into(new_revision, effective, dewey_ids, allocator)?;
        // From here on, an error must close `complete` before surfacing.
        let complete = scopeguard::guard(complete, |page| page.reset());

        let modified = match *self {
            VersioningType::Full => Arc::clone(&*complete),
            VersioningType::Incremental => {
                empty_page(&complete, new_revision, dewey_ids, allocator)?
            }
            VersioningType::Differential => {
                // Seed with everything newer than the last full image, which
                // the chain keeps as its last element: the next delta stays
                // cumulative. A chain of one is the full image alone.
                let page = empty_page(&complete, new_revision, dewey_ids, allocator)?;
                let page = scopeguard::guard(page, |page| page.reset());
                for frag in &fragments[..fragments.len() - 1] {
                    copy_missing(&page, frag.page())?;
                }
                ScopeGuard::into_inner(page)
            }
            VersioningType::SlidingSnapshot { window } => self.sliding_carry_forward(
                fragments,
                window,
                new_revision,
                dewey_ids,
                allocator,
                &complete,
            )?,
        };

        Ok(PageContainer::new(
            ScopeGuard::into_inner(complete),
            modified,
            fragment_refs,
        ))
    }

    /// Records whose only carrier is the fragment about to leave the window
    /// must be re-recorded by this commit or they become unreachable.
    fn sliding_carry_forward(
        &self,
        fragments: &[PageGuard],
        window: u32,
        new_revision: Revision,
        dewey_ids: bool,
        allocator: &Arc<SegmentAllocator>,
        complete: &Arc<KeyValueLeafPage>,
    ) -> Result<Arc<KeyValueLeafPage>, PageError> {
        let modified = empty_page(complete, new_revision, dewey_ids, allocator)?;
        if fragments.len() < window as usize {
            // Window not saturated yet: nothing slides out.
            return Ok(modified);
        }
        let modified = scopeguard::guard(modified, |page| page.reset());
        let (oldest, newer) = fragments.split_last().expect("checked non-empty");

        if newer.is_empty() {
            // Window of one: everything in the lone fragment expires.
            copy_missing(&modified, oldest.page())?;
            return Ok(ScopeGuard::into_inner(modified));
        }

        // The view of the window without its oldest member. This page is
        // internal to the combiner and must not outlive this call. The gauge
        // goes up only once the page exists and its guard is what takes it
        // back down; a failed combine must leave the gauge untouched.
        let intermediate = combine_into(new_revision, newer.iter().collect(), dewey_ids, allocator)?;
        SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.inc();
        let intermediate = scopeguard::guard(intermediate, |page| {
            page.reset();
            SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.dec();
        });

        for slot in oldest.page().occupied_slots() {
            if intermediate.get_record(slot)?.is_none() {
                let record = oldest
                    .page()
                    .get_record(slot)?
                    .expect("slot listed as occupied");
                modified.put_record(slot, record.data, record.dewey_id)?;
            }
        }
        drop(intermediate);
        Ok(ScopeGuard::into_inner(modified))
    }

    /// For Full only the newest fragment matters; everything else combines
    /// the whole chain handed in.
    fn effective_fragments<'a>(&self, fragments: &'a [PageGuard]) -> Vec<&'a PageGuard> {
        match self {
            VersioningType::Full => vec![&fragments[0]],
            _ => fragments.iter().collect(),
        }
    }
}

fn empty_page(
    like: &Arc<KeyValueLeafPage>,
    revision: Revision,
    dewey_ids: bool,
    allocator: &Arc<SegmentAllocator>,
) -> Result<Arc<KeyValueLeafPage>, PageError> {
    KeyValueLeafPage::new(
        like.page_key(),
        revision,
        SizeClass::smallest(),
        dewey_ids,
        Arc::clone(allocator),
    )
}

/// Slot-wise newest-wins combine of `fragments` (newest first) into a fresh
/// page at `revision`. On error the partial page is closed here.
fn combine_into(
    revision: Revision,
    fragments: Vec<&PageGuard>,
    dewey_ids: bool,
    allocator: &Arc<SegmentAllocator>,
) -> Result<Arc<KeyValueLeafPage>, PageError> {
    let newest = fragments.first().expect("non-empty fragment chain");
    let total: u64 = fragments.iter().map(|f| f.used_bytes()).sum();
    let class = SizeClass::fitting(total as usize).unwrap_or(SizeClass::largest());
    let page = KeyValueLeafPage::new(
        newest.page_key(),
        revision,
        class,
        dewey_ids,
        Arc::clone(allocator),
    )?;
    let page = scopeguard::guard(page, |page| page.reset());
    for fragment in fragments {
        copy_missing(&page, fragment.page())?;
    }
    Ok(ScopeGuard::into_inner(page))
}

/// Copy every record of `src` whose slot is still empty in `dst`.
fn copy_missing(dst: &KeyValueLeafPage, src: &KeyValueLeafPage) -> Result<(), PageError> {
    for slot in src.occupied_slots() {
        if dst.get_record(slot)?.is_some() {
            continue;
        }
        let record = src.get_record(slot)?.expect("slot listed as occupied");
        dst.put_record(slot, record.data, record.dewey_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConf;
    use utils::id::{DatabaseId, ResourceId};

    fn meta(rev: i64, kind: FragmentKind, offset: u64) -> FragmentMeta {
        FragmentMeta {
            revision: Revision(rev),
            kind,
            offset,
        }
    }

    fn revisions(metas: &[FragmentMeta]) -> Vec<i64> {
        metas.iter().map(|m| m.revision.as_i64()).collect()
    }

    #[test]
    fn selection_full() {
        let avail = vec![
            meta(1, FragmentKind::FullDump, 0),
            meta(2, FragmentKind::FullDump, 10),
            meta(5, FragmentKind::FullDump, 20),
        ];
        let sel = VersioningType::Full.fragment_selection(&avail, Revision(4));
        assert_eq!(revisions(&sel), vec![2]);
    }

    #[test]
    fn selection_incremental_stops_at_full() {
        let avail = vec![
            meta(1, FragmentKind::FullDump, 0),
            meta(2, FragmentKind::Delta, 1),
            meta(3, FragmentKind::FullDump, 2),
            meta(4, FragmentKind::Delta, 3),
            meta(5, FragmentKind::Delta, 4),
        ];
        let sel = VersioningType::Incremental.fragment_selection(&avail, Revision(5));
        assert_eq!(revisions(&sel), vec![5, 4, 3]);
    }

    #[test]
    fn selection_differential_two_fragments() {
        let avail = vec![
            meta(1, FragmentKind::FullDump, 0),
            meta(2, FragmentKind::Delta, 1),
            meta(3, FragmentKind::Delta, 2),
        ];
        let sel = VersioningType::Differential.fragment_selection(&avail, Revision(3));
        assert_eq!(revisions(&sel), vec![3, 1]);
        // Reading at the full image itself needs only it.
        let sel = VersioningType::Differential.fragment_selection(&avail, Revision(1));
        assert_eq!(revisions(&sel), vec![1]);
    }

    #[test]
    fn selection_sliding_window() {
        let avail: Vec<FragmentMeta> =
            (1..=5).map(|r| meta(r, FragmentKind::Delta, r as u64)).collect();
        let sel = VersioningType::SlidingSnapshot { window: 3 }
            .fragment_selection(&avail, Revision(5));
        assert_eq!(revisions(&sel), vec![5, 4, 3]);
        let sel = VersioningType::SlidingSnapshot { window: 3 }
            .fragment_selection(&avail, Revision(2));
        assert_eq!(revisions(&sel), vec![2, 1]);
    }

    #[test]
    fn next_fragment_kind_cadence() {
        let inc = VersioningType::Incremental;
        assert_eq!(inc.next_fragment_kind(0, 4), FragmentKind::FullDump);
        assert_eq!(inc.next_fragment_kind(1, 4), FragmentKind::Delta);
        assert_eq!(inc.next_fragment_kind(3, 4), FragmentKind::Delta);
        assert_eq!(inc.next_fragment_kind(4, 4), FragmentKind::FullDump);
        assert_eq!(
            VersioningType::SlidingSnapshot { window: 3 }.next_fragment_kind(7, 4),
            FragmentKind::Delta
        );
        assert_eq!(
            VersioningType::Full.next_fragment_kind(2, 4),
            FragmentKind::FullDump
        );
    }

    // --- combining ---

    fn fixture() -> Arc<SegmentAllocator> {
        SegmentAllocator::new(&PoolConf::default())
    }

    fn fragment(
        alloc: &Arc<SegmentAllocator>,
        revision: i64,
        records: &[(usize, &[u8])],
    ) -> PageGuard {
        let page = KeyValueLeafPage::new(
            7,
            Revision(revision),
            SizeClass::K4,
            false,
            Arc::clone(alloc),
        )
        .unwrap();
        for (slot, data) in records {
            page.put_record(*slot, data, None).unwrap();
        }
        page.acquire_guard_count();
        PageGuard::adopt(page)
    }

    /// Drop the guards, then retire the fragment pages the way their owning
    /// cache would.
    fn retire(fragments: Vec<PageGuard>) {
        let pages: Vec<_> = fragments
            .iter()
            .map(|f| Arc::clone(f.page_arc()))
            .collect();
        drop(fragments);
        for page in pages {
            page.reset();
        }
    }

    fn test_ref(offset: i64) -> PageReference {
        PageReference {
            database_id: DatabaseId(1),
            resource_id: ResourceId(1),
            log_key: 0,
            page_offset: offset,
        }
    }

    #[test]
    fn combine_newest_wins() {
        let alloc = fixture();
        let fragments = vec![
            fragment(&alloc, 3, &[(0, b"new0"), (2, b"new2")]),
            fragment(&alloc, 2, &[(0, b"old0"), (1, b"old1")]),
        ];
        let page = VersioningType::Incremental
            .combine_for_read(&fragments, false, &alloc)
            .unwrap();
        assert_eq!(page.revision(), Revision(3));
        assert_eq!(page.get_record(0).unwrap().unwrap().data, b"new0");
        assert_eq!(page.get_record(1).unwrap().unwrap().data, b"old1");
        assert_eq!(page.get_record(2).unwrap().unwrap().data, b"new2");
        page.reset();
        retire(fragments);
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn combine_full_ignores_older_fragments() {
        let alloc = fixture();
        let fragments = vec![
            fragment(&alloc, 3, &[(0, b"new0")]),
            fragment(&alloc, 2, &[(1, b"stale")]),
        ];
        let page = VersioningType::Full
            .combine_for_read(&fragments, false, &alloc)
            .unwrap();
        assert!(page.get_record(1).unwrap().is_none());
        page.reset();
        retire(fragments);
    }

    #[test]
    fn modification_full_shares_one_instance() {
        let alloc = fixture();
        let fragments = vec![fragment(&alloc, 1, &[(0, b"a")])];
        let container = VersioningType::Full
            .combine_for_modification(&fragments, vec![test_ref(0)], Revision(2), false, &alloc)
            .unwrap();
        assert!(container.same_instance());
        container.complete().reset();
        retire(fragments);
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn modification_incremental_has_empty_delta() {
        let alloc = fixture();
        let fragments = vec![fragment(&alloc, 1, &[(0, b"a")])];
        let container = VersioningType::Incremental
            .combine_for_modification(&fragments, vec![test_ref(0)], Revision(2), false, &alloc)
            .unwrap();
        assert!(!container.same_instance());
        assert_eq!(container.modified().revision(), Revision(2));
        assert!(container.modified().get_record(0).unwrap().is_none());
        container.complete().reset();
        container.modified().reset();
        retire(fragments);
    }

    #[test]
    fn modification_differential_seeds_cumulative_delta() {
        let alloc = fixture();
        // Chain: delta at r3 over full at r1.
        let fragments = vec![
            fragment(&alloc, 3, &[(1, b"d1")]),
            fragment(&alloc, 1, &[(0, b"f0"), (1, b"f1")]),
        ];
        let container = VersioningType::Differential
            .combine_for_modification(&fragments, vec![], Revision(4), false, &alloc)
            .unwrap();
        // The new delta carries the previous delta's records, not the full
        // image's.
        assert_eq!(
            container.modified().get_record(1).unwrap().unwrap().data,
            b"d1"
        );
        assert!(container.modified().get_record(0).unwrap().is_none());
        assert_eq!(
            container.complete().get_record(0).unwrap().unwrap().data,
            b"f0"
        );
        container.complete().reset();
        container.modified().reset();
        retire(fragments);
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn sliding_snapshot_carries_expiring_records_and_closes_intermediate() {
        let alloc = fixture();
        let strategy = VersioningType::SlidingSnapshot { window: 3 };
        // Window [r10, r9, r8]; slot 0 only exists in r8, slot 1 was
        // rewritten at r9, slot 2 at r10.
        let fragments = vec![
            fragment(&alloc, 10, &[(2, b"c10")]),
            fragment(&alloc, 9, &[(1, b"b9")]),
            fragment(&alloc, 8, &[(0, b"a8"), (1, b"b8")]),
        ];
        let before = SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get();
        let container = strategy
            .combine_for_modification(&fragments, vec![], Revision(11), false, &alloc)
            .unwrap();
        assert_eq!(SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get(), before);

        // complete is the whole window view.
        assert_eq!(container.complete().get_record(0).unwrap().unwrap().data, b"a8");
        assert_eq!(container.complete().get_record(1).unwrap().unwrap().data, b"b9");
        assert_eq!(container.complete().get_record(2).unwrap().unwrap().data, b"c10");
        // Only slot 0 expires with r8 (slot 1 is carried by r9).
        assert_eq!(container.modified().get_record(0).unwrap().unwrap().data, b"a8");
        assert!(container.modified().get_record(1).unwrap().is_none());
        assert!(container.modified().get_record(2).unwrap().is_none());

        container.complete().reset();
        container.modified().reset();
        retire(fragments);
        assert_eq!(alloc.slices_in_use(), 0);
    }

    #[test]
    fn sliding_snapshot_unsaturated_window_carries_nothing() {
        let alloc = fixture();
        let strategy = VersioningType::SlidingSnapshot { window: 3 };
        let fragments = vec![
            fragment(&alloc, 2, &[(1, b"b")]),
            fragment(&alloc, 1, &[(0, b"a")]),
        ];
        let before = SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get();
        let container = strategy
            .combine_for_modification(&fragments, vec![], Revision(3), false, &alloc)
            .unwrap();
        assert_eq!(SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get(), before);
        assert!(container.modified().occupied_slots().next().is_none());
        container.complete().reset();
        container.modified().reset();
        retire(fragments);
    }

    /// A combine that fails midway (pool out of budget) must leave the
    /// intermediate-page gauge untouched and close its partial pages.
    #[test]
    fn failed_sliding_combine_leaves_gauge_and_segments_clean() {
        let alloc = fixture();
        let fragments = vec![
            fragment(&alloc, 10, &[(2, b"c")]),
            fragment(&alloc, 9, &[(1, b"b")]),
            fragment(&alloc, 8, &[(0, b"a")]),
        ];

        // Two 4 KiB slices of budget: enough for the complete and modified
        // pages, not for the intermediate.
        let starved = SegmentAllocator::new(&PoolConf {
            physical_budget_bytes: 8192,
            ..PoolConf::default()
        });

        let before = SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get();
        let result = VersioningType::SlidingSnapshot { window: 3 }.combine_for_modification(
            &fragments,
            vec![],
            Revision(11),
            false,
            &starved,
        );
        let Err(err) = result else {
            panic!("combine must fail on a starved pool")
        };
        assert!(matches!(err, PageError::Alloc(_)), "{err}");
        assert_eq!(SLIDING_SNAPSHOT_INTERMEDIATE_PAGES.get(), before);
        assert_eq!(starved.slices_in_use(), 0);
        retire(fragments);
    }

    /// Guards handed to the combiner stay with the caller: dropping the
    /// vector releases every fragment exactly once, also after an error.
    #[test]
    fn fragment_guards_released_by_caller_scope() {
        let alloc = fixture();
        let fragments = vec![
            fragment(&alloc, 2, &[(0, b"x")]),
            fragment(&alloc, 1, &[(1, b"y")]),
        ];
        let pages: Vec<_> = fragments
            .iter()
            .map(|f| Arc::clone(f.page_arc()))
            .collect();
        let page = VersioningType::Incremental
            .combine_for_read(&fragments, false, &alloc)
            .unwrap();
        page.reset();
        drop(fragments);
        for page in pages {
            assert_eq!(page.guard_count(), 0);
            page.reset();
        }
        assert_eq!(alloc.slices_in_use(), 0);
    }
}
