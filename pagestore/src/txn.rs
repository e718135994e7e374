//!
//! Read and write transactions: the only way user code touches pages.
//!
//! # Cursor discipline
//!
//! A read transaction holds at most one page guard, the *current* guard.
//! [`ReadTxn::fetch`] returns a [`PageView`] that borrows the transaction;
//! the borrow checker therefore enforces what the protocol demands: you
//! cannot move the cursor while a view is alive, and moving the cursor
//! releases the previous guard by overwriting it. Fragment guards taken
//! while materializing a page live in a local `Vec` inside the loader and
//! are gone, success or error, before the fetch returns.
//!
//! # Write path
//!
//! A write transaction owns a [`TransactionIntentLog`]. `modify` routes
//! every page through it: first touch loads the fragment chain, builds a
//! [`PageContainer`] for the upcoming revision, and hands it to the log -
//! which drains the page's cache entries, making the log the page's only
//! owner. Records are written through to both container members (when they
//! are distinct), so a full image is always ready whether the next fragment
//! turns out to be a full dump or a delta. Commit persists one fragment per
//! container, advances the committed revision, then drains the log; any
//! failure leaves the log owning everything and rollback (explicit or by
//! drop) reclaims it.
//!

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;
use utils::revision::Revision;

use crate::buffer_manager::{BufferManager, ResourceInner};
use crate::disk::{DiskError, ReaderContext};
use crate::epochs::EpochToken;
use crate::intent_log::{DrainOutcome, TransactionIntentLog};
use crate::page::{KeyValueLeafPage, PageError, PageGuard, PageReference, Record};
use crate::segment_alloc::{AllocError, SizeClass};
use crate::versioning::{FragmentMeta, PageContainer};

/// Slots of the per-cursor most-recent page cache; log keys map onto them
/// direct-mapped.
const MOST_RECENT_SLOTS: usize = 4;

/// Well-known index trees inside a resource, each living under its own log
/// key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Document,
    PathSummary,
    Name,
    Cas,
}

impl IndexKind {
    pub fn log_key(self) -> i32 {
        match self {
            IndexKind::Document => 0,
            IndexKind::PathSummary => -1,
            IndexKind::Name => -2,
            IndexKind::Cas => -3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("revision {requested} is not committed yet (latest is {committed})")]
    RevisionNotCommitted {
        requested: Revision,
        committed: Revision,
    },

    #[error("another write transaction is in flight for this resource")]
    WriteInFlight,

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Page(#[from] PageError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("failed to persist intent log")]
    Disk(#[from] DiskError),
}

/// A scoped, read-only view of one fetched page.
pub struct PageView<'a> {
    source: ViewSource<'a>,
}

enum ViewSource<'a> {
    /// Backed by the transaction's current guard.
    Guarded(&'a PageGuard),
    /// An intent-log-owned page; the log, not a guard, keeps it alive.
    Owned(Arc<KeyValueLeafPage>),
}

impl PageView<'_> {
    pub fn page(&self) -> &KeyValueLeafPage {
        match &self.source {
            ViewSource::Guarded(guard) => guard.page(),
            ViewSource::Owned(page) => page,
        }
    }

    pub fn get_record(&self, slot: usize) -> Result<Option<Record<'_>>, PageError> {
        self.page().get_record(slot)
    }

    pub fn page_key(&self) -> i64 {
        self.page().page_key()
    }

    pub fn revision(&self) -> Revision {
        self.page().revision()
    }
}

/// A write-through view of one intent-log-owned page.
pub struct MutablePageView<'a> {
    complete: Arc<KeyValueLeafPage>,
    modified: Arc<KeyValueLeafPage>,
    _txn: std::marker::PhantomData<&'a mut WriteTxn>,
}

impl MutablePageView<'_> {
    /// Records go to the full image and, when it is a distinct page, to the
    /// delta capture as well; commit picks whichever the versioning strategy
    /// needs.
    pub fn put_record(
        &self,
        slot: usize,
        data: &[u8],
        dewey_id: Option<&[u8]>,
    ) -> Result<(), PageError> {
        self.complete.put_record(slot, data, dewey_id)?;
        if !Arc::ptr_eq(&self.complete, &self.modified) {
            self.modified.put_record(slot, data, dewey_id)?;
        }
        Ok(())
    }

    pub fn get_record(&self, slot: usize) -> Result<Option<Record<'_>>, PageError> {
        self.complete.get_record(slot)
    }

    pub fn page_key(&self) -> i64 {
        self.complete.page_key()
    }
}

///
/// A snapshot reader at one committed revision.
///
pub struct ReadTxn {
    mgr: Arc<BufferManager>,
    resource: Arc<ResourceInner>,
    ctx: ReaderContext,
    revision: Revision,
    current: Option<PageGuard>,
    most_recent: [Option<(PageReference, Arc<KeyValueLeafPage>)>; MOST_RECENT_SLOTS],
    _epoch: EpochToken,
}

impl ReadTxn {
    pub(crate) fn begin(
        mgr: Arc<BufferManager>,
        resource: Arc<ResourceInner>,
        revision: Revision,
    ) -> Result<ReadTxn, FetchError> {
        let committed = resource.storage.committed_revision();
        if revision > committed {
            return Err(FetchError::RevisionNotCommitted {
                requested: revision,
                committed,
            });
        }
        let epoch = mgr
            .epochs()
            .register(resource.database_id, resource.resource_id, revision);
        let ctx = ReaderContext {
            database_id: resource.database_id,
            resource_id: resource.resource_id,
        };
        Ok(ReadTxn {
            mgr,
            resource,
            ctx,
            revision,
            current: None,
            most_recent: Default::default(),
            _epoch: epoch,
        })
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    ///
    /// Move the cursor to the record page `page_key` of the `log_key` index
    /// tree, materializing it if needed. `Ok(None)` means the page does not
    /// exist at this revision.
    ///
    pub fn fetch(
        &mut self,
        log_key: i32,
        page_key: i64,
    ) -> Result<Option<PageView<'_>>, FetchError> {
        let selection = self
            .resource
            .conf
            .versioning
            .fragment_selection(&self.resource.storage.fragment_index(log_key, page_key), self.revision);
        let Some(newest) = selection.first() else {
            self.current = None;
            return Ok(None);
        };
        let page_ref = self.ctx.fragment_ref(log_key, newest);

        let slot = most_recent_slot(log_key);
        let mut adopted = None;
        if let Some((recent_ref, recent_page)) = self.most_recent[slot].take() {
            if recent_ref == page_ref {
                if let Some(guard) = self.mgr.record_page_cache().try_get_and_guard(&page_ref) {
                    if Arc::ptr_eq(guard.page_arc(), &recent_page) {
                        adopted = Some(guard);
                    }
                    // A different instance means our memo was stale; the
                    // guard we just took is dropped and the full path below
                    // keeps the bookkeeping in one place.
                }
            }
            if adopted.is_some() {
                self.most_recent[slot] = Some((recent_ref, recent_page));
            }
        }

        let guard = match adopted {
            Some(guard) => guard,
            None => {
                let guard = with_budget_retry(&self.mgr, || {
                    self.mgr.record_page_cache().get_and_guard(&page_ref, || {
                        materialize(&self.mgr, &self.resource, &self.ctx, log_key, &selection)
                    })
                })?;
                self.most_recent[slot] = Some((page_ref, Arc::clone(guard.page_arc())));
                guard
            }
        };

        // Installing the new guard drops the previous one: the cursor holds
        // at most one.
        self.current = Some(guard);
        Ok(Some(PageView {
            source: ViewSource::Guarded(self.current.as_ref().expect("just installed")),
        }))
    }

    pub fn fetch_index(
        &mut self,
        index: IndexKind,
        page_key: i64,
    ) -> Result<Option<PageView<'_>>, FetchError> {
        self.fetch(index.log_key(), page_key)
    }

    /// Drop the current guard and deregister from the epoch tracker.
    pub fn close(self) {}
}

///
/// A single-flight writer preparing the next revision.
///
pub struct WriteTxn {
    mgr: Arc<BufferManager>,
    resource: Arc<ResourceInner>,
    ctx: ReaderContext,
    base_revision: Revision,
    new_revision: Revision,
    til: TransactionIntentLog,
    current: Option<PageGuard>,
    finished: bool,
    _epoch: EpochToken,
}

impl WriteTxn {
    pub(crate) fn begin(
        mgr: Arc<BufferManager>,
        resource: Arc<ResourceInner>,
        base_revision: Revision,
    ) -> Result<WriteTxn, FetchError> {
        let committed = resource.storage.committed_revision();
        if base_revision > committed {
            return Err(FetchError::RevisionNotCommitted {
                requested: base_revision,
                committed,
            });
        }
        if resource
            .write_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FetchError::WriteInFlight);
        }
        let epoch = mgr.epochs().register(
            resource.database_id,
            resource.resource_id,
            base_revision,
        );
        let til = TransactionIntentLog::new(
            Arc::clone(mgr.record_page_cache()),
            Arc::clone(mgr.fragment_cache()),
        );
        let ctx = ReaderContext {
            database_id: resource.database_id,
            resource_id: resource.resource_id,
        };
        Ok(WriteTxn {
            mgr,
            resource,
            ctx,
            base_revision,
            new_revision: committed.next(),
            til,
            current: None,
            finished: false,
            _epoch: epoch,
        })
    }

    pub fn base_revision(&self) -> Revision {
        self.base_revision
    }

    pub fn new_revision(&self) -> Revision {
        self.new_revision
    }

    /// The cache/log identity of a record page: the newest fragment at or
    /// below the base revision, or the page key itself for a page this
    /// transaction creates.
    fn record_page_ref(&self, log_key: i32, page_key: i64) -> (PageReference, Vec<FragmentMeta>) {
        let metas = self.resource.storage.fragment_index(log_key, page_key);
        let selection = self
            .resource
            .conf
            .versioning
            .fragment_selection(&metas, self.base_revision);
        let page_ref = match selection.first() {
            Some(newest) => self.ctx.fragment_ref(log_key, newest),
            None => PageReference {
                database_id: self.ctx.database_id,
                resource_id: self.ctx.resource_id,
                log_key,
                page_offset: page_key,
            },
        };
        (page_ref, selection)
    }

    ///
    /// Open the record page for modification, pulling it into the intent
    /// log on first touch.
    ///
    pub fn modify(
        &mut self,
        log_key: i32,
        page_key: i64,
    ) -> Result<MutablePageView<'_>, FetchError> {
        let (page_ref, selection) = self.record_page_ref(log_key, page_key);

        if let Some((complete, modified)) = self.til.get(&page_ref) {
            return Ok(MutablePageView {
                complete,
                modified,
                _txn: std::marker::PhantomData,
            });
        }

        let container = if selection.is_empty() {
            // First revision of this page: one fresh page serves as both
            // members.
            let page = with_budget_retry(&self.mgr, || {
                KeyValueLeafPage::new(
                    page_key,
                    self.new_revision,
                    SizeClass::smallest(),
                    self.resource.conf.dewey_ids,
                    Arc::clone(self.mgr.allocator()),
                )
                .map_err(FetchError::from)
            })?;
            PageContainer::new(Arc::clone(&page), page, Vec::new())
        } else {
            with_budget_retry(&self.mgr, || {
                let (guards, refs) =
                    load_fragments(&self.mgr, &self.resource, &self.ctx, log_key, &selection)?;
                self.resource
                    .conf
                    .versioning
                    .combine_for_modification(
                        &guards,
                        refs,
                        self.new_revision,
                        self.resource.conf.dewey_ids,
                        self.mgr.allocator(),
                    )
                    .map_err(FetchError::from)
                // `guards` drops here: every fragment guard released no
                // matter how we leave this block.
            })?
        };

        self.til.put(page_ref, container);
        let (complete, modified) = self.til.get(&page_ref).expect("just inserted");
        Ok(MutablePageView {
            complete,
            modified,
            _txn: std::marker::PhantomData,
        })
    }

    /// Snapshot read inside the writer: intent-log pages win over the cache.
    pub fn fetch(
        &mut self,
        log_key: i32,
        page_key: i64,
    ) -> Result<Option<PageView<'_>>, FetchError> {
        let (page_ref, selection) = self.record_page_ref(log_key, page_key);
        if let Some((complete, _)) = self.til.get(&page_ref) {
            return Ok(Some(PageView {
                source: ViewSource::Owned(complete),
            }));
        }
        if selection.is_empty() {
            return Ok(None);
        }
        let guard = with_budget_retry(&self.mgr, || {
            self.mgr.record_page_cache().get_and_guard(&page_ref, || {
                materialize(&self.mgr, &self.resource, &self.ctx, log_key, &selection)
            })
        })?;
        // Same cursor discipline as the read transaction: one guard, the
        // view borrows it.
        self.current = Some(guard);
        Ok(Some(PageView {
            source: ViewSource::Guarded(self.current.as_ref().expect("just installed")),
        }))
    }

    ///
    /// Persist every modified page as the new revision's fragment, advance
    /// the committed revision, and drain the intent log.
    ///
    /// On error the log still owns every page; the transaction's drop (or an
    /// explicit [`Self::rollback`]) reclaims the segments.
    ///
    pub fn commit(mut self) -> Result<Revision, CommitError> {
        let storage = &self.resource.storage;
        let versioning = self.resource.conf.versioning;
        let full_dump_period = self.resource.conf.full_dump_period;
        let new_revision = self.new_revision;

        let mut staged: Vec<((i32, i64), FragmentMeta)> = Vec::new();
        self.til.for_each_container(|page_ref, container| {
            let page_key = container.complete().page_key();
            let log_key = page_ref.log_key;
            let chain = storage.chain_len_since_full(log_key, page_key);
            let kind = versioning.next_fragment_kind(chain, full_dump_period);
            let page = match kind {
                crate::versioning::FragmentKind::FullDump => container.complete(),
                crate::versioning::FragmentKind::Delta => container.modified(),
            };
            let offset = storage.write_fragment(log_key, page, kind)?;
            staged.push((
                (log_key, page_key),
                FragmentMeta {
                    revision: new_revision,
                    kind,
                    offset,
                },
            ));
            Ok::<(), DiskError>(())
        })?;

        storage.commit_revision(new_revision, staged)?;
        let outcome = self.til.clear();
        self.finished = true;
        debug!(revision = %new_revision, ?outcome, "commit complete");
        Ok(new_revision)
    }

    /// Throw away every uncommitted change and reclaim its memory.
    pub fn rollback(mut self) -> DrainOutcome {
        self.finished = true;
        self.til.clear()
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned writer: same drain as rollback.
            self.til.clear();
        }
        self.resource.write_flight.store(false, Ordering::Release);
    }
}

fn most_recent_slot(log_key: i32) -> usize {
    log_key.rem_euclid(MOST_RECENT_SLOTS as i32) as usize
}

/// Load the selected fragment chain through the fragment cache, guarding
/// each member, and reference them with injected context ids.
fn load_fragments(
    mgr: &BufferManager,
    resource: &ResourceInner,
    ctx: &ReaderContext,
    log_key: i32,
    selection: &[FragmentMeta],
) -> Result<(Vec<PageGuard>, Vec<PageReference>), FetchError> {
    let mut guards = Vec::with_capacity(selection.len());
    let mut refs = Vec::with_capacity(selection.len());
    for meta in selection {
        let fragment_ref = ctx.fragment_ref(log_key, meta);
        let guard = mgr.fragment_cache().get_and_guard(&fragment_ref, || {
            resource
                .storage
                .read_fragment(meta.offset, resource.conf.dewey_ids, mgr.allocator())
                .map_err(FetchError::from)
        })?;
        guards.push(guard);
        refs.push(fragment_ref);
    }
    Ok((guards, refs))
}

/// The record-page loader: fetch the fragment chain (each member briefly
/// guarded) and combine it into the materialized view.
fn materialize(
    mgr: &BufferManager,
    resource: &ResourceInner,
    ctx: &ReaderContext,
    log_key: i32,
    selection: &[FragmentMeta],
) -> Result<Arc<KeyValueLeafPage>, FetchError> {
    let (guards, _refs) = load_fragments(mgr, resource, ctx, log_key, selection)?;
    let page = resource.conf.versioning.combine_for_read(
        &guards,
        resource.conf.dewey_ids,
        mgr.allocator(),
    )?;
    Ok(page)
}

/// Budget failures get exactly one retry, after kicking the sweepers and
/// giving them enough runway for a second-chance cycle (clear HOT, then
/// evict) on every shard.
fn with_budget_retry<T>(
    mgr: &BufferManager,
    mut f: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    match f() {
        Err(ref err) if is_budget_exceeded(err) => {
            debug!("allocation hit the budget; kicking sweepers and retrying once");
            mgr.allocator().pressure().notify_waiters();
            std::thread::sleep(3 * mgr.conf().sweeper_interval);
            f()
        }
        other => other,
    }
}

fn is_budget_exceeded(err: &FetchError) -> bool {
    matches!(
        err,
        FetchError::Page(PageError::Alloc(AllocError::BudgetExceeded { .. }))
    )
}
