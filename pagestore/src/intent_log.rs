//!
//! The transaction intent log (TIL): where a writer's uncommitted pages live.
//!
//! A page is either mapped in a cache or held by a TIL, never both: with two
//! owners, each has its own idea of when `reset()` runs and the loser reads
//! freed segments. [`TransactionIntentLog::put`] therefore drains
//! the key (and every fragment the container was built from) out of both
//! segment-backed caches before storing the container, and asserts the drain
//! took. TIL pages are not guarded: the TIL is the exclusive owner and the
//! only closer.
//!
//! Commit and rollback funnel into [`TransactionIntentLog::clear`], which
//! closes `complete`, and `modified` only when it is a distinct instance.
//! Closing one page twice would double-release its segments.
//!

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::metrics::TIL_RESIDUAL_BYTES;
use crate::page::{KeyValueLeafPage, PageReference};
use crate::page_cache::{EvictionReason, PageCache};
use crate::versioning::PageContainer;

/// What a drain closed; the commit/rollback caller reports and tests assert
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub containers: usize,
    pub pages_closed: usize,
    pub residual_bytes: u64,
}

///
/// Exclusive store of one writer's modified pages.
///
pub struct TransactionIntentLog {
    record_page_cache: Arc<PageCache>,
    fragment_cache: Arc<PageCache>,
    entries: Mutex<HashMap<PageReference, PageContainer>>,
    pages_closed: AtomicU64,
}

impl TransactionIntentLog {
    pub fn new(
        record_page_cache: Arc<PageCache>,
        fragment_cache: Arc<PageCache>,
    ) -> TransactionIntentLog {
        TransactionIntentLog {
            record_page_cache,
            fragment_cache,
            entries: Mutex::new(HashMap::new()),
            pages_closed: AtomicU64::new(0),
        }
    }

    ///
    /// Take exclusive ownership of `container` under `page_ref`.
    ///
    /// Drains `page_ref` and all of the container's fragment references from
    /// the caches first. Finding the key still cached after the drain is a
    /// protocol violation, not a recoverable condition.
    ///
    pub fn put(&self, page_ref: PageReference, container: PageContainer) {
        self.record_page_cache
            .remove(&page_ref, EvictionReason::Explicit);
        self.fragment_cache
            .remove(&page_ref, EvictionReason::Explicit);
        for fragment_ref in container.fragment_refs() {
            self.fragment_cache
                .remove(fragment_ref, EvictionReason::Explicit);
        }

        assert!(
            !self.record_page_cache.contains(&page_ref)
                && !self.fragment_cache.contains(&page_ref),
            "dual ownership: {page_ref} still cached after intent-log drain"
        );

        let prior = self.entries.lock().insert(page_ref, container);
        assert!(
            prior.is_none(),
            "intent log already owned {page_ref}; modify() must route through get()"
        );
    }

    /// O(1) lookup of the owned pages for `page_ref`:
    /// `(complete, modified)`.
    pub fn get(
        &self,
        page_ref: &PageReference,
    ) -> Option<(Arc<KeyValueLeafPage>, Arc<KeyValueLeafPage>)> {
        let entries = self.entries.lock();
        let container = entries.get(page_ref)?;
        Some((
            Arc::clone(container.complete()),
            Arc::clone(container.modified()),
        ))
    }

    pub fn contains(&self, page_ref: &PageReference) -> bool {
        self.entries.lock().contains_key(page_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total pages this log has closed over its lifetime.
    pub fn pages_closed(&self) -> u64 {
        self.pages_closed.load(Ordering::Acquire)
    }

    /// Run `f` over every owned container. The commit path serializes
    /// through this; the log keeps ownership the whole time, so a failing
    /// `f` leaves every page reclaimable by [`Self::clear`].
    pub fn for_each_container<E>(
        &self,
        mut f: impl FnMut(&PageReference, &PageContainer) -> Result<(), E>,
    ) -> Result<(), E> {
        let entries = self.entries.lock();
        for (page_ref, container) in entries.iter() {
            f(page_ref, container)?;
        }
        Ok(())
    }

    ///
    /// Close every owned page and empty the log. Used by commit (after the
    /// writer persisted the fragments) and by rollback (instead of
    /// persisting anything).
    ///
    pub fn clear(&self) -> DrainOutcome {
        let drained: Vec<(PageReference, PageContainer)> =
            self.entries.lock().drain().collect();

        let mut outcome = DrainOutcome {
            containers: drained.len(),
            pages_closed: 0,
            residual_bytes: 0,
        };
        for (_, container) in drained {
            outcome.residual_bytes += container.used_bytes();
            container.complete().reset();
            outcome.pages_closed += 1;
            if !container.same_instance() {
                container.modified().reset();
                outcome.pages_closed += 1;
            }
        }
        self.pages_closed
            .fetch_add(outcome.pages_closed as u64, Ordering::AcqRel);
        TIL_RESIDUAL_BYTES.observe(outcome.residual_bytes as f64);
        if outcome.containers > 0 {
            debug!(?outcome, "intent log drained");
        }
        outcome
    }
}

impl Drop for TransactionIntentLog {
    fn drop(&mut self) {
        // An abandoned write transaction must still return its segments.
        self.clear();
    }
}
