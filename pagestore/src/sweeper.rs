//! The per-shard page sweeper, which retires cached pages no live snapshot
//! can need anymore and returns their memory to the allocator.
//!
//! One task runs per shard of each segment-backed cache. A round walks the
//! shard once and applies, in order:
//!
//! - HOT page: clear the bit and move on (second chance).
//! - Guarded page: skip; the guard protocol owns its lifetime.
//! - Page at or above the resource's revision watermark: skip: some live
//!   reader's snapshot may still resolve to it. Under shard weight pressure
//!   this rule is waived: an unguarded page is always reconstructible from
//!   disk, keeping it is only a performance bet we can no longer afford.
//! - Otherwise: evict and reset.
//!
//! Every eviction decision is revalidated under the shard lock inside
//! [`PageCache::try_evict`]; the walk itself runs over an unlocked snapshot.
//! HOT bits bound staleness: a page that stops being accessed survives at
//! most one full round after its last access.
//!
//! Rounds run every `sweeper_interval`, or early when the allocator signals
//! budget pressure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::epochs::RevisionEpochs;
use crate::metrics::SWEEP_SECONDS;
use crate::page_cache::{EvictionReason, PageCache};
use crate::segment_alloc::SegmentAllocator;
use crate::task_mgr::{random_init_delay, warn_when_period_overrun, TaskKind, BACKGROUND_RUNTIME};

#[derive(Debug, Default)]
struct SweepStats {
    examined: usize,
    second_chance: usize,
    guarded: usize,
    retained: usize,
    evicted: usize,
    evicted_size: usize,
}

pub(crate) fn spawn_sweepers(
    caches: &[Arc<PageCache>],
    epochs: Arc<RevisionEpochs>,
    allocator: Arc<SegmentAllocator>,
    interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for cache in caches {
        for shard in 0..cache.shard_count() {
            let cache = Arc::clone(cache);
            let epochs = Arc::clone(&epochs);
            let allocator = Arc::clone(&allocator);
            let cancel = cancel.clone();
            let span = info_span!("sweeper", cache = cache.name(), shard);
            handles.push(BACKGROUND_RUNTIME.spawn(
                async move {
                    sweep_loop(cache, shard, epochs, allocator, interval, cancel).await;
                }
                .instrument(span),
            ));
        }
    }
    handles
}

async fn sweep_loop(
    cache: Arc<PageCache>,
    shard: usize,
    epochs: Arc<RevisionEpochs>,
    allocator: Arc<SegmentAllocator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if random_init_delay(interval, &cancel).await.is_err() {
        return;
    }
    loop {
        let started = Instant::now();
        let stats = sweep_shard(&cache, shard, &epochs, &allocator, &cancel);
        SWEEP_SECONDS.observe(started.elapsed().as_secs_f64());
        warn_when_period_overrun(started.elapsed(), interval, TaskKind::Sweeper);
        if stats.evicted + stats.evicted_size > 0 {
            debug!(?stats, "sweep round complete");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            // Budget pressure cuts the nap short so memory comes back while
            // the allocator is still asking for it.
            _ = allocator.pressure().notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn sweep_shard(
    cache: &PageCache,
    shard: usize,
    epochs: &RevisionEpochs,
    allocator: &SegmentAllocator,
    cancel: &CancellationToken,
) -> SweepStats {
    let mut stats = SweepStats::default();
    // Weight limits and the physical budget are both cache-pressure signals:
    // a pool whose budget has no headroom left for one more region must shed
    // reconstructible pages even when the watermark still covers them.
    let over_weight = cache.shard_over_weight(shard) || allocator.under_pressure();

    for (page_ref, page) in cache.sweep_snapshot(shard) {
        // Shutdown is only honored between entries; an entry's eviction is
        // atomic either way.
        if cancel.is_cancelled() {
            break;
        }
        stats.examined += 1;

        if page.take_hot() {
            stats.second_chance += 1;
            continue;
        }
        if page.guard_count() > 0 {
            stats.guarded += 1;
            continue;
        }
        let watermark = epochs.min_active_revision(page_ref.database_id, page_ref.resource_id);
        if page.revision() >= watermark {
            if over_weight && cache.try_evict(&page_ref, &page, EvictionReason::Size) {
                stats.evicted_size += 1;
            } else {
                stats.retained += 1;
            }
            continue;
        }
        if cache.try_evict(&page_ref, &page, EvictionReason::Sweeper) {
            stats.evicted += 1;
        }
    }
    stats
}
