//! End-to-end tests of the buffer pool: the lifecycle protocol, versioned
//! reads, intent-log ownership, and the allocator budget, driven through the
//! public API only.
//!
//! The pool is process-wide, so every test opens its own resource ids and
//! files; the first test to run initializes the pool with [`pool_conf`] and
//! the others join it.

use std::sync::Arc;
use std::time::Duration;

use camino_tempfile::Utf8TempDir;
use pagestore::config::PoolConf;
use pagestore::page::{KeyValueLeafPage, PageReference};
use pagestore::page_cache::PageCache;
use pagestore::segment_alloc::{AllocError, SegmentAllocator, SizeClass};
use pagestore::{
    open_resource, IndexKind, ResourceConf, ResourceHandle, ResourceSpec, VersioningType,
};
use utils::id::{DatabaseId, ResourceId};
use utils::revision::Revision;

fn pool_conf() -> PoolConf {
    init_logging();
    PoolConf {
        physical_budget_bytes: 64 * 1024 * 1024,
        sweeper_interval: Duration::from_millis(50),
        shards: 8,
        ..PoolConf::default()
    }
}

fn init_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn open(
    dir: &Utf8TempDir,
    db: u64,
    res: u64,
    versioning: VersioningType,
) -> anyhow::Result<ResourceHandle> {
    open_resource(
        ResourceSpec {
            database_id: DatabaseId(db),
            resource_id: ResourceId(res),
            path: dir.path().join(format!("{db}-{res}.pagestore")),
            conf: ResourceConf {
                versioning,
                dewey_ids: false,
                full_dump_period: 4,
            },
        },
        &pool_conf(),
    )
}

/// Commit one revision writing `records` into page 1 of the document index.
fn commit_records(handle: &ResourceHandle, records: &[(usize, &[u8])]) -> Revision {
    let mut txn = handle.begin_write(handle.committed_revision()).unwrap();
    let view = txn.modify(0, 1).unwrap();
    for (slot, data) in records {
        view.put_record(*slot, data, None).unwrap();
    }
    drop(view);
    txn.commit().unwrap()
}

fn metric_value(name: &str) -> f64 {
    metrics::gather()
        .iter()
        .find(|mf| mf.get_name() == name)
        .map(|mf| {
            mf.get_metric()
                .iter()
                .map(|m| {
                    if m.has_gauge() {
                        m.get_gauge().get_value()
                    } else {
                        m.get_counter().get_value()
                    }
                })
                .sum()
        })
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------------

#[test]
fn commit_visibility_across_revisions() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 10, 1, VersioningType::SlidingSnapshot { window: 3 }).unwrap();

    let r1 = commit_records(&handle, &[(0, b"alpha")]);
    let r2 = commit_records(&handle, &[(1, b"beta")]);
    assert_eq!(r2, r1.next());

    // A reader at r2 sees both records.
    let mut txn = handle.begin_read(r2).unwrap();
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert_eq!(view.get_record(0).unwrap().unwrap().data, b"alpha");
    assert_eq!(view.get_record(1).unwrap().unwrap().data, b"beta");
    drop(view);

    // A reader at r1 does not see the second commit.
    let mut txn = handle.begin_read(r1).unwrap();
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert_eq!(view.get_record(0).unwrap().unwrap().data, b"alpha");
    assert!(view.get_record(1).unwrap().is_none());
    drop(view);

    // The future is not readable.
    assert!(handle.begin_read(r2.next()).is_err());
}

#[test]
fn read_idempotence_within_one_transaction() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 10, 2, VersioningType::Incremental).unwrap();
    let rev = commit_records(&handle, &[(3, b"stable"), (7, b"more")]);

    let mut txn = handle.begin_read(rev).unwrap();
    let first: Vec<u8> = txn
        .fetch(0, 1)
        .unwrap()
        .unwrap()
        .get_record(3)
        .unwrap()
        .unwrap()
        .data
        .to_vec();
    for _ in 0..5 {
        let view = txn.fetch_index(IndexKind::Document, 1).unwrap().unwrap();
        assert_eq!(view.get_record(3).unwrap().unwrap().data, &first[..]);
    }
}

#[test]
fn write_read_roundtrip_through_intent_log() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 10, 3, VersioningType::Differential).unwrap();
    commit_records(&handle, &[(0, b"committed")]);

    let mut txn = handle.begin_write(handle.committed_revision()).unwrap();
    let view = txn.modify(0, 1).unwrap();
    view.put_record(5, b"uncommitted", None).unwrap();
    drop(view);

    // The writer's own fetch resolves through the intent log.
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert_eq!(view.get_record(5).unwrap().unwrap().data, b"uncommitted");
    assert_eq!(view.get_record(0).unwrap().unwrap().data, b"committed");
    drop(view);
    txn.rollback();

    // Rolled back: gone for everyone.
    let mut txn = handle.begin_read_latest().unwrap();
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert!(view.get_record(5).unwrap().is_none());
}

#[test]
fn versioning_strategies_reconstruct_identically() {
    // Same workload under every strategy must materialize the same view.
    let dir = camino_tempfile::tempdir().unwrap();
    let strategies: &[(u64, VersioningType)] = &[
        (1, VersioningType::Full),
        (2, VersioningType::Incremental),
        (3, VersioningType::Differential),
        (4, VersioningType::SlidingSnapshot { window: 3 }),
    ];
    for (res, versioning) in strategies {
        let handle = open(&dir, 11, *res, *versioning).unwrap();
        // Enough commits to cross the full-dump period and the window.
        for i in 0..6usize {
            commit_records(&handle, &[(i, format!("v{i}").as_bytes())]);
        }
        let mut txn = handle.begin_read_latest().unwrap();
        let view = txn.fetch(0, 1).unwrap().unwrap();
        for i in 0..6usize {
            assert_eq!(
                view.get_record(i).unwrap().unwrap().data,
                format!("v{i}").as_bytes(),
                "strategy {versioning:?} lost slot {i}"
            );
        }
    }
}

#[test]
fn sliding_snapshot_window_keeps_old_records_reachable() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 10, 4, VersioningType::SlidingSnapshot { window: 2 }).unwrap();

    // Slot 0 is written once, then many other commits push it past the
    // window; the carry-forward must keep it readable.
    commit_records(&handle, &[(0, b"keepme")]);
    for i in 1..5usize {
        commit_records(&handle, &[(i, b"churn")]);
    }
    let mut txn = handle.begin_read_latest().unwrap();
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert_eq!(view.get_record(0).unwrap().unwrap().data, b"keepme");
}

// ---------------------------------------------------------------------------
// Allocator budget reclamation
// ---------------------------------------------------------------------------

#[test]
fn allocator_reclaims_under_budget_pressure() {
    let conf = PoolConf {
        physical_budget_bytes: 2 * 1024 * 1024,
        ..PoolConf::default()
    };
    let alloc = SegmentAllocator::new(&conf);

    let mut segments = Vec::new();
    for _ in 0..8 {
        segments.push(alloc.allocate(SizeClass::K256).unwrap());
    }
    assert_eq!(alloc.physical_bytes(), 2 * 1024 * 1024);
    for segment in segments.drain(..) {
        alloc.release(segment);
    }
    // Physical release is deferred, not eager.
    assert_eq!(alloc.physical_bytes(), 2 * 1024 * 1024);

    let segment = alloc.allocate(SizeClass::K256).unwrap();
    assert_eq!(alloc.physical_bytes(), 1024 * 1024);
    alloc.release(segment);
}

/// Tracked physical bytes never exceed the budget by more than one region,
/// even with allocate and reclaim racing.
#[test]
fn budget_bound_under_concurrency() {
    let conf = PoolConf {
        physical_budget_bytes: 4 * 1024 * 1024,
        ..PoolConf::default()
    };
    let alloc = SegmentAllocator::new(&conf);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let alloc = Arc::clone(&alloc);
        handles.push(std::thread::spawn(move || {
            for _ in 0..300 {
                match alloc.allocate(SizeClass::K64) {
                    Ok(seg) => {
                        assert!(
                            alloc.physical_bytes() <= 4 * 1024 * 1024 + 2 * 1024 * 1024,
                            "budget overshoot beyond one region"
                        );
                        alloc.release(seg);
                    }
                    Err(AllocError::BudgetExceeded { .. }) => {}
                    Err(e) => panic!("unexpected alloc failure: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // At quiescence nothing is in use.
    assert_eq!(alloc.slices_in_use(), 0);
}

// ---------------------------------------------------------------------------
// Guards vs the sweeper (through the public pool)
// ---------------------------------------------------------------------------

#[test]
fn guarded_page_survives_sweeper_until_release() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 12, 1, VersioningType::Full).unwrap();
    let rev = commit_records(&handle, &[(0, b"pinned")]);
    let cache = Arc::clone(handle.buffer_manager().record_page_cache());

    let mut txn = handle.begin_read(rev).unwrap();
    let view = txn.fetch(0, 1).unwrap().unwrap();
    assert_eq!(cache_len_for(&cache, &handle), 1);

    // Plenty of sweeper rounds pass; the guard (and the reader's epoch
    // registration) keep the page alive and readable.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(view.get_record(0).unwrap().unwrap().data, b"pinned");
    drop(view);
    drop(txn);

    // No guard, no registered reader: the watermark is +inf and the sweeper
    // retires the page within a couple of rounds.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while cache_len_for(&cache, &handle) > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "sweeper did not evict an unguarded dead page"
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn cache_len_for(cache: &PageCache, handle: &ResourceHandle) -> usize {
    // The caches are global; count only this resource's mappings.
    let page_ref = first_fragment_ref(handle);
    usize::from(cache.contains(&page_ref))
}

/// The first fragment ever appended to a fresh resource file lands right
/// after the header.
fn first_fragment_ref(handle: &ResourceHandle) -> PageReference {
    PageReference {
        database_id: handle.database_id(),
        resource_id: handle.resource_id(),
        log_key: 0,
        page_offset: 16,
    }
}

// ---------------------------------------------------------------------------
// Sliding snapshot intermediate closure
// ---------------------------------------------------------------------------

#[test]
fn sliding_snapshot_leaves_no_intermediate_pages() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 12, 2, VersioningType::SlidingSnapshot { window: 3 }).unwrap();
    for i in 0..5usize {
        commit_records(&handle, &[(i, b"fragment")]);
    }

    // A modification over a saturated window exercises the intermediate
    // page; the gauge must be back to zero when the call returns.
    let mut txn = handle.begin_write(handle.committed_revision()).unwrap();
    let view = txn.modify(0, 1).unwrap();
    view.put_record(9, b"newest", None).unwrap();
    drop(view);
    txn.commit().unwrap();

    assert_eq!(
        metric_value("pagestore_sliding_snapshot_intermediate_pages"),
        0.0
    );
    // Reclamation stays on the reset() paths: the drop-handler counter must
    // not move, ever.
    assert_eq!(metric_value("pagestore_leaked_page_resets_total"), 0.0);
}

// ---------------------------------------------------------------------------
// Dual-ownership prevention
// ---------------------------------------------------------------------------

#[test]
fn modified_page_owned_by_intent_log_only() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 1, 2, VersioningType::Incremental).unwrap();
    let mgr = Arc::clone(handle.buffer_manager());

    let mut txn = handle.begin_write(Revision::BASE).unwrap();
    let view = txn.modify(-15, 42).unwrap();
    view.put_record(0, b"dirty", None).unwrap();
    drop(view);

    // Fresh page: its log identity is (db, res, log_key, page_key).
    let page_ref = PageReference {
        database_id: DatabaseId(1),
        resource_id: ResourceId(2),
        log_key: -15,
        page_offset: 42,
    };
    assert!(!mgr.record_page_cache().contains(&page_ref));
    assert!(!mgr.fragment_cache().contains(&page_ref));

    // A concurrent reader at the write base must not observe the dirty
    // page: there is nothing committed, so there is nothing to read.
    let mut reader = handle.begin_read(Revision::BASE).unwrap();
    assert!(reader.fetch(-15, 42).unwrap().is_none());
    drop(reader);
    txn.rollback();
}

#[test]
fn writer_drains_previously_cached_page() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 1, 3, VersioningType::Incremental).unwrap();
    let mgr = Arc::clone(handle.buffer_manager());
    let rev = commit_records(&handle, &[(0, b"cached")]);

    // Materialize the page into both caches. The reader stays registered so
    // the sweeper cannot retire the entries under this test's feet.
    let mut reader = handle.begin_read(rev).unwrap();
    reader.fetch(0, 1).unwrap().unwrap();
    let page_ref = first_fragment_ref(&handle);
    assert!(mgr.record_page_cache().contains(&page_ref));
    assert!(mgr.fragment_cache().contains(&page_ref));

    // First touch by a writer drains both, the reader's guard notwithstanding
    // (its page just becomes an orphan the guard drop reclaims).
    let mut txn = handle.begin_write(rev).unwrap();
    txn.modify(0, 1).unwrap();
    assert!(!mgr.record_page_cache().contains(&page_ref));
    assert!(!mgr.fragment_cache().contains(&page_ref));
    txn.rollback();
    drop(reader);
}

// ---------------------------------------------------------------------------
// Coalesced cold load (public cache API)
// ---------------------------------------------------------------------------

#[test]
fn racing_cold_reads_share_one_mapping() {
    let cache = Arc::new(PageCache::new("pool_test_race", 8, u64::MAX));
    let alloc = SegmentAllocator::new(&pool_conf());
    let page_ref = PageReference {
        database_id: DatabaseId(99),
        resource_id: ResourceId(1),
        log_key: 0,
        page_offset: 7,
    };
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let mut threads = Vec::new();
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let alloc = Arc::clone(&alloc);
        let barrier = Arc::clone(&barrier);
        threads.push(std::thread::spawn(move || {
            barrier.wait();
            let guard = cache
                .get_and_guard::<std::convert::Infallible>(&page_ref, || {
                    let page = KeyValueLeafPage::new(
                        7,
                        Revision(1),
                        SizeClass::K4,
                        false,
                        Arc::clone(&alloc),
                    )
                    .unwrap();
                    page.put_record(0, b"once", None).unwrap();
                    Ok(page)
                })
                .unwrap();
            std::thread::sleep(Duration::from_millis(20));
            guard.guard_count()
        }));
    }
    let counts: Vec<i32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    // While both threads held their guards, the shared page saw both.
    assert!(counts.iter().any(|&c| c == 2), "guards not coalesced: {counts:?}");
    assert_eq!(cache.len(), 1);
    cache.drain();
    assert_eq!(alloc.slices_in_use(), 0);
}

// ---------------------------------------------------------------------------
// Frame reuse detection
// ---------------------------------------------------------------------------

#[test]
fn version_token_detects_frame_reuse() {
    let alloc = SegmentAllocator::new(&pool_conf());
    let page = KeyValueLeafPage::new(1, Revision(3), SizeClass::K4, false, Arc::clone(&alloc))
        .unwrap();
    page.put_record(0, b"raw", None).unwrap();

    // A thread stashes raw state without holding a guard...
    let token = page.version_token();
    assert!(page.check_version(token).is_ok());

    // ...the sweeper resets the frame behind its back...
    page.reset();

    // ...and the stale observer must refetch.
    let err = page.check_version(token).unwrap_err();
    assert!(matches!(
        err,
        pagestore::page::PageError::FrameReused { .. }
    ));
    assert_eq!(alloc.slices_in_use(), 0);
}

// ---------------------------------------------------------------------------
// Segment conservation and teardown
// ---------------------------------------------------------------------------

#[test]
fn segments_quiesce_after_workload() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 13, 1, VersioningType::Incremental).unwrap();
    let alloc = Arc::clone(handle.buffer_manager().allocator());

    for i in 0..8usize {
        commit_records(&handle, &[(i % 4, format!("gen{i}").as_bytes())]);
    }
    {
        let mut txn = handle.begin_read_latest().unwrap();
        txn.fetch(0, 1).unwrap().unwrap();
    }
    // Abandon a writer mid-flight: its drop must reclaim everything it
    // owned.
    {
        let mut txn = handle.begin_write(handle.committed_revision()).unwrap();
        let view = txn.modify(0, 1).unwrap();
        view.put_record(9, b"abandoned", None).unwrap();
    }

    // Drop the page mappings this resource still has, then check the
    // allocator: what the caches do not hold must have been returned.
    let mgr = Arc::clone(handle.buffer_manager());
    drop(handle);
    // If this was the last open resource the pool tore down and drained;
    // otherwise the sweepers retire everything cold. Other tests may still
    // be churning the shared pool, hence the generous deadline.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let cached = mgr.record_page_cache().used_bytes() + mgr.fragment_cache().used_bytes();
        if cached == 0 && alloc.slices_in_use() == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "segments not conserved: {} slices in use, {} cached bytes",
            alloc.slices_in_use(),
            cached
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn write_single_flight_per_resource() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 14, 1, VersioningType::Full).unwrap();
    let txn = handle.begin_write(Revision::BASE).unwrap();
    assert!(matches!(
        handle.begin_write(Revision::BASE),
        Err(pagestore::FetchError::WriteInFlight)
    ));
    drop(txn);
    // Released on drop.
    assert!(handle.begin_write(Revision::BASE).is_ok());
}

#[test]
fn object_caches_serve_index_clients() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 14, 3, VersioningType::Full).unwrap();
    let mgr = handle.buffer_manager();
    let key = (handle.database_id(), handle.resource_id(), 7);

    assert!(mgr.names().get(&key).is_none());
    mgr.names().insert(key, Arc::from("author"));
    assert_eq!(mgr.names().get(&key).as_deref(), Some("author"));

    let ps_key = (handle.database_id(), handle.resource_id(), Revision(1));
    mgr.path_summaries()
        .insert(ps_key, Arc::from(&b"/a/b"[..]));
    assert_eq!(
        mgr.path_summaries().get(&ps_key).as_deref(),
        Some(&b"/a/b"[..])
    );
}

#[test]
fn revision_roots_are_cached_metadata() {
    let dir = camino_tempfile::tempdir().unwrap();
    let handle = open(&dir, 14, 2, VersioningType::Full).unwrap();
    let rev = commit_records(&handle, &[(0, b"x"), (1, b"y")]);
    let root = handle.revision_root(rev).unwrap();
    assert_eq!(root.revision, rev);
    assert_eq!(root.fragments, 1);
    assert!(handle.revision_root(rev.next()).is_none());
    // Second lookup comes from the object cache.
    assert_eq!(handle.revision_root(rev).unwrap(), root);
}
