//!
//! Revision epoch tracking: who is still reading what.
//!
//! Every read transaction registers the revision it runs at. The minimum
//! across live registrations is the resource's watermark
//! (`min_active_revision`); a cached page whose revision is strictly below it
//! cannot be needed by any snapshot anymore and is fair game for the sweeper.
//!
//! Registration is a CAS into a fixed ring of slots, so the common path takes
//! no lock. When a resource somehow has more concurrent readers than slots,
//! registration falls back to a counted map under a mutex: correctness over
//! speed for the overload case. The watermark is computed on demand by
//! scanning; sweepers poll it once per examined page, nothing keeps it fresh
//! in between.
//!

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use utils::id::{DatabaseId, ResourceId};
use utils::revision::Revision;

/// Concurrent registrations a resource can hold before falling back to the
/// shared map.
const EPOCH_SLOTS: usize = 128;

/// Slot sentinel: no registration.
const EMPTY: i64 = i64::MIN;

/// Per-resource registration state.
pub struct ResourceEpochs {
    slots: [AtomicI64; EPOCH_SLOTS],
    /// Counted fallback for slot exhaustion: revision -> live registrations.
    overflow: Mutex<HashMap<i64, usize>>,
}

impl ResourceEpochs {
    fn new() -> ResourceEpochs {
        ResourceEpochs {
            slots: std::array::from_fn(|_| AtomicI64::new(EMPTY)),
            overflow: Mutex::new(HashMap::new()),
        }
    }

    fn register(self: &Arc<Self>, revision: Revision) -> EpochToken {
        let raw = revision.as_i64();
        debug_assert_ne!(raw, EMPTY);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(EMPTY, raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return EpochToken {
                    epochs: Arc::clone(self),
                    revision: raw,
                    slot: Some(i),
                };
            }
        }
        *self.overflow.lock().entry(raw).or_insert(0) += 1;
        EpochToken {
            epochs: Arc::clone(self),
            revision: raw,
            slot: None,
        }
    }

    fn min_active(&self) -> Revision {
        let mut min = i64::MAX;
        for slot in self.slots.iter() {
            let v = slot.load(Ordering::Acquire);
            if v != EMPTY && v < min {
                min = v;
            }
        }
        let overflow = self.overflow.lock();
        if let Some(&v) = overflow.keys().min() {
            if v < min {
                min = v;
            }
        }
        Revision(min)
    }

    fn deregister(&self, token: &EpochToken) {
        match token.slot {
            Some(i) => {
                let prev = self.slots[i].swap(EMPTY, Ordering::AcqRel);
                debug_assert_eq!(prev, token.revision, "slot was clobbered");
            }
            None => {
                let mut overflow = self.overflow.lock();
                match overflow.get_mut(&token.revision) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        overflow.remove(&token.revision);
                    }
                    None => debug_assert!(false, "deregister without registration"),
                }
            }
        }
    }
}

/// Proof of registration; dropping it deregisters.
pub struct EpochToken {
    epochs: Arc<ResourceEpochs>,
    revision: i64,
    slot: Option<usize>,
}

impl EpochToken {
    pub fn revision(&self) -> Revision {
        Revision(self.revision)
    }
}

impl Drop for EpochToken {
    fn drop(&mut self) {
        self.epochs.deregister(self);
    }
}

///
/// Registry of per-resource epoch state, shared by transactions and sweepers.
///
pub struct RevisionEpochs {
    resources: DashMap<(DatabaseId, ResourceId), Arc<ResourceEpochs>>,
}

impl RevisionEpochs {
    pub fn new() -> RevisionEpochs {
        RevisionEpochs {
            resources: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        database_id: DatabaseId,
        resource_id: ResourceId,
        revision: Revision,
    ) -> EpochToken {
        self.resources
            .entry((database_id, resource_id))
            .or_insert_with(|| Arc::new(ResourceEpochs::new()))
            .clone()
            .register(revision)
    }

    /// The smallest revision any live reader of the resource may still need,
    /// or [`Revision::MAX`] when nobody reads it.
    pub fn min_active_revision(&self, database_id: DatabaseId, resource_id: ResourceId) -> Revision {
        match self.resources.get(&(database_id, resource_id)) {
            Some(entry) => entry.min_active(),
            None => Revision::MAX,
        }
    }

    /// Forget a resource's (necessarily empty) state on close.
    pub fn forget_resource(&self, database_id: DatabaseId, resource_id: ResourceId) {
        self.resources.remove(&(database_id, resource_id));
    }
}

impl Default for RevisionEpochs {
    fn default() -> Self {
        Self::new()
    }
}
