//! The WAL Index (§3, §4.2): a pure, lock-free data structure mapping
//! `queueId -> prefix -> ordered set of WAL names still owed to that
//! source`. The replication core owns two instances — one for normal
//! sources, one for recovered sources — each guarded by its own lock
//! (§5); this type itself does no locking.

use std::collections::{BTreeMap, BTreeSet};

use utils::id::QueueId;

use crate::wal::{Prefix, WalName};

/// `queueId -> prefix -> ordered WAL names`.
#[derive(Default, Debug)]
pub struct WalIndex {
    by_queue: BTreeMap<QueueId, BTreeMap<Prefix, BTreeSet<WalName>>>,
}

impl WalIndex {
    pub fn new() -> Self {
        WalIndex::default()
    }

    pub fn contains_queue(&self, queue: &QueueId) -> bool {
        self.by_queue.contains_key(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueId> {
        self.by_queue.keys()
    }

    /// Unconditional insert, used by `addSource` seeding and by
    /// `claimQueue` installing a claimed queue's WALs.
    pub fn insert(&mut self, queue: &QueueId, name: WalName) {
        self.by_queue
            .entry(queue.clone())
            .or_default()
            .entry(name.prefix())
            .or_default()
            .insert(name);
    }

    /// Bulk insert, used to install a freshly claimed queue's full WAL
    /// set (§4.7) in one step.
    pub fn insert_all(&mut self, queue: &QueueId, names: impl IntoIterator<Item = WalName>) {
        for name in names {
            self.insert(queue, name);
        }
    }

    /// `preLogRoll`'s per-peer update (§4.4 step 3): if the source
    /// registry is globally empty, this peer's history is discarded
    /// before the new name is recorded (§4.2's "empty shortcut"
    /// invariant) — there is no consumer, so nothing is gained by
    /// remembering WALs nobody will ship. Otherwise the new name is
    /// appended to its prefix's ordered set.
    pub fn record_roll(&mut self, queue: &QueueId, name: WalName, registry_empty: bool) {
        let prefixes = self.by_queue.entry(queue.clone()).or_default();
        if registry_empty {
            prefixes.clear();
        }
        prefixes.entry(name.prefix()).or_default().insert(name);
    }

    /// The WALs under `queue`'s `prefix(log)` group that are `<= log`
    /// (or `< log` if `!inclusive`) — exactly the set `cleanOldLogs`
    /// prunes (§4.5).
    pub fn head_set(&self, queue: &QueueId, log: &WalName, inclusive: bool) -> BTreeSet<WalName> {
        let Some(prefixes) = self.by_queue.get(queue) else {
            return BTreeSet::new();
        };
        let Some(set) = prefixes.get(&log.prefix()) else {
            return BTreeSet::new();
        };
        set.iter()
            .filter(|name| if inclusive { *name <= log } else { *name < log })
            .cloned()
            .collect()
    }

    /// Remove `names` from `queue`'s record of `prefix`, dropping the
    /// prefix's set entirely once it is empty. Used to subtract a
    /// `head_set` snapshot after its storage-side deletion completes.
    pub fn remove_many(&mut self, queue: &QueueId, prefix: &Prefix, names: &BTreeSet<WalName>) {
        let Some(prefixes) = self.by_queue.get_mut(queue) else {
            return;
        };
        if let Some(set) = prefixes.get_mut(prefix) {
            for name in names {
                set.remove(name);
            }
            if set.is_empty() {
                prefixes.remove(prefix);
            }
        }
        if prefixes.is_empty() {
            self.by_queue.remove(queue);
        }
    }

    /// Drop every record for `queue` at once, used when a source is
    /// removed from the registry.
    pub fn remove_queue(&mut self, queue: &QueueId) -> BTreeMap<Prefix, BTreeSet<WalName>> {
        self.by_queue.remove(queue).unwrap_or_default()
    }

    /// A full, cloned snapshot of `queue`'s entries — used by
    /// `refreshSources`/`drainSources` to re-enqueue into a replacement
    /// source, or to capture a point-in-time set before a storage
    /// operation that must run outside the lock.
    pub fn snapshot_queue(&self, queue: &QueueId) -> BTreeMap<Prefix, BTreeSet<WalName>> {
        self.by_queue.get(queue).cloned().unwrap_or_default()
    }

    /// Total WAL count tracked for `queue`, across all prefixes — fed to
    /// the `replication_wals_queued_total` gauge.
    pub fn len_for_queue(&self, queue: &QueueId) -> usize {
        self.by_queue
            .get(queue)
            .map(|p| p.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::id::PeerId;

    fn queue(p: &str) -> QueueId {
        QueueId::normal(PeerId::new(p.to_string()))
    }

    #[test]
    fn head_set_respects_inclusive_flag() {
        let mut idx = WalIndex::new();
        let q = queue("P");
        idx.insert(&q, WalName::from("w.100"));
        idx.insert(&q, WalName::from("w.101"));
        idx.insert(&q, WalName::from("w.102"));

        let inclusive = idx.head_set(&q, &WalName::from("w.101"), true);
        assert_eq!(
            inclusive,
            BTreeSet::from([WalName::from("w.100"), WalName::from("w.101")])
        );

        let exclusive = idx.head_set(&q, &WalName::from("w.101"), false);
        assert_eq!(exclusive, BTreeSet::from([WalName::from("w.100")]));
    }

    #[test]
    fn cleanup_with_exact_newest_name_and_exclusive_is_noop() {
        let mut idx = WalIndex::new();
        let q = queue("P");
        idx.insert(&q, WalName::from("w.100"));
        let result = idx.head_set(&q, &WalName::from("w.100"), false);
        assert!(result.is_empty());
    }

    #[test]
    fn record_roll_clears_history_when_registry_empty() {
        let mut idx = WalIndex::new();
        let q = queue("P");
        idx.insert(&q, WalName::from("w.98"));
        idx.insert(&q, WalName::from("w.99"));

        idx.record_roll(&q, WalName::from("w.100"), true);

        let snapshot = idx.snapshot_queue(&q);
        let wals = snapshot.get(&WalName::from("w.100").prefix()).unwrap();
        assert_eq!(wals, &BTreeSet::from([WalName::from("w.100")]));
    }

    #[test]
    fn record_roll_retains_history_when_registry_nonempty() {
        let mut idx = WalIndex::new();
        let q = queue("P");
        idx.insert(&q, WalName::from("w.100"));
        idx.record_roll(&q, WalName::from("w.101"), false);

        let wals = idx.head_set(&q, &WalName::from("w.101"), true);
        assert_eq!(
            wals,
            BTreeSet::from([WalName::from("w.100"), WalName::from("w.101")])
        );
    }

    #[test]
    fn remove_many_drops_empty_prefix_and_queue_entries() {
        let mut idx = WalIndex::new();
        let q = queue("P");
        idx.insert(&q, WalName::from("w.100"));
        let snap = idx.head_set(&q, &WalName::from("w.100"), true);
        idx.remove_many(&q, &WalName::from("w.100").prefix(), &snap);
        assert!(!idx.contains_queue(&q));
    }
}
