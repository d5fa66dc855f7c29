//! `QueueStorage` (§3): the durable queue store the replication core
//! depends on. The wire format and the real backing store (ZooKeeper,
//! etcd, a metadata table, ...) are out of scope (§1); this module only
//! fixes the interface the core calls through, plus an in-memory
//! implementation used to exercise that core in tests — and, for now,
//! the only implementation this crate ships, since no concrete external
//! store was specified.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use utils::id::{NodeId, PeerId, QueueId};

use crate::wal::WalName;

/// Per-WAL shipping progress recorded by `setWALPosition`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalProgress {
    pub byte_position: u64,
    pub last_seq_ids: BTreeMap<String, u64>,
}

/// A durable-storage failure. `Cancelled` is the one variant that must
/// *not* escalate to a fatal node abort (§5 "Cancellation", §7 item 2):
/// it means the write lost a race against the owning source being
/// terminated, and the source loop is expected to unwind on its own.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage operation on {queue_id} cancelled: source was terminated")]
    Cancelled { queue_id: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    async fn add_wal(&self, node: &NodeId, queue: &QueueId, wal: &WalName) -> Result<(), StorageError>;

    async fn remove_wal(&self, node: &NodeId, queue: &QueueId, wal: &WalName) -> Result<(), StorageError>;

    async fn set_wal_position(
        &self,
        node: &NodeId,
        queue: &QueueId,
        wal: &WalName,
        progress: WalProgress,
    ) -> Result<(), StorageError>;

    async fn remove_queue(&self, node: &NodeId, queue: &QueueId) -> Result<(), StorageError>;

    /// Atomically move `queue`'s entry from `dead_node` to `this_node`,
    /// returning the new queue id and the WAL names it owned. Any error
    /// here is fatal (§4.7 step 3): the protocol assumes a successful
    /// claim gives this node exclusive ownership.
    async fn claim_queue(
        &self,
        dead_node: &NodeId,
        queue: &QueueId,
        this_node: &NodeId,
    ) -> Result<(QueueId, BTreeSet<WalName>), StorageError>;

    async fn get_all_queues(
        &self,
        node: &NodeId,
    ) -> Result<Vec<(QueueId, BTreeSet<WalName>)>, StorageError>;

    async fn add_peer_to_hfile_refs(&self, peer: &PeerId) -> Result<(), StorageError>;
    async fn remove_peer_from_hfile_refs(&self, peer: &PeerId) -> Result<(), StorageError>;
    async fn remove_hfile_refs(&self, peer: &PeerId, files: &[String]) -> Result<(), StorageError>;
}

pub mod mem {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct State {
        // node -> queue -> wal -> progress
        queues: HashMap<NodeId, HashMap<QueueId, BTreeMap<WalName, WalProgress>>>,
        hfile_ref_peers: BTreeSet<PeerId>,
        /// Queues a test has marked as "owning source was torn down
        /// mid-write" — the next storage call touching them returns
        /// `StorageError::Cancelled` instead of succeeding.
        cancel_next_write: BTreeSet<(NodeId, QueueId)>,
    }

    /// Reference `QueueStorage` used by the manager's tests and by any
    /// deployment with no external metadata store of its own.
    #[derive(Default)]
    pub struct InMemoryQueueStorage {
        state: Mutex<State>,
    }

    impl InMemoryQueueStorage {
        pub fn new() -> Self {
            InMemoryQueueStorage::default()
        }

        /// Test hook: make the next storage write touching `(node,
        /// queue)` fail as if its source had just been terminated.
        pub fn simulate_cancel_on_next_write(&self, node: &NodeId, queue: &QueueId) {
            self.state
                .lock()
                .cancel_next_write
                .insert((node.clone(), queue.clone()));
        }

        pub fn wals_for(&self, node: &NodeId, queue: &QueueId) -> BTreeSet<WalName> {
            self.state
                .lock()
                .queues
                .get(node)
                .and_then(|q| q.get(queue))
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        }

        pub fn progress_of(&self, node: &NodeId, queue: &QueueId, wal: &WalName) -> Option<WalProgress> {
            self.state
                .lock()
                .queues
                .get(node)
                .and_then(|q| q.get(queue))
                .and_then(|m| m.get(wal))
                .cloned()
        }

        pub fn has_queue(&self, node: &NodeId, queue: &QueueId) -> bool {
            self.state
                .lock()
                .queues
                .get(node)
                .map(|q| q.contains_key(queue))
                .unwrap_or(false)
        }

        pub fn hfile_ref_peers(&self) -> BTreeSet<PeerId> {
            self.state.lock().hfile_ref_peers.clone()
        }

        fn check_cancel(state: &mut State, node: &NodeId, queue: &QueueId) -> Result<(), StorageError> {
            if state.cancel_next_write.remove(&(node.clone(), queue.clone())) {
                return Err(StorageError::Cancelled {
                    queue_id: queue.to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl QueueStorage for InMemoryQueueStorage {
        async fn add_wal(&self, node: &NodeId, queue: &QueueId, wal: &WalName) -> Result<(), StorageError> {
            let mut state = self.state.lock();
            Self::check_cancel(&mut state, node, queue)?;
            state
                .queues
                .entry(node.clone())
                .or_default()
                .entry(queue.clone())
                .or_default()
                .entry(wal.clone())
                .or_default();
            Ok(())
        }

        async fn remove_wal(&self, node: &NodeId, queue: &QueueId, wal: &WalName) -> Result<(), StorageError> {
            let mut state = self.state.lock();
            Self::check_cancel(&mut state, node, queue)?;
            if let Some(q) = state.queues.get_mut(node) {
                if let Some(m) = q.get_mut(queue) {
                    m.remove(wal);
                }
            }
            Ok(())
        }

        async fn set_wal_position(
            &self,
            node: &NodeId,
            queue: &QueueId,
            wal: &WalName,
            progress: WalProgress,
        ) -> Result<(), StorageError> {
            let mut state = self.state.lock();
            Self::check_cancel(&mut state, node, queue)?;
            state
                .queues
                .entry(node.clone())
                .or_default()
                .entry(queue.clone())
                .or_default()
                .insert(wal.clone(), progress);
            Ok(())
        }

        async fn remove_queue(&self, node: &NodeId, queue: &QueueId) -> Result<(), StorageError> {
            let mut state = self.state.lock();
            if let Some(q) = state.queues.get_mut(node) {
                q.remove(queue);
            }
            Ok(())
        }

        async fn claim_queue(
            &self,
            dead_node: &NodeId,
            queue: &QueueId,
            this_node: &NodeId,
        ) -> Result<(QueueId, BTreeSet<WalName>), StorageError> {
            let mut state = self.state.lock();
            let wals = state
                .queues
                .get_mut(dead_node)
                .and_then(|q| q.remove(queue))
                .unwrap_or_default();
            let new_queue_id = queue.claimed_from(dead_node);
            let names: BTreeSet<WalName> = wals.keys().cloned().collect();
            state
                .queues
                .entry(this_node.clone())
                .or_default()
                .insert(new_queue_id.clone(), wals);
            Ok((new_queue_id, names))
        }

        async fn get_all_queues(
            &self,
            node: &NodeId,
        ) -> Result<Vec<(QueueId, BTreeSet<WalName>)>, StorageError> {
            let state = self.state.lock();
            Ok(state
                .queues
                .get(node)
                .map(|q| {
                    q.iter()
                        .map(|(qid, wals)| (qid.clone(), wals.keys().cloned().collect()))
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn add_peer_to_hfile_refs(&self, peer: &PeerId) -> Result<(), StorageError> {
            self.state.lock().hfile_ref_peers.insert(peer.clone());
            Ok(())
        }

        async fn remove_peer_from_hfile_refs(&self, peer: &PeerId) -> Result<(), StorageError> {
            self.state.lock().hfile_ref_peers.remove(peer);
            Ok(())
        }

        async fn remove_hfile_refs(&self, _peer: &PeerId, _files: &[String]) -> Result<(), StorageError> {
            Ok(())
        }
    }

}
