//! Source Registry (§4.1): the two live-source collections — one normal
//! source per peer, and the list of recovered sources claimed from dead
//! nodes. This module is a plain concurrent container; the orchestration
//! around *which* source replaces which, and in what lock order, lives
//! in [`crate::manager`] since it spans this registry, the WAL Index,
//! and the Latest-Path Table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use utils::id::PeerId;

use crate::source::ReplicationSource;
use crate::wal_index::WalIndex;

/// Recovered sources and their WAL Index share one lock (§5:
/// `walsByIdRecoveredQueues` "piggybacks on `oldsources` mutex"), since
/// every mutator of one also mutates the other.
#[derive(Default)]
struct RecoveredState {
    sources: Vec<Arc<dyn ReplicationSource>>,
    wal_index: WalIndex,
}

#[derive(Default)]
pub struct SourceRegistry {
    normal: RwLock<HashMap<PeerId, Arc<dyn ReplicationSource>>>,
    recovered: Mutex<RecoveredState>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        SourceRegistry::default()
    }

    pub fn insert_normal(&self, source: Arc<dyn ReplicationSource>) {
        self.normal.write().insert(source.peer_id().clone(), source);
    }

    pub fn remove_normal(&self, peer_id: &PeerId) -> Option<Arc<dyn ReplicationSource>> {
        self.normal.write().remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<dyn ReplicationSource>> {
        self.normal.read().get(peer_id).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<dyn ReplicationSource>> {
        self.normal.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.read().is_empty()
    }

    pub fn old_sources(&self) -> Vec<Arc<dyn ReplicationSource>> {
        self.recovered.lock().sources.clone()
    }

    /// Runs `f` with exclusive access to both the recovered source list
    /// and the recovered WAL Index, matching the single combined lock
    /// §5 describes.
    pub fn with_recovered<R>(&self, f: impl FnOnce(&mut Vec<Arc<dyn ReplicationSource>>, &mut WalIndex) -> R) -> R {
        let mut state = self.recovered.lock();
        let RecoveredState { sources, wal_index } = &mut *state;
        f(sources, wal_index)
    }
}
