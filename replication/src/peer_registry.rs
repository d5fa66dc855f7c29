//! `PeerRegistry` (§1, §3): add/remove/lookup peers and their config.
//! The real system mirrors this from cluster-wide peer metadata (a
//! watcher-fed cache); that propagation is out of scope here (§1) — this
//! is the local, in-process cache the replication core actually reads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use utils::id::PeerId;

use crate::peer::PeerConfig;

/// Peers are kept behind `Arc` so the failover claimer can compare
/// *instance* identity (`Arc::ptr_eq`), not just equal ids, to detect the
/// remove-then-re-add race described in §4.7 step 5.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<PeerConfig>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    /// Returns `true` if `config` was newly registered, `false` if a
    /// peer with this id already existed (§7 item 4: "peer add returns
    /// already-exists -> no-op, no source created").
    pub fn add(&self, config: PeerConfig) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&config.peer_id) {
            return false;
        }
        peers.insert(config.peer_id.clone(), Arc::new(config));
        true
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<Arc<PeerConfig>> {
        self.peers.write().remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerConfig>> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn replace(&self, config: PeerConfig) {
        self.peers
            .write()
            .insert(config.peer_id.clone(), Arc::new(config));
    }

    pub fn all(&self) -> Vec<Arc<PeerConfig>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_a_noop_when_peer_already_exists() {
        let registry = PeerRegistry::new();
        assert!(registry.add(PeerConfig::new_async("P", "host:1")));
        assert!(!registry.add(PeerConfig::new_async("P", "host:2")));
        assert_eq!(registry.get(&PeerId::new("P".to_string())).unwrap().endpoint, "host:1");
    }

    #[test]
    fn remove_then_add_yields_a_new_instance() {
        let registry = PeerRegistry::new();
        registry.add(PeerConfig::new_async("P", "host:1"));
        let first = registry.get(&PeerId::new("P".to_string())).unwrap();
        registry.remove(&PeerId::new("P".to_string()));
        registry.add(PeerConfig::new_async("P", "host:1"));
        let second = registry.get(&PeerId::new("P".to_string())).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
