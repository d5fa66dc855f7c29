//! Opaque identifiers shared across the replication crate.
//!
//! Peers, nodes and queues are all ultimately short strings in the real
//! system; we wrap them in newtypes so the compiler keeps us from mixing
//! up e.g. a peer id and a dead node's server name.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The `serverName` of a node in the cluster (this node, or a dead peer
/// node whose queues are being claimed).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::new(s)
    }
}

/// Identifies a peer cluster that this node replicates to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId::new(s)
    }
}

/// Separator used inside a recovered queue id to join the owning peer id
/// and the chain of dead node names it has been claimed through, mirroring
/// the `peerId-deadServer1-deadServer2-...` naming scheme used for
/// replication queue znodes.
const QUEUE_ID_SEP: char = '-';

/// Identity of a WAL queue: either the node's own permanent queue for a
/// peer, or a queue inherited from one or more dead nodes.
///
/// `QueueId::peer_id` is always recoverable from the canonical string
/// form, which is the invariant the durable queue store and the failover
/// claimer both rely on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueId {
    /// `queueId == peerId`, owned by this node for as long as the peer exists.
    Normal(PeerId),
    /// Claimed from one or more dead nodes; `chain` records the lineage,
    /// oldest dead owner first.
    Recovered { peer: PeerId, chain: Vec<NodeId> },
}

impl QueueId {
    pub fn normal(peer: PeerId) -> Self {
        QueueId::Normal(peer)
    }

    /// Build the queue id a recovered source gets when `dead_node`'s copy
    /// of `self` is claimed by this node.
    pub fn claimed_from(&self, dead_node: &NodeId) -> Self {
        let peer = self.peer_id().clone();
        let mut chain = match self {
            QueueId::Normal(_) => Vec::new(),
            QueueId::Recovered { chain, .. } => chain.clone(),
        };
        chain.push(dead_node.clone());
        QueueId::Recovered { peer, chain }
    }

    pub fn peer_id(&self) -> &PeerId {
        match self {
            QueueId::Normal(peer) => peer,
            QueueId::Recovered { peer, .. } => peer,
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, QueueId::Recovered { .. })
    }

    /// Parse the peer id out of a queue id's canonical string form without
    /// needing a fully reconstructed `QueueId`. Used by the failover
    /// claimer, which only has the raw znode name.
    /// Parses the leading `peerId` component out of a queue id's canonical
    /// *display* string. Note that since node names may themselves contain
    /// `QUEUE_ID_SEP`, the canonical string is **not** losslessly parseable
    /// back into a full `QueueId` — callers that need the complete
    /// recovered chain (e.g. the failover claimer) must carry a `QueueId`
    /// value through, rather than round-trip it via this string form.
    pub fn parse_peer_id(canonical: &str) -> PeerId {
        match canonical.split_once(QUEUE_ID_SEP) {
            Some((peer, _rest)) => PeerId::new(peer.to_string()),
            None => PeerId::new(canonical.to_string()),
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueId::Normal(peer) => write!(f, "{peer}"),
            QueueId::Recovered { peer, chain } => {
                write!(f, "{peer}")?;
                for node in chain {
                    write!(f, "{QUEUE_ID_SEP}{node}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_recoverable_from_normal_queue() {
        let q = QueueId::normal(PeerId::new("p1".to_string()));
        assert_eq!(QueueId::parse_peer_id(&q.to_string()), PeerId::new("p1".to_string()));
    }

    #[test]
    fn peer_id_recoverable_from_recovered_queue() {
        let q = QueueId::normal(PeerId::new("p1".to_string()))
            .claimed_from(&NodeId::new("dead-1".to_string()));
        assert_eq!(q.to_string(), "p1-dead-1");
        assert_eq!(QueueId::parse_peer_id(&q.to_string()), PeerId::new("p1".to_string()));
        assert!(q.is_recovered());
    }

    #[test]
    fn chained_claim_keeps_lineage() {
        let q = QueueId::normal(PeerId::new("p1".to_string()))
            .claimed_from(&NodeId::new("dead-1".to_string()))
            .claimed_from(&NodeId::new("dead-2".to_string()));
        assert_eq!(q.to_string(), "p1-dead-1-dead-2");
    }
}
