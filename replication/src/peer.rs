//! Peer data model (§3): identity, replication mode, and the
//! sync-replication state machine that gates `drainSources`/`refreshSources`
//! decisions.

use utils::id::PeerId;

/// The retired legacy region-replication endpoint. `addSource` refuses to
/// start a shipper for a peer still pointed at it (§4.1).
pub const LEGACY_REGION_REPLICATION_ENDPOINT: &str = "region-replication-legacy";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    Async,
    Sync,
}

/// Sync-replication state machine (§4.6, §4.7). Only sync-mode peers carry
/// one; async peers are always implicitly "active".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncReplicationState {
    Active,
    TransitioningToStandby,
    Standby,
    /// STANDBY transitioning back up. Distinguished from `Active` because
    /// the failover claimer must *not* refuse a claim made during this
    /// transition (§4.7 step 8), unlike plain `Standby`.
    DowngradingToActive,
}

impl SyncReplicationState {
    /// Whether the peer is in, or moving into, STANDBY — the condition
    /// under which the failover claimer drops a freshly claimed queue
    /// rather than install its recovered source (§4.7 step 8).
    pub fn refuses_recovered_sources(&self) -> bool {
        matches!(
            self,
            SyncReplicationState::Standby | SyncReplicationState::TransitioningToStandby
        )
    }
}

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub peer_id: PeerId,
    pub endpoint: String,
    pub enabled: bool,
    pub mode: ReplicationMode,
    pub remote_wal_dir: Option<camino::Utf8PathBuf>,
    pub sync_state: Option<SyncReplicationState>,
}

impl PeerConfig {
    pub fn new_async(peer_id: impl Into<PeerId>, endpoint: impl Into<String>) -> Self {
        PeerConfig {
            peer_id: peer_id.into(),
            endpoint: endpoint.into(),
            enabled: true,
            mode: ReplicationMode::Async,
            remote_wal_dir: None,
            sync_state: None,
        }
    }

    pub fn new_sync(
        peer_id: impl Into<PeerId>,
        endpoint: impl Into<String>,
        remote_wal_dir: camino::Utf8PathBuf,
    ) -> Self {
        PeerConfig {
            peer_id: peer_id.into(),
            endpoint: endpoint.into(),
            enabled: true,
            mode: ReplicationMode::Sync,
            remote_wal_dir: Some(remote_wal_dir),
            sync_state: Some(SyncReplicationState::Active),
        }
    }

    pub fn is_sync(&self) -> bool {
        self.mode == ReplicationMode::Sync
    }

    pub fn is_legacy_region_replication(&self) -> bool {
        self.endpoint == LEGACY_REGION_REPLICATION_ENDPOINT
    }
}
