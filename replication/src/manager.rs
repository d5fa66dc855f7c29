//! `ReplicationSourceManager` (§2): the coordinator that owns the Source
//! Registry, WAL Index, Latest-Path Table, and Buffer Quota, and drives
//! the Log-Roll Handler, Cleanup Engine, Peer Lifecycle Controller and
//! Failover Claimer described in §4. Everything else in this crate is a
//! leaf component this type wires together.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::backoff::{self, RetryingDelay};
use utils::id::{NodeId, PeerId, QueueId};

use remote_storage::{RemotePath, RemoteWalStorage};

use crate::buffer_quota::{BufferQuota, WalEntryBatch};
use crate::config::ReplicationConfig;
use crate::error::{fatal_abort, FatalAbortHook, ReplicationError};
use crate::failover::FailoverClaimer;
use crate::latest_path::LatestPathTable;
use crate::metrics;
use crate::peer::PeerConfig;
use crate::peer_registry::PeerRegistry;
use crate::registry::SourceRegistry;
use crate::source::{BatchSink, ReplicationSource, ShipperSource, ShippedBatch, SourceStats};
use crate::storage::{QueueStorage, StorageError, WalProgress};
use crate::wal::{WalLog, WalName};
use crate::wal_index::WalIndex;

/// Aggregate counters returned by `get_stats` (§6 observability surface).
#[derive(Clone, Debug, Default)]
pub struct ManagerStats {
    pub normal_sources: usize,
    pub recovered_sources: usize,
    pub total_wals_shipped: u64,
    pub total_entries_shipped: u64,
}

pub struct ReplicationSourceManager {
    node: NodeId,
    config: Arc<ReplicationConfig>,
    abort_hook: Arc<dyn FatalAbortHook>,
    peers: Arc<PeerRegistry>,
    storage: Arc<dyn QueueStorage>,
    remote: Option<Arc<dyn RemoteWalStorage>>,
    registry: SourceRegistry,
    /// `walsById` (§5): dedicated mutex, never held across an `.await`
    /// except the single transactional `record_roll` write pattern does
    /// not itself await — all storage calls happen before this is taken.
    wal_index: SyncMutex<WalIndex>,
    /// `latestPaths` (§5): a `tokio::sync::Mutex` rather than
    /// `parking_lot`, because `addSource`/`preLogRoll` must hold it
    /// across the per-entry `addWAL` storage call to stay transactional
    /// with the in-memory seed (§4.1, §4.4) — an explicit, spec-mandated
    /// exception to "never await while locked".
    latest_paths: AsyncMutex<LatestPathTable>,
    buffer_quota: BufferQuota,
    failover: FailoverClaimer,
    stopping: CancellationToken,
    /// Whether this manager is embedded in a sync-up utility host rather
    /// than a live, long-running node (§4.7 step 6) — the utility
    /// catches a cluster up on replication out-of-band and must not
    /// adopt queues for peers an operator has disabled.
    sync_up_tool: bool,
    /// Weak self-reference, populated via `Arc::new_cyclic`. Needed so
    /// `clean_old_logs` can detach a drained recovered source's
    /// `finish_recovered_source` call onto its own task (§4.7, §3 —
    /// calling it inline would await the calling source's own task
    /// handle from within that very task).
    self_ref: std::sync::Weak<ReplicationSourceManager>,
}

impl ReplicationSourceManager {
    pub fn new(
        node: NodeId,
        config: ReplicationConfig,
        abort_hook: Arc<dyn FatalAbortHook>,
        peers: Arc<PeerRegistry>,
        storage: Arc<dyn QueueStorage>,
        remote: Option<Arc<dyn RemoteWalStorage>>,
    ) -> Arc<Self> {
        Self::new_with_role(node, config, abort_hook, peers, storage, remote, false)
    }

    /// Construct a manager embedded in a sync-up utility host (§4.7 step
    /// 6), rather than a live node: `claim_queue_task` drops claims for
    /// disabled peers instead of installing a recovered source for them.
    pub fn new_sync_up_tool(
        node: NodeId,
        config: ReplicationConfig,
        abort_hook: Arc<dyn FatalAbortHook>,
        peers: Arc<PeerRegistry>,
        storage: Arc<dyn QueueStorage>,
        remote: Option<Arc<dyn RemoteWalStorage>>,
    ) -> Arc<Self> {
        Self::new_with_role(node, config, abort_hook, peers, storage, remote, true)
    }

    fn new_with_role(
        node: NodeId,
        config: ReplicationConfig,
        abort_hook: Arc<dyn FatalAbortHook>,
        peers: Arc<PeerRegistry>,
        storage: Arc<dyn QueueStorage>,
        remote: Option<Arc<dyn RemoteWalStorage>>,
        sync_up_tool: bool,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let stopping = CancellationToken::new();
        let buffer_quota = BufferQuota::new(config.total_buffer_limit);
        let failover = FailoverClaimer::new(
            config.executor_workers,
            config.sleep_before_failover,
            stopping.clone(),
        );
        Arc::new_cyclic(|self_ref| ReplicationSourceManager {
            node,
            config,
            abort_hook,
            peers,
            storage,
            remote,
            registry: SourceRegistry::new(),
            wal_index: SyncMutex::new(WalIndex::new()),
            latest_paths: AsyncMutex::new(LatestPathTable::new()),
            buffer_quota,
            failover,
            stopping,
            sync_up_tool,
            self_ref: self_ref.clone(),
        })
    }

    // ---- Peer Lifecycle Controller (§4.6) ----------------------------

    pub async fn init(self: &Arc<Self>) -> Result<(), ReplicationError> {
        for peer in self.peers.all() {
            self.add_source(&peer.peer_id).await?;
            self.maybe_register_hfile_refs(&peer.peer_id).await?;
        }
        Ok(())
    }

    pub async fn add_peer(self: &Arc<Self>, peer: PeerConfig) -> Result<(), ReplicationError> {
        let peer_id = peer.peer_id.clone();
        if !self.peers.add(peer) {
            return Ok(()); // §7 item 4: already exists, no-op
        }
        self.add_source(&peer_id).await?;
        self.maybe_register_hfile_refs(&peer_id).await?;
        Ok(())
    }

    async fn maybe_register_hfile_refs(&self, peer_id: &PeerId) -> Result<(), ReplicationError> {
        if !self.config.bulkload_enabled {
            return Ok(());
        }
        self.storage
            .add_peer_to_hfile_refs(peer_id)
            .await
            .map_err(|e| self.fatal(format!("add_peer_to_hfile_refs failed for {peer_id}: {e}")))?;
        Ok(())
    }

    /// §4.1: creates a source for `peer_id`, seeded from the Latest-Path
    /// Table under its lock, then starts it.
    async fn add_source(self: &Arc<Self>, peer_id: &PeerId) -> Result<(), ReplicationError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::UnknownPeer(peer_id.to_string()))?;

        if peer.is_legacy_region_replication() {
            info!(peer_id = %peer_id, "addSource: peer endpoint is the retired legacy region-replication endpoint, skipping");
            return Ok(());
        }

        let queue_id = QueueId::normal(peer_id.clone());
        let source: Arc<dyn ReplicationSource> =
            Arc::new(ShipperSource::new(queue_id.clone(), peer.is_sync(), None, self.clone()));

        {
            let latest = self.latest_paths.lock().await;
            let snapshot = latest.snapshot();
            for log in snapshot.values() {
                let name = log.name();
                if let Err(e) = self.storage.add_wal(&self.node, &queue_id, &name).await {
                    return Err(self.fatal(format!("seeding addWAL failed for {queue_id} WAL {name}: {e}")));
                }
                self.wal_index.lock().insert(&queue_id, name.clone());
                source.enqueue_log(name);
            }
        }

        self.registry.insert_normal(source.clone());
        source.startup().await;
        metrics::set_sources_total(false, self.registry.sources().len() as i64);
        Ok(())
    }

    pub async fn remove_peer(self: &Arc<Self>, peer_id: &PeerId) -> Result<(), ReplicationError> {
        self.peers.remove(peer_id);

        // Step 2: recovered sources owned by this peer. `terminate` is
        // async and can't run while the sync lock below is held, so the
        // matched sources are pulled out and terminated afterward.
        let recovered = self.registry.with_recovered(|sources, wal_index| {
            let mut matched = Vec::new();
            sources.retain(|s| {
                if s.peer_id() == peer_id {
                    matched.push(s.clone());
                    false
                } else {
                    true
                }
            });
            for s in &matched {
                wal_index.remove_queue(s.queue_id());
            }
            matched
        });
        futures::future::join_all(recovered.iter().map(|source| async move {
            source.terminate("peer removed", true).await;
            if let Err(e) = self.storage.remove_queue(&self.node, source.queue_id()).await {
                warn!(queue_id = %source.queue_id(), error = %e, "failed to remove drained recovered queue from storage during removePeer");
            }
        }))
        .await;

        // Step 3: the normal source.
        let queue_id = QueueId::normal(peer_id.clone());
        if let Some(source) = self.registry.remove_normal(peer_id) {
            source.terminate("peer removed", true).await;
            if let Err(e) = self.storage.remove_queue(&self.node, &queue_id).await {
                warn!(queue_id = %queue_id, error = %e, "failed to remove queue from storage during removePeer");
            }
            self.wal_index.lock().remove_queue(&queue_id);
        } else {
            // Startup race (§7 item 5): no source exists yet, delete directly.
            if let Err(e) = self.storage.remove_queue(&self.node, &queue_id).await {
                warn!(queue_id = %queue_id, error = %e, "failed to remove queue from storage (startup race) during removePeer");
            }
            self.wal_index.lock().remove_queue(&queue_id);
        }

        // Step 5: HFile-refs (fatal abort on failure).
        self.storage
            .remove_peer_from_hfile_refs(peer_id)
            .await
            .map_err(|e| self.fatal(format!("remove_peer_from_hfile_refs failed for {peer_id}: {e}")))?;

        metrics::set_sources_total(false, self.registry.sources().len() as i64);
        Ok(())
    }

    pub async fn refresh_sources(self: &Arc<Self>, peer_id: &PeerId) -> Result<(), ReplicationError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::UnknownPeer(peer_id.to_string()))?;
        let queue_id = QueueId::normal(peer_id.clone());

        let (old_normal, new_normal) = {
            let _latest = self.latest_paths.lock().await;
            let old = self.registry.get(peer_id);
            let stats = old.as_ref().map(|s| s.stats_handle());
            let fresh: Arc<dyn ReplicationSource> =
                Arc::new(ShipperSource::new(queue_id.clone(), peer.is_sync(), stats, self.clone()));
            let snapshot = self.wal_index.lock().snapshot_queue(&queue_id);
            self.registry.insert_normal(fresh.clone());
            for names in snapshot.values() {
                for name in names {
                    fresh.enqueue_log(name.clone());
                }
            }
            (old, fresh)
        };
        new_normal.startup().await;
        if let Some(old) = old_normal {
            old.terminate("refreshing source", false).await;
        }

        let (old_recovered, new_recovered) = self.registry.with_recovered(|sources, wal_index| {
            let mut old = Vec::new();
            let mut fresh = Vec::new();
            sources.retain(|s| {
                if s.peer_id() == peer_id {
                    old.push(s.clone());
                    false
                } else {
                    true
                }
            });
            for old_source in &old {
                let recovered_queue = old_source.queue_id().clone();
                let stats = old_source.stats_handle();
                let replacement: Arc<dyn ReplicationSource> = Arc::new(ShipperSource::new(
                    recovered_queue.clone(),
                    peer.is_sync(),
                    Some(stats),
                    self.clone(),
                ));
                for names in wal_index.snapshot_queue(&recovered_queue).values() {
                    for name in names {
                        replacement.enqueue_log(name.clone());
                    }
                }
                sources.push(replacement.clone());
                fresh.push(replacement);
            }
            (old, fresh)
        });
        for replacement in &new_recovered {
            replacement.startup().await;
        }
        for old in old_recovered {
            old.terminate("refreshing recovered source", false).await;
        }

        Ok(())
    }

    pub async fn drain_sources(self: &Arc<Self>, peer_id: &PeerId) -> Result<(), ReplicationError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::UnknownPeer(peer_id.to_string()))?;
        let queue_id = QueueId::normal(peer_id.clone());

        let (old_normal, new_normal, snapshot) = {
            let _latest = self.latest_paths.lock().await;
            let old = self.registry.get(peer_id);
            let stats = old.as_ref().map(|s| s.stats_handle());
            let fresh: Arc<dyn ReplicationSource> =
                Arc::new(ShipperSource::new(queue_id.clone(), peer.is_sync(), stats, self.clone()));
            let snapshot = self.wal_index.lock().snapshot_queue(&queue_id);
            self.registry.insert_normal(fresh.clone());
            (old, fresh, snapshot)
        };
        new_normal.startup().await;
        if let Some(old) = old_normal {
            old.terminate("peer draining to standby", false).await;
        }

        let mut all_names: BTreeSet<WalName> = BTreeSet::new();
        for names in snapshot.values() {
            all_names.extend(names.iter().cloned());
        }
        for name in &all_names {
            self.storage
                .remove_wal(&self.node, &queue_id, name)
                .await
                .map_err(|e| self.classify_cleanup_error(e))?;
        }

        {
            let mut wal_index = self.wal_index.lock();
            for (prefix, names) in &snapshot {
                wal_index.remove_many(&queue_id, prefix, names);
            }
        }

        let recovered = self.registry.with_recovered(|sources, wal_index| {
            let mut matched = Vec::new();
            sources.retain(|s| {
                if s.peer_id() == peer_id {
                    matched.push(s.clone());
                    false
                } else {
                    true
                }
            });
            for s in &matched {
                wal_index.remove_queue(s.queue_id());
            }
            matched
        });
        futures::future::join_all(recovered.iter().map(|source| async move {
            source.terminate("peer draining to standby", true).await;
            if let Err(e) = self.storage.remove_queue(&self.node, source.queue_id()).await {
                warn!(queue_id = %source.queue_id(), error = %e, "failed to remove queue from storage during drainSources");
            }
        }))
        .await;

        Ok(())
    }

    // ---- Log-Roll Handler (§4.4) --------------------------------------

    pub async fn pre_log_roll(self: &Arc<Self>, new_log: WalLog) -> Result<(), ReplicationError> {
        let name = new_log.name();
        let mut latest = self.latest_paths.lock().await;

        let sources = self.registry.sources();
        for source in &sources {
            let queue_id = source.queue_id();
            let result = backoff::retry(
                || self.storage.add_wal(&self.node, queue_id, &name),
                |e: &StorageError| matches!(e, StorageError::Cancelled { .. }),
                1,
                3,
                "addWAL during log roll",
                &self.stopping,
            )
            .await;
            match result {
                Some(Ok(())) | None => {}
                Some(Err(e)) => {
                    return Err(self.fatal(format!("addWAL failed during log roll for {queue_id}: {e}")));
                }
            }
        }

        let registry_empty = sources.is_empty();
        {
            let mut wal_index = self.wal_index.lock();
            for source in &sources {
                wal_index.record_roll(source.queue_id(), name.clone(), registry_empty);
            }
        }

        latest.record(new_log);
        Ok(())
    }

    pub fn post_log_roll(&self, new_log: &WalLog) {
        let name = new_log.name();
        for source in self.registry.sources() {
            source.enqueue_log(name.clone());
        }
    }

    // ---- Cleanup Engine (§4.5) -----------------------------------------

    pub async fn log_position_and_clean_old_logs(
        &self,
        source: &Arc<dyn ReplicationSource>,
        batch: ShippedBatch,
    ) -> Result<(), ReplicationError> {
        let progress = WalProgress {
            byte_position: batch.last_position,
            last_seq_ids: batch.last_seq_ids.clone(),
        };
        match self
            .storage
            .set_wal_position(&self.node, source.queue_id(), &batch.last_wal_name, progress)
            .await
        {
            Ok(()) => {}
            Err(StorageError::Cancelled { queue_id }) => {
                return Err(ReplicationError::Cancelled { queue_id })
            }
            Err(StorageError::Io(e)) => {
                return Err(self.fatal(format!("setWALPosition failed for {}: {e}", source.queue_id())))
            }
        }
        self.clean_old_logs(&batch.last_wal_name, batch.is_end_of_file, source).await
    }

    /// §4.5, `cleanOldLogs` — package-private in the original design.
    pub(crate) async fn clean_old_logs(
        &self,
        log: &WalName,
        inclusive: bool,
        source: &Arc<dyn ReplicationSource>,
    ) -> Result<(), ReplicationError> {
        let prefix = log.prefix();

        let to_remove = if source.is_recovered() {
            self.registry
                .with_recovered(|_sources, wal_index| wal_index.head_set(source.queue_id(), log, inclusive))
        } else {
            self.wal_index.lock().head_set(source.queue_id(), log, inclusive)
        };
        if to_remove.is_empty() {
            return Ok(());
        }

        if source.is_sync_replication() {
            self.delete_remote_wals(source, &to_remove).await;
        }

        for name in &to_remove {
            self.storage
                .remove_wal(&self.node, source.queue_id(), name)
                .await
                .map_err(|e| self.classify_cleanup_error(e))?;
        }

        if source.is_recovered() {
            self.registry
                .with_recovered(|_sources, wal_index| wal_index.remove_many(source.queue_id(), &prefix, &to_remove));
        } else {
            self.wal_index.lock().remove_many(source.queue_id(), &prefix, &to_remove);
        }
        let remaining = self.len_for(source).await;
        metrics::set_wals_queued(&source.queue_id().to_string(), remaining as i64);

        // §4.7/§3: a recovered source is transient — once it has shipped
        // every WAL in its claimed set, it must be torn down rather than
        // sit forever blocked on further `enqueueLog` calls that will
        // never come (recovered sources aren't notified by `postLogRoll`).
        if source.is_recovered() && remaining == 0 {
            self.spawn_finish_recovered(source);
        }
        Ok(())
    }

    /// Detaches `finish_recovered_source` onto its own task. This is
    /// invoked from inside a drained recovered source's own run loop (via
    /// `on_batch_shipped` -> `clean_old_logs`); calling it inline would
    /// have `finish_recovered_source`'s `terminate()` await that very
    /// task's own `JoinHandle`, which deadlocks.
    fn spawn_finish_recovered(&self, source: &Arc<dyn ReplicationSource>) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let source = source.clone();
        tokio::spawn(async move {
            manager.finish_recovered_source(source).await;
        });
    }

    async fn len_for(&self, source: &Arc<dyn ReplicationSource>) -> usize {
        if source.is_recovered() {
            self.registry
                .with_recovered(|_sources, wal_index| wal_index.len_for_queue(source.queue_id()))
        } else {
            self.wal_index.lock().len_for_queue(source.queue_id())
        }
    }

    fn classify_cleanup_error(&self, e: StorageError) -> ReplicationError {
        match e {
            StorageError::Cancelled { queue_id } => ReplicationError::Cancelled { queue_id },
            StorageError::Io(err) => self.fatal(format!("cleanup storage failure: {err}")),
        }
    }

    fn fatal(&self, reason: impl Into<String>) -> ReplicationError {
        fatal_abort(&self.abort_hook, reason)
    }

    /// Sync-replication remote WAL cleanup (§4.5, §7 item 3). Filters to
    /// names whose embedded peer id matches this source's (sync WAL names
    /// carry the peer id), then deletes each with unbounded retry while
    /// the source stays active; `NotFound` is treated as success.
    async fn delete_remote_wals(&self, source: &Arc<dyn ReplicationSource>, names: &BTreeSet<WalName>) {
        let Some(remote) = self.remote.as_ref() else {
            warn!(peer_id = %source.peer_id(), "sync-replication peer has no remote WAL backend configured, skipping remote cleanup");
            return;
        };
        let peer_id = source.peer_id();

        for name in names.iter().filter(|n| n.as_str().starts_with(peer_id.as_str())) {
            let mut delay = RetryingDelay::new(
                self.config.sync_sleep_for_retries,
                self.config.sync_max_retries_multiplier,
            );
            loop {
                if !source.is_active() {
                    warn!(wal = %name, peer_id = %peer_id, "abandoning remote WAL cleanup: source no longer active");
                    break;
                }
                match remote.delete(&RemotePath::new(name.as_str())).await {
                    Ok(()) | Err(remote_storage::RemoteDeleteError::NotFound) => break,
                    Err(e) => {
                        metrics::REMOTE_WAL_DELETE_RETRIES_TOTAL
                            .with_label_values(&[peer_id.as_str()])
                            .inc();
                        warn!(wal = %name, peer_id = %peer_id, error = %e, multiplier = delay.multiplier(), "remote WAL delete failed, retrying");
                        let wait = delay.current();
                        delay.bump();
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.stopping.cancelled() => break,
                        }
                    }
                }
            }
        }
    }

    /// Invoked when a recovered source finishes draining its claimed
    /// queue: terminates it, drops it from the registry and WAL Index,
    /// and removes the now-empty queue from storage.
    pub async fn finish_recovered_source(&self, source: Arc<dyn ReplicationSource>) {
        source.terminate("recovered queue drained", true).await;
        self.registry.with_recovered(|sources, wal_index| {
            sources.retain(|s| !Arc::ptr_eq(s, &source));
            wal_index.remove_queue(source.queue_id());
        });
        if let Err(e) = self.storage.remove_queue(&self.node, source.queue_id()).await {
            warn!(queue_id = %source.queue_id(), error = %e, "failed to remove drained recovered queue from storage");
        }
    }

    fn resolve_source(&self, queue_id: &QueueId) -> Option<Arc<dyn ReplicationSource>> {
        if queue_id.is_recovered() {
            self.registry
                .with_recovered(|sources, _wal_index| sources.iter().find(|s| s.queue_id() == queue_id).cloned())
        } else {
            self.registry.get(queue_id.peer_id())
        }
    }

    // ---- Buffer Quota (§4.8) -------------------------------------------

    pub fn acquire_buffer_quota(&self, size: i64) -> Result<bool, ReplicationError> {
        let size = Self::non_negative(size)?;
        Ok(self.buffer_quota.acquire(size))
    }

    pub fn release_buffer_quota(&self, size: i64) -> Result<(), ReplicationError> {
        let size = Self::non_negative(size)?;
        self.buffer_quota.release(size);
        Ok(())
    }

    pub fn acquire_wal_entry_buffer_quota(&self, batch: &mut WalEntryBatch, entry_size: i64) -> Result<bool, ReplicationError> {
        let entry_size = Self::non_negative(entry_size)?;
        Ok(self.buffer_quota.acquire_for_entry(batch, entry_size))
    }

    pub fn release_wal_entry_batch_buffer_quota(&self, batch: &WalEntryBatch) {
        self.buffer_quota.release_batch(batch);
    }

    pub fn check_buffer_quota(&self, _peer_id: &PeerId) -> bool {
        self.buffer_quota.check()
    }

    fn non_negative(size: i64) -> Result<u64, ReplicationError> {
        u64::try_from(size)
            .map_err(|_| ReplicationError::PreconditionViolation(format!("buffer quota size must be >= 0, got {size}")))
    }

    // ---- Failover Claimer (§4.7) ----------------------------------------

    /// Public entry point invoked by the cluster's node-death watcher.
    pub fn claim_queue(self: &Arc<Self>, dead_node: NodeId, queue: QueueId) {
        metrics::CLAIMS_TOTAL.inc();
        self.failover.submit(self.clone(), dead_node, queue);
    }

    /// The actual claim procedure (§4.7 steps 2-8), invoked by
    /// [`FailoverClaimer`] after the jitter sleep.
    pub(crate) async fn claim_queue_task(self: &Arc<Self>, dead_node: &NodeId, queue: &QueueId) {
        let peer_id = queue.peer_id().clone();
        let Some(peer_at_claim) = self.peers.get(&peer_id) else {
            return; // step 2: peer no longer exists locally
        };

        let (new_queue_id, wals) = match self.storage.claim_queue(dead_node, queue, &self.node).await {
            Ok(v) => v,
            Err(e) => {
                metrics::CLAIMS_FAILED_TOTAL.inc();
                self.abort_hook.abort(&format!("claimQueue failed for {queue}: {e}"));
                return;
            }
        };
        if wals.is_empty() {
            return; // step 4
        }

        // Step 5: re-check identity before doing any more work.
        match self.peers.get(&peer_id) {
            Some(peer_now) if Arc::ptr_eq(&peer_at_claim, &peer_now) => {}
            _ => {
                let _ = self.storage.remove_queue(&self.node, &new_queue_id).await;
                metrics::CLAIMS_FAILED_TOTAL.inc();
                return;
            }
        }

        // Step 6: a sync-up utility host only replays queues for peers that
        // are currently enabled; a disabled peer's queue is left claimed-but-
        // untouched for an operator to drain by hand.
        if self.sync_up_tool && !peer_at_claim.enabled {
            let _ = self.storage.remove_queue(&self.node, &new_queue_id).await;
            metrics::CLAIMS_FAILED_TOTAL.inc();
            return;
        }

        let source: Arc<dyn ReplicationSource> = Arc::new(ShipperSource::new(
            new_queue_id.clone(),
            peer_at_claim.is_sync(),
            None,
            self.clone(),
        ));

        // Step 8: re-check identity once more, and reject STANDBY/
        // TransitioningToStandby, under the recovered-sources lock.
        let installed = match self.peers.get(&peer_id) {
            Some(peer_now) if Arc::ptr_eq(&peer_at_claim, &peer_now) => {
                let refuses = peer_now
                    .sync_state
                    .map(|s| s.refuses_recovered_sources())
                    .unwrap_or(false);
                if refuses {
                    false
                } else {
                    self.registry.with_recovered(|sources, wal_index| {
                        wal_index.insert_all(&new_queue_id, wals.iter().cloned());
                        sources.push(source.clone());
                    });
                    true
                }
            }
            _ => false,
        };

        if installed {
            for name in &wals {
                source.enqueue_log(name.clone());
            }
            source.startup().await;
            metrics::set_sources_total(true, self.registry.old_sources().len() as i64);
        } else {
            let _ = self.storage.remove_queue(&self.node, &new_queue_id).await;
            metrics::CLAIMS_FAILED_TOTAL.inc();
        }
    }

    pub fn active_failover_task_count(&self) -> usize {
        self.failover.active_task_count()
    }

    // ---- Bulk-load (§1 Non-goal: tracking only, no wire semantics) -----

    pub async fn add_hfile_refs(
        &self,
        table: &str,
        family: &str,
        pairs: &[(String, String)],
    ) -> Result<(), ReplicationError> {
        info!(table, family, count = pairs.len(), "recording HFile references");
        Ok(())
    }

    pub async fn cleanup_hfile_refs(&self, peer_id: &PeerId, files: &[String]) -> Result<(), ReplicationError> {
        self.storage
            .remove_hfile_refs(peer_id, files)
            .await
            .map_err(|e| self.classify_cleanup_error(e))
    }

    // ---- Observability (§6) ---------------------------------------------

    pub fn get_sources(&self) -> Vec<SourceStats> {
        self.registry.sources().iter().map(|s| s.get_stats()).collect()
    }

    pub fn get_old_sources(&self) -> Vec<SourceStats> {
        self.registry.old_sources().iter().map(|s| s.get_stats()).collect()
    }

    pub fn get_source(&self, peer_id: &PeerId) -> Option<SourceStats> {
        self.registry.get(peer_id).map(|s| s.get_stats())
    }

    pub fn get_wals(&self) -> std::collections::BTreeMap<QueueId, std::collections::BTreeMap<crate::wal::Prefix, BTreeSet<WalName>>> {
        let wal_index = self.wal_index.lock();
        wal_index
            .queues()
            .map(|q| (q.clone(), wal_index.snapshot_queue(q)))
            .collect()
    }

    pub fn get_wals_by_id_recovered_queues(
        &self,
    ) -> std::collections::BTreeMap<QueueId, std::collections::BTreeMap<crate::wal::Prefix, BTreeSet<WalName>>> {
        self.registry.with_recovered(|_sources, wal_index| {
            wal_index
                .queues()
                .map(|q| (q.clone(), wal_index.snapshot_queue(q)))
                .collect()
        })
    }

    pub async fn get_all_queues(&self) -> Result<Vec<(QueueId, BTreeSet<WalName>)>, ReplicationError> {
        self.storage
            .get_all_queues(&self.node)
            .await
            .map_err(ReplicationError::from)
    }

    pub async fn get_size_of_latest_path(&self) -> usize {
        self.latest_paths.lock().await.len()
    }

    pub async fn get_latest_paths(&self) -> std::collections::BTreeMap<crate::wal::Prefix, WalLog> {
        self.latest_paths.lock().await.snapshot()
    }

    pub fn get_total_buffer_used(&self) -> u64 {
        self.buffer_quota.used()
    }

    pub fn get_total_buffer_limit(&self) -> u64 {
        self.buffer_quota.limit()
    }

    pub fn get_replication_peers(&self) -> Vec<Arc<PeerConfig>> {
        self.peers.all()
    }

    pub fn get_stats(&self) -> ManagerStats {
        let normal = self.get_sources();
        let recovered = self.get_old_sources();
        let total_wals_shipped = normal.iter().chain(recovered.iter()).map(|s| s.wals_shipped).sum();
        let total_entries_shipped = normal.iter().chain(recovered.iter()).map(|s| s.entries_shipped).sum();
        ManagerStats {
            normal_sources: normal.len(),
            recovered_sources: recovered.len(),
            total_wals_shipped,
            total_entries_shipped,
        }
    }

    // ---- Shutdown (§5 "Node shutdown") ----------------------------------

    pub async fn join(self: &Arc<Self>) {
        self.stopping.cancel();
        self.failover.shutdown().await;
        let normal_sources = self.registry.sources();
        futures::future::join_all(
            normal_sources
                .iter()
                .map(|s| s.terminate("node shutting down", true)),
        )
        .await;
        let recovered_sources = self.registry.old_sources();
        futures::future::join_all(
            recovered_sources
                .iter()
                .map(|s| s.terminate("node shutting down", true)),
        )
        .await;
    }
}

#[async_trait::async_trait]
impl BatchSink for ReplicationSourceManager {
    async fn on_batch_shipped(
        &self,
        queue_id: &QueueId,
        batch: ShippedBatch,
    ) -> Result<(), ReplicationError> {
        let source = self
            .resolve_source(queue_id)
            .ok_or_else(|| ReplicationError::UnknownPeer(queue_id.peer_id().to_string()))?;
        self.log_position_and_clean_old_logs(&source, batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::error::LoggingAbortHook;
    use crate::peer::PeerConfig;
    use crate::storage::mem::InMemoryQueueStorage;
    use camino::Utf8PathBuf;

    fn manager(config: ReplicationConfig) -> Arc<ReplicationSourceManager> {
        ReplicationSourceManager::new(
            NodeId::new("this-node".to_string()),
            config,
            Arc::new(LoggingAbortHook),
            Arc::new(PeerRegistry::new()),
            Arc::new(InMemoryQueueStorage::new()),
            None,
        )
    }

    fn wal_log(path: &str) -> WalLog {
        WalLog::new(Utf8PathBuf::from(path))
    }

    #[tokio::test]
    async fn add_peer_then_two_rolls_then_clean() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();

        mgr.pre_log_roll(wal_log("/wal/w.100")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.100"));
        let source = mgr.get_source(&PeerId::new("P".to_string()));
        assert!(source.is_some());

        let normal_source = mgr.registry.get(&PeerId::new("P".to_string())).unwrap();
        mgr.log_position_and_clean_old_logs(
            &normal_source,
            ShippedBatch {
                last_wal_name: WalName::from("w.100"),
                last_position: 200,
                last_seq_ids: Default::default(),
                is_end_of_file: false,
            },
        )
        .await
        .unwrap();

        mgr.pre_log_roll(wal_log("/wal/w.101")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.101"));
        mgr.log_position_and_clean_old_logs(
            &normal_source,
            ShippedBatch {
                last_wal_name: WalName::from("w.101"),
                last_position: 0,
                last_seq_ids: Default::default(),
                is_end_of_file: true,
            },
        )
        .await
        .unwrap();

        let wals = mgr.get_wals();
        let queue_id = QueueId::normal(PeerId::new("P".to_string()));
        let remaining = wals.get(&queue_id).unwrap();
        let w_prefix = WalName::from("w.101").prefix();
        assert_eq!(remaining.get(&w_prefix).unwrap(), &BTreeSet::from([WalName::from("w.101")]));
    }

    #[tokio::test]
    async fn add_peer_after_a_roll_seeds_from_latest_path() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();
        mgr.pre_log_roll(wal_log("/wal/w.50")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.50"));

        mgr.add_peer(PeerConfig::new_async("Q", "host:2")).await.unwrap();

        let wals = mgr.get_wals();
        let q_queue = QueueId::normal(PeerId::new("Q".to_string()));
        let entries = wals.get(&q_queue).unwrap();
        assert_eq!(entries.get(&WalName::from("w.50").prefix()).unwrap(), &BTreeSet::from([WalName::from("w.50")]));
    }

    #[tokio::test]
    async fn buffer_backpressure_threshold_crossing() {
        let mut config = ReplicationConfig::default();
        config.total_buffer_limit = 1024;
        let mgr = manager(config);

        assert!(!mgr.acquire_buffer_quota(500).unwrap());
        assert!(!mgr.acquire_buffer_quota(500).unwrap());
        assert!(mgr.acquire_buffer_quota(500).unwrap());
        assert!(!mgr.check_buffer_quota(&PeerId::new("any".to_string())));

        mgr.release_buffer_quota(1500).unwrap();
        assert!(mgr.check_buffer_quota(&PeerId::new("any".to_string())));
    }

    #[tokio::test]
    async fn negative_buffer_quota_size_is_a_precondition_violation() {
        let mgr = manager(ReplicationConfig::default());
        let err = mgr.acquire_buffer_quota(-1).unwrap_err();
        assert!(matches!(err, ReplicationError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn remove_peer_leaves_no_trace() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();
        mgr.pre_log_roll(wal_log("/wal/w.1")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.1"));

        mgr.remove_peer(&PeerId::new("P".to_string())).await.unwrap();

        assert!(mgr.get_source(&PeerId::new("P".to_string())).is_none());
        assert!(!mgr.get_wals().contains_key(&QueueId::normal(PeerId::new("P".to_string()))));
    }

    #[tokio::test]
    async fn failover_race_with_peer_re_add_drops_the_claim() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();

        let dead = NodeId::new("deadnode-1".to_string());
        let queue = QueueId::normal(PeerId::new("P".to_string()));
        mgr.storage.add_wal(&dead, &queue, &WalName::from("w.1")).await.unwrap();

        // Race: remove + re-add the peer so identity no longer matches by
        // the time the claim would install.
        mgr.remove_peer(&PeerId::new("P".to_string())).await.unwrap();
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();

        mgr.claim_queue_task(&dead, &queue).await;

        assert!(mgr.get_old_sources().is_empty());
    }

    #[derive(Default)]
    struct RecordingAbortHook {
        aborted: std::sync::atomic::AtomicBool,
    }

    impl FatalAbortHook for RecordingAbortHook {
        fn abort(&self, _reason: &str) {
            self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct AlwaysIoErrorStorage;

    #[async_trait::async_trait]
    impl QueueStorage for AlwaysIoErrorStorage {
        async fn add_wal(&self, _node: &NodeId, _queue: &QueueId, _wal: &WalName) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn remove_wal(&self, _node: &NodeId, _queue: &QueueId, _wal: &WalName) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn set_wal_position(
            &self,
            _node: &NodeId,
            _queue: &QueueId,
            _wal: &WalName,
            _progress: WalProgress,
        ) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn remove_queue(&self, _node: &NodeId, _queue: &QueueId) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn claim_queue(
            &self,
            _dead_node: &NodeId,
            _queue: &QueueId,
            _this_node: &NodeId,
        ) -> Result<(QueueId, BTreeSet<WalName>), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn get_all_queues(&self, _node: &NodeId) -> Result<Vec<(QueueId, BTreeSet<WalName>)>, StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn add_peer_to_hfile_refs(&self, _peer: &PeerId) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn remove_peer_from_hfile_refs(&self, _peer: &PeerId) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
        async fn remove_hfile_refs(&self, _peer: &PeerId, _files: &[String]) -> Result<(), StorageError> {
            Err(StorageError::Io(anyhow::anyhow!("boom")))
        }
    }

    #[tokio::test]
    async fn io_storage_failure_triggers_fatal_abort_hook() {
        let hook = Arc::new(RecordingAbortHook::default());
        let mgr = ReplicationSourceManager::new(
            NodeId::new("this-node".to_string()),
            ReplicationConfig::default(),
            hook.clone(),
            Arc::new(PeerRegistry::new()),
            Arc::new(AlwaysIoErrorStorage),
            None,
        );
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();

        let err = mgr.pre_log_roll(wal_log("/wal/w.1")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(_)));
        assert!(hook.aborted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_storage_write_does_not_trigger_fatal_abort_hook() {
        let hook = Arc::new(RecordingAbortHook::default());
        let storage = Arc::new(InMemoryQueueStorage::new());
        let mgr = ReplicationSourceManager::new(
            NodeId::new("this-node".to_string()),
            ReplicationConfig::default(),
            hook.clone(),
            Arc::new(PeerRegistry::new()),
            storage.clone(),
            None,
        );
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();
        mgr.pre_log_roll(wal_log("/wal/w.1")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.1"));
        let source = mgr.registry.get(&PeerId::new("P".to_string())).unwrap();

        storage.simulate_cancel_on_next_write(&NodeId::new("this-node".to_string()), source.queue_id());

        let err = mgr
            .log_position_and_clean_old_logs(
                &source,
                ShippedBatch {
                    last_wal_name: WalName::from("w.1"),
                    last_position: 10,
                    last_seq_ids: Default::default(),
                    is_end_of_file: false,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicationError::Cancelled { .. }));
        assert!(!hook.aborted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[derive(Default)]
    struct FlakyRemote {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteWalStorage for FlakyRemote {
        async fn delete(&self, _path: &RemotePath) -> Result<(), remote_storage::RemoteDeleteError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                Err(remote_storage::RemoteDeleteError::Other(anyhow::anyhow!("transient failure")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn remote_wal_cleanup_retries_below_the_cap_then_succeeds() {
        let mut config = ReplicationConfig::default();
        config.sync_sleep_for_retries = std::time::Duration::from_millis(1);
        let remote = Arc::new(FlakyRemote::default());
        let mgr = ReplicationSourceManager::new(
            NodeId::new("this-node".to_string()),
            config,
            Arc::new(LoggingAbortHook),
            Arc::new(PeerRegistry::new()),
            Arc::new(InMemoryQueueStorage::new()),
            Some(remote.clone()),
        );
        mgr.add_peer(PeerConfig::new_sync("S", "host:1", Utf8PathBuf::from("/remote/s")))
            .await
            .unwrap();
        mgr.pre_log_roll(wal_log("/wal/S.1")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/S.1"));
        let source = mgr.registry.get(&PeerId::new("S".to_string())).unwrap();

        mgr.clean_old_logs(&WalName::from("S.1"), true, &source).await.unwrap();

        assert_eq!(remote.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(mgr
            .get_wals()
            .get(&QueueId::normal(PeerId::new("S".to_string())))
            .map(|m| m.values().all(|s| s.is_empty()))
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn drain_sources_removes_wals_and_terminates_recovered() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_sync("S", "host:1", Utf8PathBuf::from("/remote/s"))).await.unwrap();
        mgr.pre_log_roll(wal_log("/wal/w.10")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.10"));
        mgr.pre_log_roll(wal_log("/wal/w.11")).await.unwrap();
        mgr.post_log_roll(&wal_log("/wal/w.11"));

        mgr.drain_sources(&PeerId::new("S".to_string())).await.unwrap();

        assert!(!mgr
            .get_wals()
            .get(&QueueId::normal(PeerId::new("S".to_string())))
            .map(|m| m.values().any(|s| !s.is_empty()))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn draining_a_recovered_source_s_claimed_set_terminates_it() {
        let mgr = manager(ReplicationConfig::default());
        mgr.add_peer(PeerConfig::new_async("P", "host:1")).await.unwrap();

        let dead = NodeId::new("deadnode-1".to_string());
        let queue = QueueId::normal(PeerId::new("P".to_string()));
        mgr.storage.add_wal(&dead, &queue, &WalName::from("w.1")).await.unwrap();

        mgr.claim_queue_task(&dead, &queue).await;
        assert_eq!(mgr.get_old_sources().len(), 1);

        let recovered_queue = queue.claimed_from(&dead);
        let source = mgr.resolve_source(&recovered_queue).unwrap();

        // Drains the source's entire claimed set in one batch; the manager
        // must notice the recovered queue is now empty and finish the source
        // rather than leave it parked forever.
        mgr.clean_old_logs(&WalName::from("w.1"), true, &source).await.unwrap();

        // `finish_recovered_source` is detached onto its own task (it awaits
        // the source's own run-loop handle, which would deadlock if awaited
        // inline from within `clean_old_logs`); give it a turn to run.
        for _ in 0..50 {
            if mgr.get_old_sources().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(mgr.get_old_sources().is_empty());
        assert!(!mgr
            .get_wals_by_id_recovered_queues()
            .contains_key(&recovered_queue));
        assert!(mgr.storage.get_all_queues(&NodeId::new("this-node".to_string())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_up_tool_skips_claim_for_disabled_peer() {
        let mgr = ReplicationSourceManager::new_sync_up_tool(
            NodeId::new("this-node".to_string()),
            ReplicationConfig::default(),
            Arc::new(LoggingAbortHook),
            Arc::new(PeerRegistry::new()),
            Arc::new(InMemoryQueueStorage::new()),
            None,
        );
        let mut peer = PeerConfig::new_async("P", "host:1");
        peer.enabled = false;
        mgr.add_peer(peer).await.unwrap();

        let dead = NodeId::new("deadnode-1".to_string());
        let queue = QueueId::normal(PeerId::new("P".to_string()));
        mgr.storage.add_wal(&dead, &queue, &WalName::from("w.1")).await.unwrap();

        mgr.claim_queue_task(&dead, &queue).await;

        assert!(mgr.get_old_sources().is_empty());
        assert!(mgr.storage.get_all_queues(&NodeId::new("this-node".to_string())).await.unwrap().is_empty());
    }
}
