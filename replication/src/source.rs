//! The replication source ("shipper"): reads a WAL, batches entries, and
//! pushes them to a remote peer. Per §1 this is an external collaborator
//! — the wire protocol and batching strategy are non-goals — so this
//! module only fixes the capability interface the core drives
//! (`enqueueLog`, `startup`, `terminate`, ...) and a minimal concrete
//! implementation good enough to exercise that interface end to end in
//! tests, modeled on the teacher's task-plus-shutdown-channel shape
//! (`wal_backup::WalBackupTaskHandle`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};
use utils::id::{PeerId, QueueId};

use crate::error::ReplicationError;
use crate::wal::WalName;

/// A single shipped batch, as reported back to the cleanup engine
/// (§4.5). The real shipper accumulates many WAL entries per batch; this
/// stand-in always ships exactly one WAL per batch, which is sufficient
/// to drive the cleanup and log-position bookkeeping this crate owns.
#[derive(Clone, Debug)]
pub struct ShippedBatch {
    pub last_wal_name: WalName,
    pub last_position: u64,
    pub last_seq_ids: BTreeMap<String, u64>,
    pub is_end_of_file: bool,
}

/// Callback surface a source reports shipping progress through. The
/// manager implements this; keeping it as a trait (rather than an
/// `Arc<Manager>` field on every source) keeps the source/manager
/// dependency one-directional.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    async fn on_batch_shipped(
        &self,
        queue_id: &QueueId,
        batch: ShippedBatch,
    ) -> Result<(), ReplicationError>;
}

/// Forwarding impl so an `Arc<ReplicationSourceManager>` can be handed to
/// sources directly as their sink, without the manager needing to wrap
/// itself in another newtype.
#[async_trait::async_trait]
impl<T: BatchSink + ?Sized> BatchSink for Arc<T> {
    async fn on_batch_shipped(
        &self,
        queue_id: &QueueId,
        batch: ShippedBatch,
    ) -> Result<(), ReplicationError> {
        (**self).on_batch_shipped(queue_id, batch).await
    }
}

/// Point-in-time counters a source exposes through `getStats`, kept in
/// an `Arc` so `refreshSources` can hand them, unmodified, to a
/// replacement source and preserve statistics across the reconfigure
/// (§4.6).
#[derive(Default)]
pub struct SourceStatsInner {
    pub wals_shipped: AtomicU64,
    pub entries_shipped: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub queue_id: QueueId,
    pub peer_id: PeerId,
    pub recovered: bool,
    pub wals_shipped: u64,
    pub entries_shipped: u64,
}

/// The capability interface the replication core drives (§1).
#[async_trait::async_trait]
pub trait ReplicationSource: Send + Sync {
    fn peer_id(&self) -> &PeerId;
    fn queue_id(&self) -> &QueueId;
    fn is_recovered(&self) -> bool;
    fn is_sync_replication(&self) -> bool;
    fn is_active(&self) -> bool;
    fn enqueue_log(&self, log: WalName);
    async fn startup(&self);
    /// `clear_metrics = false` preserves `get_stats()`'s counters, used
    /// by `refreshSources` when swapping in a replacement source.
    async fn terminate(&self, message: &str, clear_metrics: bool);
    fn get_stats(&self) -> SourceStats;
    /// The stats handle backing this source, so `refreshSources`/
    /// `drainSources` can pass it into a replacement source and keep
    /// counting across the reconfigure (§4.6).
    fn stats_handle(&self) -> Arc<SourceStatsInner>;
}

pub struct ShipperSource {
    queue_id: QueueId,
    peer_id: PeerId,
    recovered: bool,
    sync_replication: bool,
    active: Arc<AtomicBool>,
    stats: Arc<SourceStatsInner>,
    enqueue_tx: mpsc::UnboundedSender<WalName>,
    task: Mutex<Option<JoinHandle<()>>>,
    enqueue_rx: Mutex<Option<mpsc::UnboundedReceiver<WalName>>>,
    sink: Arc<dyn BatchSink>,
}

impl ShipperSource {
    pub fn new(
        queue_id: QueueId,
        sync_replication: bool,
        stats: Option<Arc<SourceStatsInner>>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let recovered = queue_id.is_recovered();
        let peer_id = queue_id.peer_id().clone();
        ShipperSource {
            queue_id,
            peer_id,
            recovered,
            sync_replication,
            active: Arc::new(AtomicBool::new(false)),
            stats: stats.unwrap_or_else(|| Arc::new(SourceStatsInner::default())),
            enqueue_tx: tx,
            task: Mutex::new(None),
            enqueue_rx: Mutex::new(Some(rx)),
            sink,
        }
    }
}

#[async_trait::async_trait]
impl ReplicationSource for ShipperSource {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    fn is_recovered(&self) -> bool {
        self.recovered
    }

    fn is_sync_replication(&self) -> bool {
        self.sync_replication
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn enqueue_log(&self, log: WalName) {
        // Dropped silently if the loop already shut down: a terminated
        // source is not expected to make further progress.
        let _ = self.enqueue_tx.send(log);
    }

    async fn startup(&self) {
        let mut rx = match self.enqueue_rx.lock().take() {
            Some(rx) => rx,
            None => return, // already started
        };
        self.active.store(true, Ordering::SeqCst);

        let active = self.active.clone();
        let stats = self.stats.clone();
        let sink = self.sink.clone();
        let queue_id = self.queue_id.clone();
        let span = info_span!("replication source", queue_id = %queue_id);

        let handle = tokio::spawn(
            async move {
                while active.load(Ordering::SeqCst) {
                    let Some(log) = rx.recv().await else {
                        break;
                    };
                    let batch = ShippedBatch {
                        last_wal_name: log,
                        last_position: 0,
                        last_seq_ids: BTreeMap::new(),
                        is_end_of_file: true,
                    };
                    stats.wals_shipped.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = sink.on_batch_shipped(&queue_id, batch).await {
                        match e {
                            ReplicationError::Cancelled { .. } => break,
                            other => {
                                tracing::error!(error = %other, "source loop aborting after cleanup error");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        *self.task.lock() = Some(handle);
    }

    async fn terminate(&self, message: &str, clear_metrics: bool) {
        self.active.store(false, Ordering::SeqCst);
        info!(message, queue_id = %self.queue_id, "terminating replication source");
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if clear_metrics {
            self.stats.wals_shipped.store(0, Ordering::SeqCst);
            self.stats.entries_shipped.store(0, Ordering::SeqCst);
        }
    }

    fn get_stats(&self) -> SourceStats {
        SourceStats {
            queue_id: self.queue_id.clone(),
            peer_id: self.peer_id.clone(),
            recovered: self.recovered,
            wals_shipped: self.stats.wals_shipped.load(Ordering::SeqCst),
            entries_shipped: self.stats.entries_shipped.load(Ordering::SeqCst),
        }
    }

    fn stats_handle(&self) -> Arc<SourceStatsInner> {
        self.stats.clone()
    }
}
