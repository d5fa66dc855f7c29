//! Failover Claimer (§4.7): a small fixed worker pool that asynchronously
//! acquires the WAL queues of dead nodes and spawns recovered sources for
//! them. Cancellation on shutdown is cooperative via the node's stop
//! token, checked between the jitter sleep and the claim itself (§9
//! design notes).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use utils::id::{NodeId, QueueId};

use crate::manager::ReplicationSourceManager;

pub struct FailoverClaimer {
    semaphore: Arc<Semaphore>,
    sleep_before_failover: Duration,
    stopping: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
    tasks: std::sync::Mutex<JoinSet<()>>,
}

impl FailoverClaimer {
    pub fn new(workers: usize, sleep_before_failover: Duration, stopping: CancellationToken) -> Self {
        FailoverClaimer {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            sleep_before_failover,
            stopping,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            tasks: std::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Submit `(dead_node, queue)` to the worker pool (§4.7 step 1
    /// onward). `queue` is the dead node's own queue id (structured, not
    /// the flat znode-style string — node names may contain the same
    /// separator the canonical string form uses, so a round trip through
    /// a string is lossy; the caller is expected to hand over the value
    /// it already has, not re-parse one). Spawned eagerly; the semaphore
    /// permit — not a queue — is what bounds concurrency, so with the
    /// default single worker, submissions beyond the first simply wait
    /// for their turn inside the spawned task rather than blocking the
    /// caller.
    pub fn submit(&self, manager: Arc<ReplicationSourceManager>, dead_node: NodeId, queue: QueueId) {
        let semaphore = self.semaphore.clone();
        let sleep_before_failover = self.sleep_before_failover;
        let stopping = self.stopping.clone();
        let active_tasks = self.active_tasks.clone();
        let span = info_span!("failover claim", dead_node = %dead_node, queue = %queue);

        self.tasks.lock().unwrap().spawn(
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                active_tasks.fetch_add(1, Ordering::SeqCst);
                scopeguard::defer! { active_tasks.fetch_sub(1, Ordering::SeqCst); }

                let jitter = {
                    let base = sleep_before_failover.as_millis().max(1) as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(base..2 * base))
                };
                tokio::select! {
                    _ = tokio::time::sleep(jitter) => {}
                    _ = stopping.cancelled() => {
                        info!("node stopping, abandoning failover claim before it started");
                        return;
                    }
                }
                if stopping.is_cancelled() {
                    return;
                }

                manager.claim_queue_task(&dead_node, &queue).await;
            }
            .instrument(span),
        );
    }

    /// Stop accepting new claims and let in-flight ones finish (§5
    /// "Node shutdown").
    pub async fn shutdown(&self) {
        self.stopping.cancel();
        let mut tasks = std::mem::replace(&mut *self.tasks.lock().unwrap(), JoinSet::new());
        while tasks.join_next().await.is_some() {}
    }
}
