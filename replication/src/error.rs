//! Crate-wide error type and the fatal-abort containment policy described
//! in the host node interface (§1, §7 of the design doc): a handful of
//! storage-failure paths must bring the whole node down rather than
//! surface as an ordinary `Result::Err`, because letting them propagate
//! as recoverable errors would let the in-memory WAL index silently
//! diverge from the durable queue store.

use std::sync::Arc;

use crate::storage::StorageError;

/// Errors the replication core can return from its public entry points.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The durable queue store reported a failure that does not unwind
    /// cleanly (see [`ReplicationError::Cancelled`]) and is not itself
    /// fatal to the node — currently unused by any call site but kept so
    /// callers pattern-matching on this enum don't need a wildcard arm
    /// added later for a genuinely recoverable storage error.
    #[error("durable queue store error: {0}")]
    Storage(#[from] anyhow::Error),

    /// A background write into the queue store was interrupted because
    /// the owning source was concurrently terminated. This is the one
    /// storage failure that must *not* abort the node: the source loop
    /// unwinds on its own.
    #[error("storage operation cancelled: source {queue_id} was terminated")]
    Cancelled { queue_id: String },

    /// A peer named in the request does not exist in the peer registry.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// A precondition on a public API was violated by the caller (e.g. a
    /// negative buffer-quota size).
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
}

impl From<StorageError> for ReplicationError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Cancelled { queue_id } => ReplicationError::Cancelled { queue_id },
            StorageError::Io(e) => ReplicationError::Storage(e),
        }
    }
}

/// The host node's fatal-abort hook (§1: "host node object... fatal-abort
/// hook"). A real deployment wires this to process-level shutdown; tests
/// wire it to a flag they can assert on.
pub trait FatalAbortHook: Send + Sync {
    fn abort(&self, reason: &str);
}

/// An abort hook that only logs, used when no stricter hook is supplied.
#[derive(Default)]
pub struct LoggingAbortHook;

impl FatalAbortHook for LoggingAbortHook {
    fn abort(&self, reason: &str) {
        tracing::error!(reason, "fatal abort requested by replication core");
    }
}

/// Invoke `hook` and return an error carrying `reason`; callers on a
/// storage-failure path that the design calls "fatal abort and propagate"
/// use this so both halves of that policy happen at one call site.
pub(crate) fn fatal_abort(
    hook: &Arc<dyn FatalAbortHook>,
    reason: impl Into<String>,
) -> ReplicationError {
    let reason = reason.into();
    hook.abort(&reason);
    ReplicationError::Storage(anyhow::anyhow!(reason))
}
