//! Buffer Quota (§4.8): a process-wide counter and limit over in-flight
//! batched edit bytes, shared by every source.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::TOTAL_BUFFER_USED_BYTES;

pub struct BufferQuota {
    used: AtomicU64,
    limit: u64,
}

/// Running byte total for one in-progress batch, released in one shot
/// when the batch finishes (`releaseWALEntryBatchBufferQuota`).
#[derive(Default)]
pub struct WalEntryBatch {
    size: u64,
}

impl WalEntryBatch {
    pub fn new() -> Self {
        WalEntryBatch::default()
    }

    pub fn tracked_size(&self) -> u64 {
        self.size
    }
}

impl BufferQuota {
    pub fn new(limit: u64) -> Self {
        BufferQuota {
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Adds `size` to the counter and returns whether the counter is now
    /// at or above the limit. `size == 0` is a no-op that still reports
    /// current state; `size < 0` is impossible by the `u64` type, so the
    /// precondition check lives at the call boundary that accepts signed
    /// input (none here — this crate only ever calls it with validated
    /// non-negative sizes).
    pub fn acquire(&self, size: u64) -> bool {
        let new_total = self.used.fetch_add(size, Ordering::SeqCst) + size;
        TOTAL_BUFFER_USED_BYTES.set(new_total as i64);
        new_total >= self.limit
    }

    pub fn release(&self, size: u64) {
        // saturating: a release racing a concurrent acquire must never
        // wrap the counter below zero.
        let mut prev = self.used.load(Ordering::SeqCst);
        loop {
            let next = prev.saturating_sub(size);
            match self
                .used
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    TOTAL_BUFFER_USED_BYTES.set(next as i64);
                    return;
                }
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advisory read consulted by a source before attempting to read
    /// more WAL entries (`checkBufferQuota`): false iff already over
    /// budget.
    pub fn check(&self) -> bool {
        self.used() < self.limit
    }

    pub fn acquire_for_entry(&self, batch: &mut WalEntryBatch, entry_size: u64) -> bool {
        batch.size += entry_size;
        self.acquire(entry_size)
    }

    pub fn release_batch(&self, batch: &WalEntryBatch) {
        self.release(batch.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_true_once_total_reaches_limit() {
        let quota = BufferQuota::new(1024);
        assert!(!quota.acquire(500));
        assert!(!quota.acquire(500));
        assert!(quota.acquire(500)); // 1500 >= 1024
        assert_eq!(quota.used(), 1500);
    }

    #[test]
    fn release_returns_counter_to_prior_value() {
        let quota = BufferQuota::new(1024);
        quota.acquire(300);
        let before = quota.used();
        quota.acquire(200);
        quota.release(200);
        assert_eq!(quota.used(), before);
    }

    #[test]
    fn zero_size_is_a_noop() {
        let quota = BufferQuota::new(1024);
        quota.acquire(100);
        let before = quota.used();
        assert!(!quota.acquire(0));
        assert_eq!(quota.used(), before);
    }

    #[test]
    fn check_reflects_over_budget_state() {
        let quota = BufferQuota::new(1000);
        assert!(quota.check());
        quota.acquire(1000);
        assert!(!quota.check());
        quota.release(1000);
        assert!(quota.check());
    }

    #[test]
    fn batch_tracks_running_total_and_releases_in_one_shot() {
        let quota = BufferQuota::new(10_000);
        let mut batch = WalEntryBatch::new();
        quota.acquire_for_entry(&mut batch, 100);
        quota.acquire_for_entry(&mut batch, 50);
        assert_eq!(batch.tracked_size(), 150);
        assert_eq!(quota.used(), 150);
        quota.release_batch(&batch);
        assert_eq!(quota.used(), 0);
    }
}
