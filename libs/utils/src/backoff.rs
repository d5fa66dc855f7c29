//! Small retry helpers shared by every component that talks to the
//! durable queue store or a remote filesystem.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry `op` up to `max_retries` times, warning once `warn_threshold`
/// attempts have failed. Returns `None` if `cancel` fires while waiting
/// between attempts; otherwise the last attempt's `Result`.
///
/// Mirrors the bounded, cancellable retry used around durable-storage
/// calls: callers that need "retry forever while some condition holds"
/// (the sync-replication remote WAL cleanup path) use
/// [`RetryingDelay`] instead, since that loop has no fixed attempt count.
pub async fn retry<T, E, F, Fut>(
    mut op: F,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match op().await {
            Ok(v) => return Some(Ok(v)),
            Err(e) if is_permanent(&e) || attempt >= max_retries => return Some(Err(e)),
            Err(e) => {
                attempt += 1;
                if attempt >= warn_threshold {
                    warn!(attempt, description, "retrying after failure");
                }
                let delay = backoff_delay(attempt, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Some(Err(e)),
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.checked_mul(1u32 << attempt.min(20))
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}

/// Multiplicative backoff with a hard cap on the multiplier, used by the
/// cleanup engine's indefinite retry of sync-replication remote WAL
/// deletes (the multiplier, not the attempt count, is what's bounded:
/// the loop itself runs as long as the source stays active).
#[derive(Debug, Clone, Copy)]
pub struct RetryingDelay {
    base: Duration,
    multiplier: u32,
    max_multiplier: u32,
}

impl RetryingDelay {
    pub fn new(base: Duration, max_multiplier: u32) -> Self {
        RetryingDelay {
            base,
            multiplier: 1,
            max_multiplier: max_multiplier.max(1),
        }
    }

    /// Current delay before the *next* attempt.
    pub fn current(&self) -> Duration {
        self.base.saturating_mul(self.multiplier)
    }

    /// Record a failed attempt, bumping the multiplier (capped).
    pub fn bump(&mut self) {
        self.multiplier = (self.multiplier + 1).min(self.max_multiplier);
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_succeeds_eventually() {
        let cancel = CancellationToken::new();
        let mut attempts = 0;
        let result: Option<Result<i32, &'static str>> = retry(
            || {
                attempts += 1;
                let this_attempt = attempts;
                async move {
                    if this_attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| false,
            1,
            10,
            "test retry",
            &cancel,
        )
        .await;
        assert_eq!(result, Some(Ok(42)));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let cancel = CancellationToken::new();
        let result: Option<Result<i32, &'static str>> = retry(
            || async { Err("permanent") },
            |_| true,
            1,
            10,
            "test retry",
            &cancel,
        )
        .await;
        assert_eq!(result, Some(Err("permanent")));
    }

    #[test]
    fn retrying_delay_caps_multiplier() {
        let mut d = RetryingDelay::new(Duration::from_millis(1000), 3);
        assert_eq!(d.multiplier(), 1);
        d.bump();
        assert_eq!(d.multiplier(), 2);
        d.bump();
        assert_eq!(d.multiplier(), 3);
        d.bump();
        assert_eq!(d.multiplier(), 3, "must not exceed max_retries_multiplier");
    }
}
