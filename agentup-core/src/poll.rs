//! Bounded polling shared by the drain and liveness waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a [`poll_until`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate returned `true`.
    Satisfied,
    /// `timeout` elapsed without the predicate returning `true`.
    TimedOut,
    /// `cancel` fired between two checks.
    Cancelled,
}

/// Evaluate `check` every `interval` until it returns `true`, `timeout`
/// elapses, or `cancel` fires.
///
/// The predicate is always evaluated at least once. The task sleeps between
/// checks and never waits past the deadline.
pub async fn poll_until<F, Fut>(
    mut check: F,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        if check().await {
            return PollOutcome::Satisfied;
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }

        let nap = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_satisfied_on_first_check() {
        let cancel = CancellationToken::new();
        let outcome = poll_until(
            || async { true },
            Duration::from_secs(30),
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Satisfied);
    }

    #[tokio::test]
    async fn test_satisfied_after_some_polls() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = poll_until(
            move || async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 },
            Duration::from_millis(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Satisfied);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let outcome = poll_until(
            || async { false },
            Duration::from_millis(10),
            Duration::from_millis(50),
            &cancel,
        )
        .await;
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancelled_while_sleeping() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = poll_until(
            || async { false },
            Duration::from_secs(10),
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
