//! Rotation scheduling (C10): jittered rotation deadlines and
//! cancellation-aware sleeps, following the `tokio::select!` pattern used
//! for background-task cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Compute the next rotation deadline: `base + uniform(0, max(0, jitter))`,
/// floored at 30 seconds so a misconfigured `base`/`jitter` can never cause
/// a rotation tighter than the minimum useful interval.
pub fn next_rotation_deadline(base_seconds: u64, jitter_seconds: u64) -> Instant {
    let extra = if jitter_seconds == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_seconds)
    };
    let delay = (base_seconds + extra).max(30);
    Instant::now() + Duration::from_secs(delay)
}

/// The fixed post-failure retry delay. Exposed as a function (rather than
/// inlined at call sites) so scheduling policy stays in one place.
pub fn retry_delay(retry_seconds: u64) -> Duration {
    Duration::from_secs(retry_seconds)
}

/// Sleep until `deadline`, waking early if `running` flips to `false`.
/// Returns `true` if the deadline was reached, `false` if cancelled.
pub async fn sleep_until_or_cancelled(deadline: Instant, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        let tick = remaining.min(Duration::from_millis(500));
        tokio::time::sleep(tick).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rotation_deadline_never_below_floor() {
        let deadline = next_rotation_deadline(1, 1);
        let delta = deadline.saturating_duration_since(Instant::now());
        assert!(delta >= Duration::from_secs(29));
    }

    #[test]
    fn rotation_deadline_respects_base_plus_jitter_bound() {
        for _ in 0..50 {
            let deadline = next_rotation_deadline(300, 60);
            let delta = deadline.saturating_duration_since(Instant::now());
            assert!(delta <= Duration::from_secs(361));
        }
    }

    #[test]
    fn retry_delay_matches_configured_seconds() {
        assert_eq!(retry_delay(15), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_or_cancelled_reaches_deadline() {
        let running = Arc::new(AtomicBool::new(true));
        let deadline = Instant::now() + Duration::from_secs(5);
        let reached = sleep_until_or_cancelled(deadline, &running).await;
        assert!(reached);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_or_cancelled_wakes_on_cancel() {
        let running = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + Duration::from_secs(300);
        let reached = sleep_until_or_cancelled(deadline, &running).await;
        assert!(!reached);
    }
}
