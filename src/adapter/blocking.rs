//! Cooperative-concurrency blocking detection.
//!
//! Probing is sampling-based (first `PROBE_INITIAL` calls, then every
//! `PROBE_INTERVAL`-th) to keep steady-state overhead near zero. Warning
//! de-duplication uses a process-wide set keyed by callable identity
//! (here, the `Arc` pointer address of the [`FunctionTask`] doing the
//! probing), so the same blocking callable never warns twice even across
//! many items.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::warn;

const PROBE_INITIAL: u64 = 3;
const PROBE_INTERVAL: u64 = 50;
const HEARTBEAT_TICK: Duration = Duration::from_millis(100);
const BLOCKING_THRESHOLD: Duration = Duration::from_secs(1);
const MIN_CLEAN_TICKS: u32 = 2;

fn warned_identities() -> &'static Mutex<HashSet<usize>> {
    static WARNED: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();
    WARNED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Per-`FunctionTask` probe state. Not `Clone`: owned by the single task
/// instance whose calls it's tracking.
#[derive(Debug, Default)]
pub struct BlockingWarnings {
    call_count: AtomicU64,
    clean_streak: AtomicU64,
}

impl BlockingWarnings {
    fn should_probe(&self) -> bool {
        let call_count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let clean_streak = self.clean_streak.load(Ordering::SeqCst);
        clean_streak < PROBE_INITIAL || call_count % PROBE_INTERVAL == 0
    }

    fn record_clean(&self) {
        self.clean_streak.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_streak(&self) {
        self.clean_streak.store(0, Ordering::SeqCst);
    }

    /// Runs `fut` to completion, probing for event-loop blocking if this
    /// call lands in the sampling window. `callable_id` identifies the
    /// user callable for the one-shot warning (pointer identity is the
    /// natural choice since the wrapping `Arc<FunctionTask>` is stable for
    /// the run).
    pub async fn run_probed<F, T>(&self, callable_name: &str, callable_id: usize, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        if !self.should_probe() {
            return fut.await;
        }

        let ticks = std::sync::Arc::new(AtomicU64::new(0));
        let ticks_clone = ticks.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                sleep(HEARTBEAT_TICK).await;
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let start = Instant::now();
        let output = fut.await;
        let elapsed = start.elapsed();
        heartbeat.abort();
        let hb_ticks = ticks.load(Ordering::SeqCst);

        if elapsed > BLOCKING_THRESHOLD && hb_ticks < MIN_CLEAN_TICKS as u64 {
            self.warn_once(callable_name, callable_id, elapsed, hb_ticks);
            self.reset_streak();
        } else {
            self.record_clean();
        }

        output
    }

    fn warn_once(&self, callable_name: &str, callable_id: usize, elapsed: Duration, hb_ticks: u64) {
        let mut warned = warned_identities().lock().expect("blocking-warned set mutex poisoned");
        if warned.insert(callable_id) {
            warn!(
                "Async task '{callable_name}' appears to block the event loop ({:.1}s elapsed, {hb_ticks} event-loop ticks). \
                 Common causes: using a blocking HTTP client instead of an async one, synchronous file or DB calls inside an async fn. \
                 Fix: declare this task as non-cooperative so it runs in a thread pool automatically, or switch to async I/O.",
                elapsed.as_secs_f64()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn probes_first_three_calls_then_samples() {
        let bw = BlockingWarnings::default();
        for _ in 0..3 {
            assert!(bw.should_probe());
            bw.record_clean();
        }
        for i in 4..PROBE_INTERVAL {
            let _ = i;
            assert!(!bw.should_probe());
            bw.record_clean();
        }
    }

    #[tokio::test]
    async fn warns_once_per_identity() {
        let bw = BlockingWarnings::default();
        let id: usize = 0xdead_beef;
        bw.warn_once("slow_task", id, Duration::from_secs(2), 0);
        bw.warn_once("slow_task", id, Duration::from_secs(2), 0);
        assert!(warned_identities().lock().unwrap().contains(&id));
    }
}
