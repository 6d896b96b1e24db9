//! Timing-safe wrapper for first-factor credential checks.
//!
//! Every response is padded up to a target delay so that a wrong password
//! and a right one take the same time. The target is a high percentile of
//! recent *successful* latencies clamped to `[min_delay, max_delay]`. Failed
//! attempts never feed the window, so an attacker cannot drag the target
//! down with fast failures.
//!
//! The hot path appends to a small ring buffer and reads an atomic; the
//! percentile is recomputed by a single background task.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::debug;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TARGET_PERCENTILE: u8 = 85;
pub const DEFAULT_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub target_percentile: u8,
    pub window: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            target_percentile: DEFAULT_TARGET_PERCENTILE,
            window: DEFAULT_WINDOW,
        }
    }
}

pub struct TimingGate {
    config: TimingConfig,
    samples: Mutex<VecDeque<u64>>,
    target_micros: AtomicU64,
}

fn as_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl TimingGate {
    /// Build a gate. Out-of-range settings are normalized: the window holds at
    /// least one sample, the percentile is capped at 100, and `max_delay` is
    /// never below `min_delay`.
    #[must_use]
    pub fn new(mut config: TimingConfig) -> Self {
        config.window = config.window.max(1);
        config.target_percentile = config.target_percentile.clamp(1, 100);
        config.max_delay = config.max_delay.max(config.min_delay);
        let initial = as_micros(config.min_delay);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.window)),
            target_micros: AtomicU64::new(initial),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Current padding target.
    #[must_use]
    pub fn target(&self) -> Duration {
        Duration::from_micros(self.target_micros.load(Ordering::Relaxed))
    }

    /// Run a credential check and pad its latency to the current target.
    ///
    /// `check` resolves to the value to return and whether the attempt
    /// succeeded.
    pub async fn run<F, T>(&self, check: F) -> T
    where
        F: Future<Output = (T, bool)>,
    {
        let started = Instant::now();
        let (value, success) = check.await;
        let elapsed = started.elapsed();

        if success {
            self.record(elapsed);
        }

        let target = self.target();
        if let Some(remaining) = target.checked_sub(elapsed) {
            sleep(remaining).await;
        }
        value
    }

    fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.config.window {
            samples.pop_front();
        }
        samples.push_back(as_micros(elapsed));
    }

    /// Recompute the target from the successful-latency window.
    pub fn recompute(&self) -> Duration {
        let mut sorted: Vec<u64> = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        let min = as_micros(self.config.min_delay);
        let max = as_micros(self.config.max_delay);
        let target = if sorted.is_empty() {
            min
        } else {
            sorted.sort_unstable();
            // Nearest-rank percentile.
            let rank = (sorted.len() * usize::from(self.config.target_percentile)).div_ceil(100);
            sorted[rank.saturating_sub(1)].clamp(min, max)
        };

        self.target_micros.store(target, Ordering::Relaxed);
        Duration::from_micros(target)
    }

    /// Recompute the target every `every` on a dedicated task.
    pub fn spawn_recompute(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let target = gate.recompute();
                debug!(target_ms = target.as_millis(), "timing gate target recomputed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: Duration = Duration::from_millis(25);

    fn gate() -> TimingGate {
        TimingGate::new(TimingConfig::default())
    }

    async fn timed(gate: &TimingGate, work: Duration, success: bool) -> Duration {
        let started = Instant::now();
        gate.run(async {
            sleep(work).await;
            ((), success)
        })
        .await;
        started.elapsed()
    }

    fn p95(mut samples: Vec<Duration>) -> Duration {
        samples.sort_unstable();
        let rank = (samples.len() * 95).div_ceil(100);
        samples[rank - 1]
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_padded_to_min_delay() {
        let gate = gate();
        let elapsed = timed(&gate, Duration::from_millis(3), false).await;
        assert_eq!(elapsed, DEFAULT_MIN_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_checks_are_not_delayed_further() {
        let gate = gate();
        let elapsed = timed(&gate, Duration::from_millis(400), false).await;
        assert_eq!(elapsed, Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn target_tracks_successes_and_clamps() {
        let gate = gate();
        for _ in 0..DEFAULT_WINDOW {
            timed(&gate, Duration::from_millis(600), true).await;
        }
        assert_eq!(gate.recompute(), Duration::from_millis(600));

        for _ in 0..DEFAULT_WINDOW {
            timed(&gate, Duration::from_secs(3), true).await;
        }
        assert_eq!(gate.recompute(), DEFAULT_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_never_move_the_target() {
        let gate = gate();
        for _ in 0..50 {
            timed(&gate, Duration::from_millis(900), false).await;
        }
        assert_eq!(gate.recompute(), DEFAULT_MIN_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn success_and_failure_latencies_match_at_p95() {
        let gate = Arc::new(gate());
        let recompute = gate.spawn_recompute(Duration::from_millis(500));

        let mut successes = Vec::with_capacity(1000);
        let mut failures = Vec::with_capacity(1000);
        for trial in 0..1000u64 {
            // Real checks vary a little; failures return early.
            let work = Duration::from_millis(300 + trial % 20);
            successes.push(timed(&gate, work, true).await);
            failures.push(timed(&gate, Duration::from_millis(2), false).await);
        }
        recompute.abort();

        let success = p95(successes);
        let failure = p95(failures);
        let difference = success.abs_diff(failure);
        assert!(
            difference <= TOLERANCE,
            "p95 success {success:?} vs failure {failure:?}"
        );
    }

    #[test]
    fn config_is_normalized() {
        let gate = TimingGate::new(TimingConfig {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
            target_percentile: 0,
            window: 0,
        });
        assert_eq!(gate.config().window, 1);
        assert_eq!(gate.config().target_percentile, 1);
        assert_eq!(gate.config().max_delay, Duration::from_millis(500));
        assert_eq!(gate.target(), Duration::from_millis(500));
    }
}
