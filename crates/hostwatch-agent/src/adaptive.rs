//! Load-driven reporting cadence.
//!
//! The controller watches `load = max(cpu%, mem%)` and stretches the
//! reporting interval under sustained load, shrinks it when the host is
//! idle, and otherwise drifts back toward the configured base. Backing off
//! takes 3 hot samples; recovering takes 5 cold ones.

use std::sync::Arc;
use std::time::Duration;

use hostwatch_core::{AppError, ErrorKind, ErrorLog, Severity};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sampler::MetricsSampler;

/// How often the controller samples load.
pub const ADAPT_TICK: Duration = Duration::from_secs(10);

/// Controller tuning.
#[derive(Clone, Debug)]
pub struct AdaptiveConfig {
    /// Interval the controller returns to.
    pub base: Duration,
    /// Load above this counts as high.
    pub high_threshold: f64,
    /// Load below this counts as low.
    pub low_threshold: f64,
    /// Multiplier per adjustment.
    pub adjustment_factor: f64,
    /// Consecutive high samples before backing off.
    pub high_samples: u32,
    /// Consecutive low samples before speeding up.
    pub low_samples: u32,
    /// Fraction of the distance to base covered per neutral sample.
    pub decay: f64,
}

impl AdaptiveConfig {
    /// Defaults around `base`.
    pub fn with_base(base: Duration) -> Self {
        Self {
            base,
            high_threshold: 80.0,
            low_threshold: 30.0,
            adjustment_factor: 1.2,
            high_samples: 3,
            low_samples: 5,
            decay: 0.05,
        }
    }

    /// Lower bound: 1s, or base if base is shorter.
    pub fn min_interval(&self) -> Duration {
        self.base.min(Duration::from_secs(1))
    }

    /// Upper bound: 2.5 × base.
    pub fn max_interval(&self) -> Duration {
        self.base.mul_f64(2.5)
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current: Duration,
    consecutive_high: u32,
    consecutive_low: u32,
}

/// Diagnostic view of the controller.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadInfo {
    /// Current interval in milliseconds.
    pub current_interval_ms: u64,
    /// Base interval in milliseconds.
    pub base_interval_ms: u64,
    /// Lower bound in milliseconds.
    pub min_interval_ms: u64,
    /// Upper bound in milliseconds.
    pub max_interval_ms: u64,
    /// Consecutive high-load samples.
    pub consecutive_high_load: u32,
    /// Consecutive low-load samples.
    pub consecutive_low_load: u32,
    /// High-load threshold, percent.
    pub high_threshold: f64,
    /// Low-load threshold, percent.
    pub low_threshold: f64,
}

/// Adjusts the reporting interval from observed load.
pub struct AdaptiveIntervalController {
    config: AdaptiveConfig,
    min: Duration,
    max: Duration,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveIntervalController {
    /// Create a controller starting at `config.base`.
    pub fn new(config: AdaptiveConfig) -> Self {
        let min = config.min_interval();
        let max = config.max_interval().max(min);
        Self {
            state: Mutex::new(AdaptiveState {
                current: config.base.clamp(min, max),
                consecutive_high: 0,
                consecutive_low: 0,
            }),
            config,
            min,
            max,
        }
    }

    /// Feed one sample. Returns the interval after adjustment.
    pub fn observe(&self, cpu_percent: f64, mem_percent: f64) -> Duration {
        let load = cpu_percent.max(mem_percent);
        let cfg = &self.config;
        let mut state = self.state.lock();

        if load > cfg.high_threshold {
            state.consecutive_high += 1;
            state.consecutive_low = 0;
            if state.consecutive_high >= cfg.high_samples {
                state.current = state.current.mul_f64(cfg.adjustment_factor).min(self.max);
            }
        } else if load < cfg.low_threshold {
            state.consecutive_low += 1;
            state.consecutive_high = 0;
            if state.consecutive_low >= cfg.low_samples {
                state.current = state.current.div_f64(cfg.adjustment_factor).max(self.min);
            }
        } else {
            state.consecutive_high = 0;
            state.consecutive_low = 0;
            state.current = decay_toward(state.current, cfg.base, cfg.decay);
        }

        state.current = state.current.clamp(self.min, self.max);
        debug!(load, interval_ms = state.current.as_millis(), "adaptive sample");
        state.current
    }

    /// Interval the reporting ticker should use next.
    pub fn current_interval(&self) -> Duration {
        self.state.lock().current
    }

    /// Drop all history and return to base.
    pub fn reset_to_base(&self) {
        let mut state = self.state.lock();
        state.current = self.config.base.clamp(self.min, self.max);
        state.consecutive_high = 0;
        state.consecutive_low = 0;
    }

    /// Diagnostic snapshot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load_info(&self) -> LoadInfo {
        let state = self.state.lock();
        LoadInfo {
            current_interval_ms: state.current.as_millis() as u64,
            base_interval_ms: self.config.base.as_millis() as u64,
            min_interval_ms: self.min.as_millis() as u64,
            max_interval_ms: self.max.as_millis() as u64,
            consecutive_high_load: state.consecutive_high,
            consecutive_low_load: state.consecutive_low,
            high_threshold: self.config.high_threshold,
            low_threshold: self.config.low_threshold,
        }
    }

    /// Sample load every [`ADAPT_TICK`] until cancelled.
    ///
    /// A failed sample is recorded and leaves the state untouched.
    pub async fn run(
        self: Arc<Self>,
        sampler: Arc<dyn MetricsSampler>,
        errors: Arc<ErrorLog>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(ADAPT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = tick.tick().await;
        info!(base_ms = self.config.base.as_millis(), "adaptive interval controller started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match sampler.load() {
                Ok(sample) => {
                    let _ = self.observe(sample.cpu_percent, sample.mem_percent);
                }
                Err(e) => errors.record(&AppError::wrap(
                    ErrorKind::System,
                    Severity::Low,
                    "load sample failed",
                    e,
                )),
            }
        }
    }
}

fn decay_toward(current: Duration, base: Duration, fraction: f64) -> Duration {
    if current > base {
        current.saturating_sub((current - base).mul_f64(fraction)).max(base)
    } else {
        current.saturating_add((base - current).mul_f64(fraction)).min(base)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::sampler::{LoadSample, SampleError};

    fn controller(base_secs: u64) -> AdaptiveIntervalController {
        AdaptiveIntervalController::new(AdaptiveConfig::with_base(Duration::from_secs(base_secs)))
    }

    #[test]
    fn bounds_from_base() {
        let cfg = AdaptiveConfig::with_base(Duration::from_secs(2));
        assert_eq!(cfg.min_interval(), Duration::from_secs(1));
        assert_eq!(cfg.max_interval(), Duration::from_secs(5));

        let fast = AdaptiveConfig::with_base(Duration::from_millis(500));
        assert_eq!(fast.min_interval(), Duration::from_millis(500));
    }

    #[test]
    fn backs_off_after_three_high_samples() {
        let c = controller(2);
        assert_eq!(c.observe(90.0, 10.0), Duration::from_secs(2));
        assert_eq!(c.observe(10.0, 95.0), Duration::from_secs(2));
        let third = c.observe(85.0, 85.0);
        assert!(third > Duration::from_secs(2));

        for _ in 0..50 {
            let _ = c.observe(99.0, 99.0);
        }
        assert_eq!(c.current_interval(), Duration::from_secs(5));
    }

    #[test]
    fn speeds_up_after_five_low_samples() {
        let c = controller(2);
        for _ in 0..4 {
            assert_eq!(c.observe(5.0, 5.0), Duration::from_secs(2));
        }
        assert!(c.observe(5.0, 5.0) < Duration::from_secs(2));

        for _ in 0..50 {
            let _ = c.observe(1.0, 1.0);
        }
        assert_eq!(c.current_interval(), Duration::from_secs(1));
    }

    #[test]
    fn neutral_samples_decay_toward_base_without_overshoot() {
        let c = controller(2);
        for _ in 0..10 {
            let _ = c.observe(95.0, 0.0);
        }
        let raised = c.current_interval();
        assert!(raised > Duration::from_secs(2));

        let mut last = raised;
        for _ in 0..500 {
            let now = c.observe(50.0, 50.0);
            assert!(now <= last);
            assert!(now >= Duration::from_secs(2));
            last = now;
        }
        assert!(last - Duration::from_secs(2) < Duration::from_millis(10));
    }

    #[test]
    fn neutral_sample_resets_streaks() {
        let c = controller(2);
        let _ = c.observe(90.0, 0.0);
        let _ = c.observe(90.0, 0.0);
        let _ = c.observe(50.0, 0.0);
        let _ = c.observe(90.0, 0.0);
        assert_eq!(c.current_interval(), Duration::from_secs(2));
        assert_eq!(c.load_info().consecutive_high_load, 1);
    }

    #[test]
    fn reset_and_load_info() {
        let c = controller(2);
        for _ in 0..5 {
            let _ = c.observe(90.0, 0.0);
        }
        c.reset_to_base();
        let info = c.load_info();
        assert_eq!(info.current_interval_ms, 2000);
        assert_eq!(info.max_interval_ms, 5000);
        assert_eq!(info.consecutive_high_load, 0);
        assert!((info.high_threshold - 80.0).abs() < f64::EPSILON);
    }

    struct FailingSampler;

    impl MetricsSampler for FailingSampler {
        fn sample(&self) -> Result<hostwatch_core::Snapshot, SampleError> {
            Err(SampleError::Unavailable("test".into()))
        }
        fn load(&self) -> Result<LoadSample, SampleError> {
            Err(SampleError::Unavailable("test".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sample_recorded_and_state_kept() {
        let c = Arc::new(controller(2));
        let errors = Arc::new(ErrorLog::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(c.clone().run(Arc::new(FailingSampler), errors.clone(), cancel.clone()));

        tokio::time::sleep(ADAPT_TICK * 3 + Duration::from_millis(10)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(errors.count(ErrorKind::System) >= 2);
        assert_eq!(c.current_interval(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn interval_always_within_bounds(
            base_ms in 100u64..20_000,
            samples in prop::collection::vec((0.0f64..100.0, 0.0f64..100.0), 0..200),
        ) {
            let cfg = AdaptiveConfig::with_base(Duration::from_millis(base_ms));
            let (min, max) = (cfg.min_interval(), cfg.max_interval());
            let c = AdaptiveIntervalController::new(cfg);
            for (cpu, mem) in samples {
                let interval = c.observe(cpu, mem);
                prop_assert!(interval >= min && interval <= max);
            }
        }
    }
}
