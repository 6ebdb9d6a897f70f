use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use sysinfo::System;

use crate::config::ConcurrencyTuning;

/// Worker counts and timeout for one batch, derived from live system load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub worker_count: usize,
    pub tool_invocation_concurrency: usize,
    pub timeout: Duration,
}

struct Inner {
    system: System,
    refreshed_at: Instant,
    recent_batch: Option<Duration>,
    current: ConcurrencyConfig,
}

/// Computes safe worker counts and timeouts from system load.
///
/// Guarantees a floor (never 0 workers) and a ceiling (the configured
/// maximums). Read-only from the batch processor's perspective; only the
/// internal feedback loop writes.
pub struct ConcurrencyController {
    tuning: ConcurrencyTuning,
    inner: Mutex<Inner>,
}

/// How long a computed config stays valid before load is re-sampled.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

impl ConcurrencyController {
    pub fn new(tuning: ConcurrencyTuning) -> Self {
        let mut system = System::new_all();
        system.refresh_cpu_usage();
        let current = Self::recompute(&system, None, &tuning);
        ConcurrencyController {
            tuning,
            inner: Mutex::new(Inner {
                system,
                refreshed_at: Instant::now(),
                recent_batch: None,
                current,
            }),
        }
    }

    /// The current limits, re-sampling system load if stale.
    pub fn current(&self) -> ConcurrencyConfig {
        let mut inner = self.inner.lock().unwrap();
        if inner.refreshed_at.elapsed() >= REFRESH_INTERVAL {
            inner.system.refresh_cpu_usage();
            inner.current = Self::recompute(&inner.system, inner.recent_batch, &self.tuning);
            inner.refreshed_at = Instant::now();
            debug!(
                "concurrency recomputed: {} worker(s), {} tool slot(s), timeout {:?}",
                inner.current.worker_count,
                inner.current.tool_invocation_concurrency,
                inner.current.timeout
            );
        }
        inner.current
    }

    /// Feed back the duration of the last completed batch; slow batches
    /// widen the per-item timeout on the next recompute.
    pub fn observe_batch_duration(&self, took: Duration) {
        self.inner.lock().unwrap().recent_batch = Some(took);
    }

    fn recompute(
        system: &System,
        recent_batch: Option<Duration>,
        tuning: &ConcurrencyTuning,
    ) -> ConcurrencyConfig {
        let cpus = system.cpus().len().max(1);
        let load = System::load_average().one.max(0.0);

        let free = (cpus as f64 - load).floor();
        let worker_count = (free as isize).clamp(1, tuning.max_workers.max(1) as isize) as usize;
        let tool_invocation_concurrency = (worker_count / 2)
            .max(1)
            .min(tuning.max_tool_invocations.max(1));

        // Pressure in [0, 1]: fraction of cores consumed by load.
        let pressure = (load / cpus as f64).clamp(0.0, 1.0);
        let mut timeout = tuning.base_timeout().mul_f64(1.0 + pressure);
        if let Some(batch) = recent_batch {
            if batch > timeout {
                timeout = batch.mul_f64(1.5);
            }
        }
        if timeout > tuning.max_timeout() {
            timeout = tuning.max_timeout();
        }

        ConcurrencyConfig {
            worker_count,
            tool_invocation_concurrency,
            timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> ConcurrencyTuning {
        ConcurrencyTuning {
            max_workers: 4,
            max_tool_invocations: 2,
            base_timeout_secs: 30,
            max_timeout_secs: 120,
        }
    }

    #[test]
    fn workers_stay_within_floor_and_ceiling() {
        let controller = ConcurrencyController::new(tuning());
        let config = controller.current();
        assert!(config.worker_count >= 1);
        assert!(config.worker_count <= 4);
        assert!(config.tool_invocation_concurrency >= 1);
        assert!(config.tool_invocation_concurrency <= 2);
    }

    #[test]
    fn timeout_stays_within_configured_bounds() {
        let controller = ConcurrencyController::new(tuning());
        let config = controller.current();
        assert!(config.timeout >= Duration::from_secs(30));
        assert!(config.timeout <= Duration::from_secs(120));
    }

    #[test]
    fn slow_batches_never_push_timeout_past_ceiling() {
        let system = System::new_all();
        let config = ConcurrencyController::recompute(
            &system,
            Some(Duration::from_secs(3600)),
            &tuning(),
        );
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[test]
    fn degenerate_ceilings_still_yield_a_worker() {
        let system = System::new_all();
        let config = ConcurrencyController::recompute(
            &system,
            None,
            &ConcurrencyTuning {
                max_workers: 0,
                max_tool_invocations: 0,
                base_timeout_secs: 1,
                max_timeout_secs: 1,
            },
        );
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.tool_invocation_concurrency, 1);
    }
}
