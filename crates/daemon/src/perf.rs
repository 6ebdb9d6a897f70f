use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

/// How many recent batches inform the tuning decision.
const WINDOW: usize = 10;

struct Inner {
    durations: VecDeque<Duration>,
    batch_size: usize,
}

/// Observes batch timings and adapts the batch-size parameter.
///
/// Batches consistently slower than the target duration shrink the next
/// batch; consistently fast batches grow it. The size always stays inside
/// the configured [min, max] bounds.
pub struct PerformanceMonitor {
    min: usize,
    max: usize,
    target: Duration,
    inner: Mutex<Inner>,
}

impl PerformanceMonitor {
    pub fn new(min: usize, max: usize, target: Duration) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        PerformanceMonitor {
            min,
            max,
            target,
            inner: Mutex::new(Inner {
                durations: VecDeque::with_capacity(WINDOW),
                batch_size: ((min + max) / 2).max(min),
            }),
        }
    }

    /// The batch size the next accumulation round should aim for.
    pub fn batch_size(&self) -> usize {
        self.inner.lock().unwrap().batch_size
    }

    /// Record one completed batch and retune.
    pub fn record_batch(&self, items: usize, took: Duration) {
        if items == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.durations.len() == WINDOW {
            inner.durations.pop_front();
        }
        inner.durations.push_back(took);

        let total: Duration = inner.durations.iter().sum();
        let avg = total / inner.durations.len() as u32;

        let before = inner.batch_size;
        if avg > self.target.mul_f64(1.25) {
            inner.batch_size = (inner.batch_size * 3 / 4).max(self.min);
        } else if avg < self.target.mul_f64(0.5) {
            let step = (inner.batch_size / 4).max(1);
            inner.batch_size = (inner.batch_size + step).min(self.max);
        }

        if inner.batch_size != before {
            debug!(
                "batch size retuned {} -> {} (avg batch {:?}, target {:?})",
                before, inner.batch_size, avg, self.target
            );
        }
    }
}
