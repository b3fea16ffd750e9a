use std::time::{Duration, Instant};

use crate::transport::ResourceUsage;

/// A point-in-time sample of per-worker CPU utilization, produced by
/// [`crate::Listener::request_load`].
#[derive(Debug, Clone)]
pub struct Load {
    pub tick: Instant,
    pub raw: Vec<ResourceUsage>,
    pub workers: Vec<f64>,
    pub global: f64,
}

impl Load {
    /// An empty snapshot suitable as the `previous` argument to the very
    /// first `request_load` call.
    pub fn empty() -> Self {
        Load {
            tick: Instant::now(),
            raw: Vec::new(),
            workers: Vec::new(),
            global: 0.0,
        }
    }
}

impl Default for Load {
    fn default() -> Self {
        Load::empty()
    }
}

/// Pure computation step of `request_load` (§4.E step 5–7): given the
/// previous snapshot, the freshly sampled usages, and the current instant,
/// produce the new [`Load`].
///
/// Kept separate from the future-aggregation machinery in `listener.rs` so
/// the arithmetic itself is trivially unit-testable.
pub(crate) fn compute_load(previous: &Load, usages: Vec<ResourceUsage>, now: Instant) -> Load {
    if previous.raw.is_empty() {
        let workers = vec![0.0; usages.len()];
        return Load {
            tick: now,
            raw: usages,
            workers,
            global: 0.0,
        };
    }

    let delta_t = duration_micros(now.saturating_duration_since(previous.tick));

    let mut workers = Vec::with_capacity(usages.len());
    let mut global = 0.0f64;

    for (i, usage) in usages.iter().enumerate() {
        let used = if let Some(prev) = previous.raw.get(i) {
            usage.total_micros().saturating_sub(prev.total_micros())
        } else {
            0
        };
        let pct = if delta_t > 0 {
            100.0 * (used as f64) / (delta_t as f64)
        } else {
            0.0
        };
        workers.push(pct);
        global += pct;
    }

    let n = workers.len().max(1) as f64;
    global /= n;

    Load {
        tick: now,
        raw: usages,
        workers,
        global,
    }
}

fn duration_micros(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(user: u64, sys: u64) -> ResourceUsage {
        ResourceUsage {
            user_micros: user,
            system_micros: sys,
        }
    }

    #[test]
    fn first_sample_is_all_zero() {
        let previous = Load::empty();
        let now = Instant::now();
        let load = compute_load(&previous, vec![usage(10, 5), usage(20, 0)], now);
        assert_eq!(load.workers, vec![0.0, 0.0]);
        assert_eq!(load.global, 0.0);
        assert_eq!(load.raw.len(), 2);
    }

    #[test]
    fn global_is_mean_of_workers() {
        let previous = Load {
            tick: Instant::now() - Duration::from_millis(100),
            raw: vec![usage(0, 0), usage(0, 0)],
            workers: vec![0.0, 0.0],
            global: 0.0,
        };
        let now = previous.tick + Duration::from_millis(100);
        // worker 0 used 100_000us out of 100_000us window -> 100%
        // worker 1 used 0us -> 0%
        let load = compute_load(&previous, vec![usage(100_000, 0), usage(0, 0)], now);
        assert!((load.workers[0] - 100.0).abs() < 0.5);
        assert!((load.workers[1] - 0.0).abs() < 0.5);
        let mean = load.workers.iter().sum::<f64>() / load.workers.len() as f64;
        assert!((load.global - mean).abs() < 1e-9);
    }

    #[test]
    fn busy_worker_reads_higher_than_idle_worker() {
        let previous = Load {
            tick: Instant::now() - Duration::from_millis(50),
            raw: vec![usage(1_000, 0), usage(1_000, 0)],
            workers: vec![0.0, 0.0],
            global: 0.0,
        };
        let now = previous.tick + Duration::from_millis(50);
        // worker 0 stayed idle, worker 1 burned 40ms of cpu time.
        let load = compute_load(&previous, vec![usage(1_000, 0), usage(41_000, 0)], now);
        assert!(load.workers[1] > load.workers[0]);
    }
}
