use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tapvault_types::Action;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct ActionCounters {
    ok: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionCountSnapshot {
    pub action: &'static str,
    pub ok: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionMetricsSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub failed: u64,
    pub audit_failures: u64,
    pub conflicts: u64,
    pub actions: Vec<ActionCountSnapshot>,
    pub dispatch: LatencySnapshot,
}

/// Counters for the action endpoint. `rejected` counts 4xx outcomes,
/// `failed` counts 5xx outcomes.
#[derive(Default)]
pub struct ActionMetrics {
    requests: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    audit_failures: AtomicU64,
    conflicts: AtomicU64,
    actions: [ActionCounters; Action::ALL.len()],
    dispatch: LatencyMetrics,
}

impl ActionMetrics {
    pub fn inc_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self, action: Action, ok: bool) {
        let counters = &self.actions[action.index()];
        if ok {
            counters.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch(&self, duration: Duration) {
        self.dispatch.record(duration);
    }

    pub fn snapshot(&self) -> ActionMetricsSnapshot {
        ActionMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            actions: Action::ALL
                .iter()
                .map(|action| {
                    let counters = &self.actions[action.index()];
                    ActionCountSnapshot {
                        action: action.as_str(),
                        ok: counters.ok.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            dispatch: self.dispatch.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_lands_in_first_fitting_bucket() {
        let metrics = LatencyMetrics::default();
        metrics.record(Duration::from_millis(3));
        metrics.record(Duration::from_millis(7_000));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counts[2], 1);
        assert_eq!(snapshot.overflow, 1);
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.max_ms, 7_000);
    }

    #[test]
    fn per_action_counts() {
        let metrics = ActionMetrics::default();
        metrics.record_action(Action::WatchAd, true);
        metrics.record_action(Action::WatchAd, false);
        metrics.record_action(Action::Spin, true);
        let snapshot = metrics.snapshot();
        let watch_ad = &snapshot.actions[Action::WatchAd.index()];
        assert_eq!(watch_ad.action, "watchAd");
        assert_eq!((watch_ad.ok, watch_ad.failed), (1, 1));
        assert_eq!(snapshot.actions[Action::Spin.index()].ok, 1);
    }
}
