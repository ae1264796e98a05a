//! Process-wide runtime counters.
//!
//! Plain counters track totals; labelled series are keyed by route (or by
//! pool name for pool rejections).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Default)]
pub struct MetricsCollector {
    idempotent_duplicates: AtomicU64,
    saga_completed: AtomicU64,
    saga_compensated: AtomicU64,
    exchanges_completed: Series,
    exchanges_failed: Series,
    redeliveries: Series,
    throttle_rejections: Series,
    pool_rejections: Series,
    fanout_timeouts: Series,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub idempotent_duplicates: u64,
    pub saga_completed: u64,
    pub saga_compensated: u64,
    pub exchanges_completed: BTreeMap<String, u64>,
    pub exchanges_failed: BTreeMap<String, u64>,
    pub redeliveries: BTreeMap<String, u64>,
    pub throttle_rejections: BTreeMap<String, u64>,
    pub pool_rejections: BTreeMap<String, u64>,
    pub fanout_timeouts: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Total of `series` under `label`, zero when never recorded.
    pub fn count(series: &BTreeMap<String, u64>, label: &str) -> u64 {
        series.get(label).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Series(Mutex<BTreeMap<String, u64>>);

impl Series {
    fn record(&self, label: &str) {
        let mut totals = self.0.lock().unwrap_or_else(|err| err.into_inner());
        let total = totals.entry(label.to_string()).or_default();
        *total = total.saturating_add(1);
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.0.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }
}

impl MetricsCollector {
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::default)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            idempotent_duplicates: self.idempotent_duplicates.load(Ordering::Relaxed),
            saga_completed: self.saga_completed.load(Ordering::Relaxed),
            saga_compensated: self.saga_compensated.load(Ordering::Relaxed),
            exchanges_completed: self.exchanges_completed.snapshot(),
            exchanges_failed: self.exchanges_failed.snapshot(),
            redeliveries: self.redeliveries.snapshot(),
            throttle_rejections: self.throttle_rejections.snapshot(),
            pool_rejections: self.pool_rejections.snapshot(),
            fanout_timeouts: self.fanout_timeouts.snapshot(),
        }
    }

    pub fn record_exchange_completed(&self, route: &str) {
        self.exchanges_completed.record(route);
    }

    pub fn record_exchange_failed(&self, route: &str) {
        self.exchanges_failed.record(route);
    }

    pub fn record_redelivery(&self, route: &str) {
        self.redeliveries.record(route);
    }

    pub fn record_throttle_rejection(&self, route: &str) {
        self.throttle_rejections.record(route);
    }

    pub fn record_pool_rejection(&self, pool: &str) {
        self.pool_rejections.record(pool);
    }

    pub fn record_fanout_timeout(&self, route: &str) {
        self.fanout_timeouts.record(route);
    }

    pub fn inc_idempotent_duplicate(&self) {
        self.idempotent_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saga_completed(&self) {
        self.saga_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saga_compensated(&self) {
        self.saga_compensated.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
