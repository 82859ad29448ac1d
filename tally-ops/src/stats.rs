use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-pipeline counters. The prometheus metrics are process-wide; these
/// belong to one `Pipeline::run` and are returned from it.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub late_events: AtomicU64,
    pub folded: AtomicU64,
    pub raw_written: AtomicU64,
    pub global_emitted: AtomicU64,
    pub country_emitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    pub late_events: u64,
    pub folded: u64,
    pub raw_written: u64,
    pub global_emitted: u64,
    pub country_emitted: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: get(&self.received),
            decoded: get(&self.decoded),
            decode_errors: get(&self.decode_errors),
            late_events: get(&self.late_events),
            folded: get(&self.folded),
            raw_written: get(&self.raw_written),
            global_emitted: get(&self.global_emitted),
            country_emitted: get(&self.country_emitted),
        }
    }
}
