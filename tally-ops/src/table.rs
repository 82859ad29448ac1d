//! Live window state, sharded by key hash.
//!
//! Every fold checks lateness under the shard lock it mutates. Since the
//! watermark only grows and the emitter reads it before draining, a key that
//! has been drained can never be recreated.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::Mutex;
use tally_core::{metrics, EnrichedInvoice};

use crate::time::WatermarkTracker;
use crate::window::{Window, WindowKey};

/// Running aggregate of one live window (and group).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowAccumulator {
    pub count: u64,
    pub sum_cost: f64,
    pub sum_is_return: f64,
}

impl WindowAccumulator {
    pub fn add(&mut self, inv: &EnrichedInvoice) {
        self.count += 1;
        self.sum_cost += inv.total_cost;
        self.sum_is_return += f64::from(inv.is_return);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Folded,
    /// The window was already closed by the watermark; nothing changed.
    Late,
}

type Shard = HashMap<WindowKey, WindowAccumulator>;

pub struct AggregationTable {
    shards: Vec<Mutex<Shard>>,
    hasher: RandomState,
    tracker: Arc<WatermarkTracker>,
}

impl AggregationTable {
    pub fn new(shards: usize, tracker: Arc<WatermarkTracker>) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            tracker,
        }
    }

    fn shard_of(&self, key: &WindowKey) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Fold `inv` into `key` unless the key's window is already closed.
    pub fn fold(&self, key: &WindowKey, inv: &EnrichedInvoice) -> FoldOutcome {
        let mut shard = self.shards[self.shard_of(key)].lock();
        if self.tracker.is_late(key.end()) {
            return FoldOutcome::Late;
        }
        upsert(&mut shard, key, inv);
        FoldOutcome::Folded
    }

    /// Fold `inv` into both the global key and the `group` key of `window`.
    ///
    /// Both shards are held for the lateness decision so the two streams
    /// always agree on whether the event counted.
    pub fn fold_grouped(&self, window: &Window, group: &str, inv: &EnrichedInvoice) -> FoldOutcome {
        let global = WindowKey::global(*window);
        let grouped = WindowKey::grouped(*window, group);
        let (a, b) = (self.shard_of(&global), self.shard_of(&grouped));
        if a == b {
            let mut shard = self.shards[a].lock();
            if self.tracker.is_late(window.end) {
                return FoldOutcome::Late;
            }
            upsert(&mut shard, &global, inv);
            upsert(&mut shard, &grouped, inv);
            return FoldOutcome::Folded;
        }
        // lock in index order
        let (lo, hi) = (a.min(b), a.max(b));
        let mut first = self.shards[lo].lock();
        let mut second = self.shards[hi].lock();
        if self.tracker.is_late(window.end) {
            return FoldOutcome::Late;
        }
        let (global_shard, grouped_shard) = if a == lo {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };
        upsert(global_shard, &global, inv);
        upsert(grouped_shard, &grouped, inv);
        FoldOutcome::Folded
    }

    /// Remove and return the accumulator for `key`; a zero accumulator when
    /// the window never received an event.
    pub fn drain(&self, key: &WindowKey) -> WindowAccumulator {
        match self.shards[self.shard_of(key)].lock().remove(key) {
            Some(acc) => {
                metrics::LIVE_WINDOWS.dec();
                acc
            }
            None => WindowAccumulator::default(),
        }
    }

    /// Keys whose window ended at or before `watermark_ms`, oldest first.
    pub fn closed_keys(&self, watermark_ms: i64) -> Vec<WindowKey> {
        let mut keys: Vec<WindowKey> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .keys()
                    .filter(|k| k.end().timestamp_millis() <= watermark_ms)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Remove every live accumulator regardless of the watermark, oldest first.
    pub fn drain_all(&self) -> Vec<(WindowKey, WindowAccumulator)> {
        let mut out: Vec<(WindowKey, WindowAccumulator)> =
            self.shards.iter().flat_map(|s| s.lock().drain().collect::<Vec<_>>()).collect();
        metrics::LIVE_WINDOWS.sub(out.len() as i64);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn upsert(shard: &mut Shard, key: &WindowKey, inv: &EnrichedInvoice) {
    match shard.get_mut(key) {
        Some(acc) => acc.add(inv),
        None => {
            let mut acc = WindowAccumulator::default();
            acc.add(inv);
            shard.insert(key.clone(), acc);
            metrics::LIVE_WINDOWS.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::WatermarkPolicy;
    use crate::window::WindowAssigner;
    use chrono::{DateTime, Duration, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn inv(country: &str, secs: i64, cost: f64, is_return: u8) -> EnrichedInvoice {
        EnrichedInvoice {
            invoice_no: secs,
            country: country.into(),
            event_time: at(secs),
            total_cost: cost,
            total_items: 1,
            is_order: 1 - is_return,
            is_return,
        }
    }

    fn table(shards: usize) -> (AggregationTable, Arc<WatermarkTracker>) {
        let tracker = Arc::new(WatermarkTracker::new(WatermarkPolicy::new(Duration::zero())));
        (AggregationTable::new(shards, tracker.clone()), tracker)
    }

    fn minute(secs: i64) -> Window {
        WindowAssigner::tumbling(Duration::seconds(60)).assign(at(secs)).unwrap()[0]
    }

    #[test]
    fn folds_accumulate_per_key() {
        let (t, _) = table(4);
        let w = minute(10);
        assert_eq!(t.fold_grouped(&w, "France", &inv("France", 10, 10.0, 0)), FoldOutcome::Folded);
        assert_eq!(t.fold_grouped(&w, "Spain", &inv("Spain", 40, 20.0, 0)), FoldOutcome::Folded);
        assert_eq!(t.len(), 3);

        let global = t.drain(&WindowKey::global(w));
        assert_eq!(global.count, 2);
        assert_eq!(global.sum_cost, 30.0);
        assert_eq!(global.sum_is_return, 0.0);
        let france = t.drain(&WindowKey::grouped(w, "France"));
        assert_eq!(france.count, 1);
    }

    #[test]
    fn drain_is_single_shot() {
        let (t, _) = table(2);
        let key = WindowKey::global(minute(0));
        t.fold(&key, &inv("EIRE", 0, 5.0, 1));
        assert_eq!(t.drain(&key).count, 1);
        assert_eq!(t.drain(&key), WindowAccumulator::default());
        assert!(t.is_empty());
    }

    #[test]
    fn closed_windows_reject_folds() {
        let (t, wm) = table(8);
        let w = minute(5);
        wm.observe(at(60));
        let before = t.len();
        assert_eq!(t.fold_grouped(&w, "Norway", &inv("Norway", 5, 3.0, 0)), FoldOutcome::Late);
        assert_eq!(t.fold(&WindowKey::global(w), &inv("Norway", 5, 3.0, 0)), FoldOutcome::Late);
        assert_eq!(t.len(), before);
    }

    #[test]
    fn closed_keys_are_sorted_and_bounded_by_watermark() {
        let (t, _) = table(16);
        for (secs, c) in [(130, "B"), (10, "A"), (70, "C"), (200, "A")] {
            t.fold_grouped(&minute(secs), c, &inv(c, secs, 1.0, 0));
        }
        let keys = t.closed_keys(at(180).timestamp_millis());
        assert_eq!(keys.len(), 6);
        assert!(keys.windows(2).all(|p| p[0] <= p[1]));
        assert!(keys.iter().all(|k| k.end() <= at(180)));
    }

    #[test]
    fn drain_all_empties_every_shard() {
        let (t, _) = table(3);
        for secs in [0, 60, 120] {
            t.fold_grouped(&minute(secs), "Italy", &inv("Italy", secs, 2.0, 0));
        }
        let all = t.drain_all();
        assert_eq!(all.len(), 6);
        assert!(t.is_empty());
    }

    #[test]
    fn concurrent_folds_lose_nothing() {
        let (t, _) = table(4);
        let t = Arc::new(t);
        let w = minute(0);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let t = t.clone();
                std::thread::spawn(move || {
                    let country = format!("C{i}");
                    for _ in 0..500 {
                        t.fold_grouped(&w, &country, &inv(&country, 1, 1.0, 0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.drain(&WindowKey::global(w)).count, 2_000);
        assert_eq!(t.drain(&WindowKey::grouped(w, "C3")).count, 500);
    }
}
