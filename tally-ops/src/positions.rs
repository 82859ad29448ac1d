//! Source positions that are safe to acknowledge.
//!
//! An event is safe to skip on restart once every window it was folded
//! into is durable in the sinks. Until then its offset holds back the
//! partition's resume position.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct SourcePositions {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// partition -> last window end (ms) -> lowest offset waiting on it
    open: HashMap<u32, BTreeMap<i64, i64>>,
    /// partition -> offset after the highest one processed
    next: HashMap<u32, i64>,
}

impl SourcePositions {
    /// Mark `offset` as processed without holding any window.
    pub fn advance(&self, partition: u32, offset: i64) {
        let mut g = self.inner.lock();
        let next = g.next.entry(partition).or_insert(offset + 1);
        *next = (*next).max(offset + 1);
    }

    /// Mark `offset` as processed and held until the window ending at
    /// `last_end` is durable.
    pub fn hold(&self, partition: u32, offset: i64, last_end: DateTime<Utc>) {
        let mut g = self.inner.lock();
        let low = g
            .open
            .entry(partition)
            .or_default()
            .entry(last_end.timestamp_millis())
            .or_insert(offset);
        *low = (*low).min(offset);
        let next = g.next.entry(partition).or_insert(offset + 1);
        *next = (*next).max(offset + 1);
    }

    /// Per partition, the offset to resume from once every window ending at
    /// or before `through` is durable. Holds on those windows are released.
    pub fn durable_through(&self, through: DateTime<Utc>) -> BTreeMap<u32, i64> {
        let cut = through.timestamp_millis().saturating_add(1);
        let mut g = self.inner.lock();
        let Inner { open, next } = &mut *g;
        let mut out = BTreeMap::new();
        for (&partition, &n) in next.iter() {
            let held = match open.get_mut(&partition) {
                Some(ends) => {
                    *ends = ends.split_off(&cut);
                    ends.values().copied().min()
                }
                None => None,
            };
            out.insert(partition, held.map_or(n, |low| low.min(n)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn open_windows_hold_back_the_partition() {
        let p = SourcePositions::default();
        p.hold(0, 10, at(60));
        p.hold(0, 11, at(120));
        p.hold(0, 12, at(60));
        p.advance(1, 3);
        let safe = p.durable_through(at(60));
        // offset 11 still waits on [60,120)
        assert_eq!(safe.get(&0), Some(&11));
        assert_eq!(safe.get(&1), Some(&4));
        assert_eq!(p.durable_through(at(120)).get(&0), Some(&13));
    }

    #[test]
    fn undecodable_messages_still_advance() {
        let p = SourcePositions::default();
        p.hold(2, 5, at(60));
        p.advance(2, 6);
        p.advance(2, 7);
        assert_eq!(p.durable_through(at(0)).get(&2), Some(&5));
        assert_eq!(p.durable_through(at(60)).get(&2), Some(&8));
    }

    #[test]
    fn nothing_processed_means_nothing_to_report() {
        let p = SourcePositions::default();
        assert!(p.durable_through(at(600)).is_empty());
    }
}
