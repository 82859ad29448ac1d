use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAssigner {
    Tumbling { size: Duration },
    Sliding { size: Duration, slide: Duration },
}

/// Half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub(crate) fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Stable identity used as the idempotency key of the global stream.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// A live aggregation slot: a window, optionally narrowed to one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub window: Window,
    pub group: Option<String>,
}

impl WindowKey {
    pub fn global(window: Window) -> Self {
        Self { window, group: None }
    }

    pub fn grouped(window: Window, group: impl Into<String>) -> Self {
        Self {
            window,
            group: Some(group.into()),
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.window.end
    }

    pub fn sink_key(&self) -> String {
        match &self.group {
            Some(g) => format!("{}/{}", self.window.key(), g),
            None => self.window.key(),
        }
    }
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn span(start_ms: i64, size_ms: i64) -> Option<Window> {
    Some(Window {
        start: from_ms(start_ms)?,
        end: from_ms(start_ms.checked_add(size_ms)?)?,
    })
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Self {
        WindowAssigner::Tumbling { size }
    }

    pub fn sliding(size: Duration, slide: Duration) -> Self {
        if slide >= size {
            WindowAssigner::Tumbling { size }
        } else {
            WindowAssigner::Sliding { size, slide }
        }
    }

    pub fn size(&self) -> Duration {
        match *self {
            WindowAssigner::Tumbling { size } | WindowAssigner::Sliding { size, .. } => size,
        }
    }

    /// Distance between consecutive window starts.
    pub fn slide(&self) -> Duration {
        match *self {
            WindowAssigner::Tumbling { size } => size,
            WindowAssigner::Sliding { slide, .. } => slide,
        }
    }

    /// All windows containing `ts`, oldest first. `None` when a bound of one
    /// of them is outside the representable time range.
    pub fn assign(&self, ts: DateTime<Utc>) -> Option<Vec<Window>> {
        let ts_ms = ts.timestamp_millis();
        match *self {
            WindowAssigner::Tumbling { size } => {
                let size_ms = size.num_milliseconds();
                let start_ms = ts_ms.div_euclid(size_ms) * size_ms;
                Some(vec![span(start_ms, size_ms)?])
            }
            WindowAssigner::Sliding { size, slide } => {
                let size_ms = size.num_milliseconds();
                let slide_ms = slide.num_milliseconds();
                let k = (size_ms + slide_ms - 1) / slide_ms;
                let anchor_ms = ts_ms.div_euclid(slide_ms) * slide_ms;
                let mut out = Vec::new();
                for j in (0..k).rev() {
                    let w = span(anchor_ms - j * slide_ms, size_ms)?;
                    if w.contains(ts) {
                        out.push(w);
                    }
                }
                Some(out)
            }
        }
    }

    /// The window that starts at `start`.
    pub fn window_at(&self, start: DateTime<Utc>) -> Option<Window> {
        Some(Window {
            start,
            end: start.checked_add_signed(self.size())?,
        })
    }

    /// Latest window end that is `<= ts`; window ends fall on multiples of
    /// the slide when the size is a multiple of it.
    pub fn last_end_at_or_before(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let slide_ms = self.slide().num_milliseconds();
        from_ms(ts.timestamp_millis().div_euclid(slide_ms) * slide_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn tumbling_assigns_single_floor_window() {
        let a = WindowAssigner::tumbling(Duration::seconds(60));
        let wins = a.assign(at(1_700_000_010)).unwrap();
        assert_eq!(wins.len(), 1);
        assert_eq!(wins[0].start, at(1_699_999_980));
        assert_eq!(wins[0].end, at(1_700_000_040));
    }

    #[test]
    fn tumbling_boundary_belongs_to_next_window() {
        let a = WindowAssigner::tumbling(Duration::seconds(60));
        let w = a.assign(at(120)).unwrap()[0];
        assert_eq!((w.start, w.end), (at(120), at(180)));
    }

    #[test]
    fn tumbling_floors_pre_epoch_times() {
        let a = WindowAssigner::tumbling(Duration::seconds(60));
        let w = a.assign(at(-30)).unwrap()[0];
        assert_eq!((w.start, w.end), (at(-60), at(0)));
    }

    #[test]
    fn sliding_returns_every_covering_window() {
        let a = WindowAssigner::sliding(Duration::seconds(60), Duration::seconds(15));
        let t = at(1_700_000_030);
        let wins = a.assign(t).unwrap();
        assert_eq!(wins.len(), 4);
        assert!(wins.iter().all(|w| w.contains(t)));
        assert!(wins.iter().all(|w| w.start.timestamp() % 15 == 0));
        // oldest first
        assert!(wins.windows(2).all(|p| p[0].start < p[1].start));
    }

    #[test]
    fn sliding_with_slide_equal_to_size_is_tumbling() {
        let a = WindowAssigner::sliding(Duration::seconds(60), Duration::seconds(60));
        assert_eq!(a, WindowAssigner::tumbling(Duration::seconds(60)));
    }

    #[test]
    fn keys_distinguish_groups() {
        let w = WindowAssigner::tumbling(Duration::seconds(60)).assign(at(0)).unwrap()[0];
        assert_eq!(w.key(), "1970-01-01T00:00:00.000Z/1970-01-01T00:01:00.000Z");
        assert_ne!(WindowKey::global(w), WindowKey::grouped(w, "France"));
        assert_eq!(
            WindowKey::grouped(w, "France").sink_key(),
            "1970-01-01T00:00:00.000Z/1970-01-01T00:01:00.000Z/France"
        );
    }

    #[test]
    fn last_end_snaps_to_slide() {
        let a = WindowAssigner::sliding(Duration::seconds(60), Duration::seconds(15));
        assert_eq!(a.last_end_at_or_before(at(44)), Some(at(30)));
        assert_eq!(a.last_end_at_or_before(at(45)), Some(at(45)));
    }

    #[test]
    fn windows_past_the_time_range_are_not_assigned() {
        let tumbling = WindowAssigner::tumbling(Duration::seconds(60));
        assert_eq!(tumbling.assign(DateTime::<Utc>::MAX_UTC), None);
        let sliding = WindowAssigner::sliding(Duration::minutes(5), Duration::minutes(1));
        assert_eq!(sliding.assign(DateTime::<Utc>::MIN_UTC), None);
        assert_eq!(tumbling.window_at(DateTime::<Utc>::MAX_UTC), None);
    }
}
