use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

/// Policy that defines how to compute watermarks.
/// watermark = max_observed_event_time - allowed_lateness
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
    pub allowed_lateness: Duration,
}

impl WatermarkPolicy {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self { allowed_lateness }
    }
}

/// Result of one `observe` call, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub previous: i64,
    pub current: i64,
}

impl Advance {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }

    /// Whether some multiple of `slide_ms` (a window end) now lies in
    /// `(previous, current]`.
    pub fn crossed_boundary(&self, slide_ms: i64) -> bool {
        if !self.advanced() {
            return false;
        }
        if self.previous == WatermarkTracker::UNSET {
            return true;
        }
        self.current.div_euclid(slide_ms) > self.previous.div_euclid(slide_ms)
    }
}

/// Process-wide event-time watermark.
///
/// Writers advance it with a compare-and-set loop; readers never block. The
/// value only ever grows.
#[derive(Debug)]
pub struct WatermarkTracker {
    policy: WatermarkPolicy,
    wm_ms: AtomicI64,
}

impl WatermarkTracker {
    /// Sentinel for "no event observed yet".
    pub const UNSET: i64 = i64::MIN;

    pub fn new(policy: WatermarkPolicy) -> Self {
        Self {
            policy,
            wm_ms: AtomicI64::new(Self::UNSET),
        }
    }

    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    pub fn observe(&self, ts: DateTime<Utc>) -> Advance {
        let candidate = ts
            .timestamp_millis()
            .saturating_sub(self.policy.allowed_lateness.num_milliseconds());
        self.raise_to(candidate)
    }

    /// Resume from a checkpointed boundary.
    pub fn restore(&self, wm: DateTime<Utc>) -> Advance {
        self.raise_to(wm.timestamp_millis())
    }

    fn raise_to(&self, candidate: i64) -> Advance {
        let mut current = self.wm_ms.load(Ordering::Acquire);
        loop {
            if candidate <= current {
                return Advance {
                    previous: current,
                    current,
                };
            }
            match self
                .wm_ms
                .compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => {
                    return Advance {
                        previous: prev,
                        current: candidate,
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn watermark_ms(&self) -> i64 {
        self.wm_ms.load(Ordering::Acquire)
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark_ms() {
            Self::UNSET => None,
            ms => DateTime::<Utc>::from_timestamp_millis(ms),
        }
    }

    /// A window ending at `window_end` is closed once the watermark reached it.
    pub fn is_late(&self, window_end: DateTime<Utc>) -> bool {
        window_end.timestamp_millis() <= self.watermark_ms()
    }
}
