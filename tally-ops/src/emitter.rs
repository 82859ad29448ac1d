//! Drains closed windows and forwards finalized KPI records.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tally_core::{metrics, CheckpointMeta, Error, Result};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::kpi;
use crate::positions::SourcePositions;
use crate::sink_task::SinkCommand;
use crate::stats::PipelineStats;
use crate::table::{AggregationTable, WindowAccumulator};
use crate::time::WatermarkTracker;
use crate::window::{WindowAssigner, WindowKey};

#[derive(Debug, Clone, Copy)]
pub struct EmitterConfig {
    /// Emit zero-valued global windows for minutes without events.
    pub emit_empty_windows: bool,
    /// Most empty windows emitted by a single tick; older gaps are skipped.
    pub max_empty_windows: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            emit_empty_windows: true,
            max_empty_windows: 1440,
        }
    }
}

/// Output side of one stream.
///
/// Once its consumer is gone the stream is marked closed and skipped, so
/// the remaining streams keep receiving their results.
pub struct StreamOutput {
    pub name: String,
    label: &'static str,
    tx: mpsc::Sender<SinkCommand>,
    closed: bool,
}

impl StreamOutput {
    pub fn new(
        name: impl Into<String>,
        label: &'static str,
        tx: mpsc::Sender<SinkCommand>,
    ) -> Self {
        Self {
            name: name.into(),
            label,
            tx,
            closed: false,
        }
    }

    async fn send(&mut self, cmd: SinkCommand) -> bool {
        if self.closed {
            return false;
        }
        if self.tx.send(cmd).await.is_err() {
            warn!(stream = %self.name, "output stream closed, skipping it from now on");
            self.closed = true;
        }
        !self.closed
    }
}

pub struct WindowEmitter {
    table: Arc<AggregationTable>,
    tracker: Arc<WatermarkTracker>,
    assigner: WindowAssigner,
    global: StreamOutput,
    country: StreamOutput,
    /// Flushed on every tick and checkpointed with the windowed streams.
    raw: Option<StreamOutput>,
    positions: Arc<SourcePositions>,
    cfg: EmitterConfig,
    stats: Arc<PipelineStats>,
    /// Start of the next global window to emit.
    next_global: Option<DateTime<Utc>>,
    /// Windows ending at or before these were made durable by a previous run.
    global_done: Option<DateTime<Utc>>,
    country_done: Option<DateTime<Utc>>,
    committed: Option<DateTime<Utc>>,
}

impl WindowEmitter {
    pub fn new(
        table: Arc<AggregationTable>,
        tracker: Arc<WatermarkTracker>,
        assigner: WindowAssigner,
        global: StreamOutput,
        country: StreamOutput,
        cfg: EmitterConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            table,
            tracker,
            assigner,
            global,
            country,
            raw: None,
            positions: Arc::new(SourcePositions::default()),
            cfg,
            stats,
            next_global: None,
            global_done: None,
            country_done: None,
            committed: None,
        }
    }

    pub fn with_raw(mut self, raw: StreamOutput) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Source positions recorded by the ingest workers; checkpoints carry
    /// the offsets they report as durable.
    pub fn with_positions(mut self, positions: Arc<SourcePositions>) -> Self {
        self.positions = positions;
        self
    }

    /// Continue after checkpointed progress: windows at or before a stream's
    /// checkpoint are never emitted again on that stream.
    pub fn resume(&mut self, global: Option<&CheckpointMeta>, country: Option<&CheckpointMeta>) {
        if let Some(cp) = global {
            self.global_done = Some(cp.last_closed_end);
            self.next_global = cp
                .last_closed_end
                .checked_sub_signed(self.assigner.size())
                .and_then(|t| t.checked_add_signed(self.assigner.slide()));
        }
        if let Some(cp) = country {
            self.country_done = Some(cp.last_closed_end);
        }
    }

    /// Emit every window closed by the current watermark. Returns the number
    /// of records sent.
    pub async fn tick(&mut self) -> Result<usize> {
        let Some(wm) = self.tracker.watermark() else {
            return Ok(0);
        };
        metrics::LAG_WATERMARK_MS.set((Utc::now() - wm).num_milliseconds());
        let Some(through) = self.assigner.last_end_at_or_before(wm) else {
            return Ok(0);
        };
        let closed = self.table.closed_keys(wm.timestamp_millis());
        let keys = self.with_empty_windows(closed, through);
        let batch: Vec<(WindowKey, WindowAccumulator)> = keys
            .into_iter()
            .map(|k| {
                let acc = self.table.drain(&k);
                (k, acc)
            })
            .collect();
        let sent = self.emit(batch, through, wm).await?;
        if let Some(raw) = self.raw.as_mut() {
            raw.send(SinkCommand::Flush).await;
        }
        Ok(sent)
    }

    /// Emit everything still live, ignoring the watermark. Used once at shutdown.
    pub async fn flush_all(&mut self) -> Result<usize> {
        let mut sent = self.tick().await?;
        let rest = self.table.drain_all();
        let Some(through) = rest.iter().map(|(k, _)| k.end()).max() else {
            return Ok(sent);
        };
        let wm = self.tracker.watermark().map_or(through, |w| w.max(through));
        let keys = self.with_empty_windows(rest.iter().map(|(k, _)| k.clone()).collect(), through);
        let mut accs: HashMap<WindowKey, WindowAccumulator> = rest.into_iter().collect();
        let batch = keys
            .into_iter()
            .map(|k| {
                let acc = accs.remove(&k).unwrap_or_default();
                (k, acc)
            })
            .collect();
        sent += self.emit(batch, through, wm).await?;
        Ok(sent)
    }

    /// Add zero-valued global windows between the cursor and `through`.
    fn with_empty_windows(&self, keys: Vec<WindowKey>, through: DateTime<Utc>) -> Vec<WindowKey> {
        let mut set: BTreeSet<WindowKey> = keys.into_iter().collect();
        if !self.cfg.emit_empty_windows {
            return set.into_iter().collect();
        }
        let first = self
            .next_global
            .or_else(|| set.iter().find(|k| k.group.is_none()).map(|k| k.window.start));
        let Some(mut start) = first else {
            return set.into_iter().collect();
        };
        let Some(last_start) = through.checked_sub_signed(self.assigner.size()) else {
            return set.into_iter().collect();
        };
        if start > last_start {
            return set.into_iter().collect();
        }
        let slide = self.assigner.slide();
        let slide_ms = slide.num_milliseconds();
        let pending = (last_start - start).num_milliseconds() / slide_ms + 1;
        let cap = self.cfg.max_empty_windows as i64;
        if pending > cap {
            let skipped = pending - cap;
            warn!(skipped, "empty window gap exceeds max_empty_windows, skipping ahead");
            match start.checked_add_signed(Duration::milliseconds(skipped * slide_ms)) {
                Some(s) => start = s,
                None => return set.into_iter().collect(),
            }
        }
        while start <= last_start {
            let Some(window) = self.assigner.window_at(start) else { break };
            set.insert(WindowKey::global(window));
            let Some(next) = start.checked_add_signed(slide) else { break };
            start = next;
        }
        set.into_iter().collect()
    }

    async fn emit(
        &mut self,
        batch: Vec<(WindowKey, WindowAccumulator)>,
        through: DateTime<Utc>,
        wm: DateTime<Utc>,
    ) -> Result<usize> {
        let mut sent = 0;
        for (key, acc) in batch {
            let is_global = key.group.is_none();
            let floor = if is_global { self.global_done } else { self.country_done };
            if floor.is_some_and(|f| key.end() <= f) {
                continue;
            }
            let record = kpi::to_record(&key, &acc)?;
            let (out, counter) = if is_global {
                (&mut self.global, &self.stats.global_emitted)
            } else {
                (&mut self.country, &self.stats.country_emitted)
            };
            debug!(stream = %out.name, key = %key.sink_key(), opm = acc.count, "window emitted");
            if !out.send(SinkCommand::Write(record)).await {
                continue;
            }
            metrics::WINDOWS_EMITTED.with_label_values(&[&out.name]).inc();
            PipelineStats::incr(counter);
            sent += 1;
            if is_global {
                if let Some(next) = key.window.start.checked_add_signed(self.assigner.slide()) {
                    self.next_global = Some(self.next_global.map_or(next, |c| c.max(next)));
                }
            }
        }
        if sent > 0 || self.committed.is_some_and(|c| through > c) {
            self.commit(through, wm).await;
        }
        Ok(sent)
    }

    async fn commit(&mut self, through: DateTime<Utc>, wm: DateTime<Utc>) {
        if self.committed.is_some_and(|c| through <= c) {
            return;
        }
        let offsets = self.positions.durable_through(through);
        let outputs = [Some(&mut self.global), Some(&mut self.country), self.raw.as_mut()];
        for out in outputs.into_iter().flatten() {
            let meta = CheckpointMeta {
                stream: out.name.clone(),
                last_closed_end: through,
                watermark: wm,
                source_offsets: offsets.clone(),
            };
            out.send(SinkCommand::Commit(meta)).await;
        }
        self.committed = Some(through);
    }

    fn closed_stream(&self) -> Option<&'static str> {
        [Some(&self.global), Some(&self.country), self.raw.as_ref()]
            .into_iter()
            .flatten()
            .find(|out| out.closed)
            .map(|out| out.label)
    }

    /// Tick on a wall-clock aligned interval and whenever `wake` fires, until
    /// `stop` is cancelled; then flush all remaining windows. A stream whose
    /// consumer went away fails the run only after the others were flushed.
    #[instrument(name = "window_emitter", skip_all)]
    pub async fn run(
        mut self,
        trigger: std::time::Duration,
        wake: Arc<Notify>,
        stop: CancellationToken,
    ) -> Result<()> {
        let period_ms = (trigger.as_millis() as i64).max(1);
        let until_boundary = period_ms - Utc::now().timestamp_millis().rem_euclid(period_ms);
        let first =
            tokio::time::Instant::now() + std::time::Duration::from_millis(until_boundary as u64);
        let mut ticker = tokio::time::interval_at(first, trigger);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }
            self.tick().await?;
        }
        let flushed = self.flush_all().await?;
        info!(windows = flushed, "final flush complete");
        match self.closed_stream() {
            Some(label) => Err(Error::ChannelClosed(label)),
            None => Ok(()),
        }
    }
}
