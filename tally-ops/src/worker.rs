use std::sync::Arc;

use tally_core::{decode_event, metrics, DecodeError, Error, RawMessage, Record, Result};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, instrument, warn};

use crate::derive::derive;
use crate::positions::SourcePositions;
use crate::sink_task::SinkCommand;
use crate::stats::PipelineStats;
use crate::table::{AggregationTable, FoldOutcome};
use crate::time::WatermarkTracker;
use crate::window::WindowAssigner;

/// Ingestion worker for one share of the source partitions.
///
/// Runs decode, derive, raw forward, window fold and watermark advance for
/// each message in order. Workers never wait on each other; the only shared
/// state is the aggregation table, the watermark and the source positions.
pub struct IngestWorker {
    pub id: usize,
    pub assigner: WindowAssigner,
    pub table: Arc<AggregationTable>,
    pub tracker: Arc<WatermarkTracker>,
    pub positions: Arc<SourcePositions>,
    pub raw_tx: mpsc::Sender<SinkCommand>,
    pub wake: Arc<Notify>,
    pub stats: Arc<PipelineStats>,
}

impl IngestWorker {
    pub async fn process(&self, msg: RawMessage) -> Result<()> {
        PipelineStats::incr(&self.stats.received);
        metrics::RECORDS.with_label_values(&["received"]).inc();
        let event = match decode_event(&msg.payload) {
            Ok(ev) => ev,
            Err(e) => {
                self.reject(&msg, e);
                return Ok(());
            }
        };
        let Some(windows) = self.assigner.assign(event.event_time) else {
            self.reject(&msg, DecodeError::Timestamp(event.event_time.to_rfc3339()));
            return Ok(());
        };
        PipelineStats::incr(&self.stats.decoded);
        let inv = derive(&event);

        let raw = Record::new(inv.event_time, serde_json::to_value(&inv)?);
        self.raw_tx
            .send(SinkCommand::Write(raw))
            .await
            .map_err(|_| Error::ChannelClosed("raw"))?;
        PipelineStats::incr(&self.stats.raw_written);
        metrics::RECORDS.with_label_values(&["raw"]).inc();

        if let (Some(offset), Some(last)) = (msg.offset, windows.last()) {
            self.positions.hold(msg.partition, offset, last.end);
        }
        let mut folded = false;
        for window in &windows {
            if self.table.fold_grouped(window, &inv.country, &inv) == FoldOutcome::Folded {
                folded = true;
            }
        }
        if folded {
            PipelineStats::incr(&self.stats.folded);
            metrics::RECORDS.with_label_values(&["folded"]).inc();
        } else {
            PipelineStats::incr(&self.stats.late_events);
            metrics::LATE_EVENTS.inc();
            debug!(invoice_no = inv.invoice_no, event_time = %inv.event_time, "late event dropped");
        }

        let advance = self.tracker.observe(inv.event_time);
        if advance.crossed_boundary(self.assigner.slide().num_milliseconds()) {
            self.wake.notify_one();
        }
        Ok(())
    }

    fn reject(&self, msg: &RawMessage, e: DecodeError) {
        warn!(
            partition = msg.partition,
            offset = ?msg.offset,
            error = %e,
            "dropping undecodable payload"
        );
        metrics::DECODE_ERRORS.inc();
        PipelineStats::incr(&self.stats.decode_errors);
        if let Some(offset) = msg.offset {
            self.positions.advance(msg.partition, offset);
        }
    }

    #[instrument(name = "ingest_worker", skip_all, fields(worker = self.id))]
    pub async fn run(self, mut rx: mpsc::Receiver<RawMessage>) -> Result<()> {
        info!("worker started");
        while let Some(msg) = rx.recv().await {
            self.process(msg).await?;
        }
        info!("worker exiting");
        Ok(())
    }
}
