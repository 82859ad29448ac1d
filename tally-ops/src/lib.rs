//! tally-ops: the windowed aggregation core and the pipeline runtime.
//!
//! Stages, leaf first:
//! - `derive`: per-invoice metrics from a decoded event
//! - `WindowAssigner`: event time to tumbling or sliding windows
//! - `WatermarkTracker`: lock-free monotonic watermark, decides lateness
//! - `AggregationTable`: sharded live accumulators per window and country
//! - `WindowEmitter`: drains closed windows into the KPI streams
//! - `SourcePositions`: source offsets that are safe to acknowledge
//! - `Pipeline`: workers, emitter and sink tasks wired with bounded channels

pub mod derive;
pub mod emitter;
pub mod kpi;
pub mod pipeline;
pub mod positions;
pub mod sink_task;
pub mod stats;
pub mod table;
pub mod time;
pub mod window;
pub mod worker;

pub use derive::derive;
pub use emitter::{EmitterConfig, StreamOutput, WindowEmitter};
pub use kpi::{CountryKpi, GlobalKpi, WindowSpan};
pub use pipeline::{Pipeline, PipelineOptions, StreamNames};
pub use positions::SourcePositions;
pub use sink_task::{Backoff, SinkCommand, SinkTask};
pub use stats::{PipelineStats, StatsSnapshot};
pub use table::{AggregationTable, FoldOutcome, WindowAccumulator};
pub use time::{Advance, WatermarkPolicy, WatermarkTracker};
pub use window::{Window, WindowAssigner, WindowKey};
pub use worker::IngestWorker;
