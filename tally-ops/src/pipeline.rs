//! Stage wiring: source -> ingest workers -> aggregation table -> emitter,
//! with one consumer task per output stream.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tally_core::config::PipelineConfig;
use tally_core::{CheckpointStore, Context, Error, KvState, RawMessage, Result, Sink, Source};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::emitter::{EmitterConfig, StreamOutput, WindowEmitter};
use crate::positions::SourcePositions;
use crate::sink_task::SinkTask;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::table::AggregationTable;
use crate::time::{WatermarkPolicy, WatermarkTracker};
use crate::window::WindowAssigner;
use crate::worker::IngestWorker;

#[derive(Debug, Clone)]
pub struct StreamNames {
    pub raw: String,
    pub global: String,
    pub country: String,
}

impl Default for StreamNames {
    fn default() -> Self {
        Self {
            raw: "raw".into(),
            global: "time-kpi".into(),
            country: "country-time-kpi".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub assigner: WindowAssigner,
    pub allowed_lateness: Duration,
    pub trigger_interval: std::time::Duration,
    pub channel_capacity: usize,
    pub shards: usize,
    /// Ingest worker count; defaults to the source's partition count.
    pub workers: Option<usize>,
    pub emitter: EmitterConfig,
    pub streams: StreamNames,
    pub max_backoff: std::time::Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            assigner: WindowAssigner::tumbling(Duration::minutes(1)),
            allowed_lateness: Duration::minutes(1),
            trigger_interval: std::time::Duration::from_secs(60),
            channel_capacity: 1024,
            shards: 16,
            workers: None,
            emitter: EmitterConfig::default(),
            streams: StreamNames::default(),
            max_backoff: std::time::Duration::from_secs(5),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(cfg: &PipelineConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let size = Duration::milliseconds(cfg.window_size_ms()?);
        let assigner = match cfg.window.kind.as_str() {
            "sliding" => {
                WindowAssigner::sliding(size, Duration::milliseconds(cfg.window_slide_ms()?))
            }
            _ => WindowAssigner::tumbling(size),
        };
        let ms = |s: &str| -> anyhow::Result<std::time::Duration> {
            Ok(std::time::Duration::from_millis(tally_core::config::parse_duration_ms(s)? as u64))
        };
        Ok(Self {
            assigner,
            allowed_lateness: Duration::milliseconds(cfg.allowed_lateness_ms()?),
            trigger_interval: ms(&cfg.engine.trigger_interval)?,
            channel_capacity: cfg.engine.channel_capacity,
            shards: cfg.engine.shards,
            workers: cfg.engine.workers,
            emitter: EmitterConfig {
                emit_empty_windows: cfg.engine.emit_empty_windows,
                max_empty_windows: cfg.engine.max_empty_windows,
            },
            streams: StreamNames {
                raw: cfg.sink.raw.clone(),
                global: cfg.sink.global.clone(),
                country: cfg.sink.country.clone(),
            },
            max_backoff: ms(&cfg.sink.max_backoff)?,
        })
    }
}

/// Routes source messages to the worker owning their partition.
struct IngestCtx {
    routes: Vec<mpsc::Sender<RawMessage>>,
    kv: Arc<dyn KvState>,
}

#[async_trait]
impl Context for IngestCtx {
    async fn collect(&mut self, msg: RawMessage) -> Result<()> {
        let idx = msg.partition as usize % self.routes.len();
        self.routes[idx]
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed("ingest"))
    }

    fn kv(&self) -> Arc<dyn KvState> {
        self.kv.clone()
    }
}

/// Builder and runtime for one pipeline instance.
///
/// ```no_run
/// # async fn demo(
/// #     src: impl tally_core::Source + 'static,
/// #     out: impl tally_core::Sink + Clone + 'static,
/// #     kv: std::sync::Arc<dyn tally_core::KvState>,
/// # ) -> tally_core::Result<()> {
/// use tally_ops::{Pipeline, PipelineOptions};
/// let mut p = Pipeline::new(PipelineOptions::default(), kv);
/// p.source(src).raw_sink(out.clone()).global_sink(out.clone()).country_sink(out);
/// let stats = p.run(tokio_util::sync::CancellationToken::new()).await?;
/// # let _ = stats;
/// # Ok(()) }
/// ```
pub struct Pipeline {
    opts: PipelineOptions,
    source: Option<Box<dyn Source>>,
    raw_sink: Option<Box<dyn Sink>>,
    global_sink: Option<Box<dyn Sink>>,
    country_sink: Option<Box<dyn Sink>>,
    kv: Arc<dyn KvState>,
}

impl Pipeline {
    pub fn new(opts: PipelineOptions, kv: Arc<dyn KvState>) -> Self {
        Self {
            opts,
            source: None,
            raw_sink: None,
            global_sink: None,
            country_sink: None,
            kv,
        }
    }

    pub fn source<S: Source + 'static>(&mut self, s: S) -> &mut Self {
        self.source = Some(Box::new(s));
        self
    }

    pub fn raw_sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.raw_sink = Some(Box::new(s));
        self
    }

    pub fn global_sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.global_sink = Some(Box::new(s));
        self
    }

    pub fn country_sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.country_sink = Some(Box::new(s));
        self
    }

    /// Run until the source is exhausted or `cancel` fires, then drain:
    /// workers finish in-flight messages, the emitter flushes every live
    /// window and all three sinks are closed before returning.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<StatsSnapshot> {
        let mut source = self.source.take().ok_or_else(|| anyhow::anyhow!("no source"))?;
        let raw_sink = self.raw_sink.take().ok_or_else(|| anyhow::anyhow!("no raw sink"))?;
        let global_sink = self.global_sink.take().ok_or_else(|| anyhow::anyhow!("no global sink"))?;
        let country_sink =
            self.country_sink.take().ok_or_else(|| anyhow::anyhow!("no country sink"))?;
        let opts = self.opts.clone();
        let names = opts.streams.clone();

        let stats = Arc::new(PipelineStats::default());
        let tracker = Arc::new(WatermarkTracker::new(WatermarkPolicy::new(opts.allowed_lateness)));
        let table = Arc::new(AggregationTable::new(opts.shards, tracker.clone()));
        let positions = Arc::new(SourcePositions::default());
        let store = CheckpointStore::new(self.kv.clone());

        let global_cp = store.load(&names.global).await?;
        let country_cp = store.load(&names.country).await?;
        if let (Some(g), Some(c)) = (&global_cp, &country_cp) {
            let resume_at = g.last_closed_end.min(c.last_closed_end);
            tracker.restore(resume_at);
            info!(%resume_at, "restored watermark from checkpoints");
        }

        // Any failing stage stops the source; the drain below still runs.
        let shutdown = cancel.child_token();

        let (raw_tx, raw_rx) = mpsc::channel(opts.channel_capacity);
        let (global_tx, global_rx) = mpsc::channel(opts.channel_capacity);
        let (country_tx, country_rx) = mpsc::channel(opts.channel_capacity);
        let raw_task = supervise(
            "raw_sink",
            shutdown.clone(),
            SinkTask::new(names.raw.clone(), raw_sink, opts.max_backoff)
                .with_checkpoints(store.clone())
                .run(raw_rx),
        );
        let global_task = supervise(
            "global_sink",
            shutdown.clone(),
            SinkTask::new(names.global.clone(), global_sink, opts.max_backoff)
                .with_checkpoints(store.clone())
                .run(global_rx),
        );
        let country_task = supervise(
            "country_sink",
            shutdown.clone(),
            SinkTask::new(names.country.clone(), country_sink, opts.max_backoff)
                .with_checkpoints(store.clone())
                .run(country_rx),
        );

        let wake = Arc::new(Notify::new());
        let n_workers = opts.workers.unwrap_or(source.partitions() as usize).max(1);
        let mut routes = Vec::with_capacity(n_workers);
        let mut workers = Vec::with_capacity(n_workers);
        for id in 0..n_workers {
            let (tx, rx) = mpsc::channel(opts.channel_capacity);
            routes.push(tx);
            let worker = IngestWorker {
                id,
                assigner: opts.assigner,
                table: table.clone(),
                tracker: tracker.clone(),
                positions: positions.clone(),
                raw_tx: raw_tx.clone(),
                wake: wake.clone(),
                stats: stats.clone(),
            };
            workers.push(supervise("ingest_worker", shutdown.clone(), worker.run(rx)));
        }

        // the emitter holds the last raw sender, so the raw task ends with it
        let mut emitter = WindowEmitter::new(
            table.clone(),
            tracker.clone(),
            opts.assigner,
            StreamOutput::new(names.global.clone(), "global", global_tx),
            StreamOutput::new(names.country.clone(), "country", country_tx),
            opts.emitter,
            stats.clone(),
        )
        .with_raw(StreamOutput::new(names.raw.clone(), "raw", raw_tx))
        .with_positions(positions);
        emitter.resume(global_cp.as_ref(), country_cp.as_ref());
        let ingest_done = CancellationToken::new();
        let emitter_task = supervise(
            "window_emitter",
            shutdown.clone(),
            emitter.run(opts.trigger_interval, wake, ingest_done.clone()),
        );

        info!(workers = n_workers, shards = opts.shards, "pipeline started");
        let kv = self.kv.clone();
        let stop = shutdown.clone();
        let source_task = supervise("source", shutdown.clone(), async move {
            let mut ctx = IngestCtx { routes, kv };
            tokio::select! {
                res = source.run(&mut ctx) => res,
                _ = stop.cancelled() => {
                    info!("shutdown requested, stopping source");
                    Ok(())
                }
            }
        });

        let mut failure = Failure::default();
        failure.record(source_task.await);
        for w in workers {
            failure.record(w.await);
        }
        ingest_done.cancel();
        failure.record(emitter_task.await);
        // barrier: every output stream must be closed before returning
        failure.record(raw_task.await);
        failure.record(global_task.await);
        failure.record(country_task.await);

        let snapshot = stats.snapshot();
        match failure.into_error() {
            Some(e) => {
                error!(error = %e, "pipeline failed");
                Err(e)
            }
            None => {
                info!(?snapshot, "pipeline finished");
                Ok(snapshot)
            }
        }
    }
}

fn supervise<F, T>(task: &'static str, shutdown: CancellationToken, fut: F) -> JoinHandle<Result<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let out = fut.await;
        if let Err(e) = &out {
            error!(task, error = %e, "pipeline task failed");
            shutdown.cancel();
        }
        out
    })
}

/// Keeps the root cause: a closed channel is usually the echo of a failure
/// elsewhere, so any other error wins over it.
#[derive(Default)]
struct Failure {
    first: Option<Error>,
}

impl Failure {
    fn record<T>(&mut self, joined: std::result::Result<Result<T>, tokio::task::JoinError>) {
        let err = match joined {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e,
            Err(e) => Error::Anyhow(anyhow::anyhow!(e)),
        };
        let replace = match &self.first {
            None => true,
            Some(Error::ChannelClosed(_)) => !matches!(err, Error::ChannelClosed(_)),
            Some(_) => false,
        };
        if replace {
            self.first = Some(err);
        }
    }

    fn into_error(self) -> Option<Error> {
        self.first
    }
}
