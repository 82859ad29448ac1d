use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tally_core::config::{PipelineConfig, SinkConfig};
use tally_core::{CheckpointStore, KvState, Sink};
use tally_ops::{Pipeline, PipelineOptions, StatsSnapshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    version,
    about = "Streaming retail KPI engine",
    disable_help_subcommand = false
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a pipeline.toml
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
    /// Print the stored checkpoints and source offsets as JSON lines
    Checkpoints {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    tally_core::metrics::render_prometheus()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            if http_port != 0 {
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("serving /metrics on {}", addr);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app()).await {
                        warn!(error = %e, "metrics server stopped");
                    }
                });
            }
            let cfg = load_config(&config).await?;
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(cancel.clone()));
            let stats = run_pipeline(&cfg, cancel).await?;
            info!(?stats, "pipeline finished");
            Ok(())
        }
        Commands::Checkpoints { config } => {
            let cfg = load_config(&config).await?;
            let kv = open_state(&cfg).await?;
            for cp in CheckpointStore::new(kv.clone()).list().await? {
                println!("{}", serde_json::to_string(&cp)?);
            }
            for (k, v) in kv.iter_prefix(Some(b"kafka:offset:")).await? {
                let entry = serde_json::json!({
                    "key": String::from_utf8_lossy(&k),
                    "next_offset": String::from_utf8_lossy(&v),
                });
                println!("{}", entry);
            }
            Ok(())
        }
    }
}

async fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg: PipelineConfig = toml::from_str(&text)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Cancel `token` on Ctrl-C or SIGTERM; the pipeline then drains and exits.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested, draining");
    token.cancel();
}

async fn open_state(cfg: &PipelineConfig) -> anyhow::Result<Arc<dyn KvState>> {
    let path = &cfg.checkpoint.path;
    let kv: Arc<dyn KvState> = match cfg.checkpoint.kind.as_str() {
        "memory" => Arc::new(tally_state::InMemoryState::default()),
        "file" => Arc::new(tally_state::FileState::open(path).await?),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => Arc::new(tally_state::RocksDbState::open(path)?),
        other => anyhow::bail!("checkpoint kind {other} is not available in this build"),
    };
    Ok(kv)
}

/// Sink for one output stream. `console` and `parquet` apply to the raw
/// stream only; the windowed streams then fall back to JSONL files.
async fn open_sink(cfg: &SinkConfig, stream: &str, raw: bool) -> anyhow::Result<Box<dyn Sink>> {
    let jsonl = cfg.out_dir.join(format!("{stream}.jsonl"));
    let sink: Box<dyn Sink> = match cfg.kind.as_str() {
        "console" if raw => Box::new(tally_io::ConsoleSink),
        #[cfg(feature = "parquet")]
        "parquet" if raw => Box::new(tally_io::ParquetSink::new(tally_io::ParquetSinkConfig {
            out_dir: cfg.out_dir.join(stream),
            ..Default::default()
        })),
        #[cfg(not(feature = "parquet"))]
        "parquet" if raw => anyhow::bail!("parquet sink requires the `parquet` feature"),
        #[cfg(feature = "kafka")]
        "kafka" => {
            let brokers = cfg.brokers.clone().context("kafka sink needs brokers")?;
            Box::new(tally_io::KafkaSink::new(brokers, stream))
        }
        #[cfg(not(feature = "kafka"))]
        "kafka" => anyhow::bail!("kafka sink requires the `kafka` feature"),
        _ => Box::new(tally_io::FileSink::open(&jsonl).await?),
    };
    Ok(sink)
}

async fn run_pipeline(
    cfg: &PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<StatsSnapshot> {
    let opts = PipelineOptions::from_config(cfg)?;
    let kv = open_state(cfg).await?;
    let mut p = Pipeline::new(opts, kv);

    match cfg.source.kind.as_str() {
        "file" => {
            p.source(tally_io::FileSource::jsonl(cfg.source.paths.iter().cloned()));
        }
        #[cfg(feature = "kafka")]
        "kafka" => {
            let mut src = tally_io::KafkaSource::new(
                cfg.source.brokers.clone().context("source.brokers")?,
                cfg.source.group_id.clone().context("source.group_id")?,
                cfg.source.topic.clone().context("source.topic")?,
            );
            src.auto_offset_reset = cfg.source.auto_offset_reset.clone();
            src.discover_partitions().await?;
            p.source(src);
        }
        other => anyhow::bail!("source kind {other} is not available in this build"),
    }

    let sink = &cfg.sink;
    p.raw_sink(open_sink(sink, &sink.raw, true).await?)
        .global_sink(open_sink(sink, &sink.global, false).await?)
        .country_sink(open_sink(sink, &sink.country, false).await?);

    info!(
        source = %cfg.source.kind,
        sink = %sink.kind,
        window = %cfg.window.kind,
        "starting pipeline"
    );
    Ok(p.run(cancel).await?)
}
