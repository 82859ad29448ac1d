//! tally-io: sources and sinks.
//! - `FileSource`: JSONL files, one partition per file
//! - `FileSink`: idempotent append-only JSON lines file
//! - `ConsoleSink`: JSON lines to stdout
//! - `ParquetSink` (feature `parquet`): raw invoice rows as date-partitioned parquet
//! - `KafkaSource` / `KafkaSink` (feature `kafka`)

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tally_core::{metrics, Context, RawMessage, Record, Result, Sink, Source};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Field carrying the idempotency key of keyed records in JSONL output.
pub const KEY_FIELD: &str = "_key";

/// Buffered bytes that trigger a write without waiting for `flush`.
const FLUSH_BYTES: usize = 1 << 20;

/// Reads JSONL files and delivers every non-blank line as a raw message.
///
/// Each path is its own partition. Files are read round-robin, one line at
/// a time, so partitions progress together like a live multi-partition
/// topic would.
pub struct FileSource {
    pub paths: Vec<PathBuf>,
}

impl FileSource {
    pub fn jsonl(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn partitions(&self) -> u32 {
        self.paths.len().max(1) as u32
    }

    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        let mut readers = Vec::with_capacity(self.paths.len());
        for p in &self.paths {
            let f = tokio::fs::File::open(p).await?;
            readers.push(Some(tokio::io::BufReader::new(f).lines()));
        }
        let mut line_no = vec![0i64; readers.len()];
        let mut open = readers.len();
        while open > 0 {
            for (partition, slot) in readers.iter_mut().enumerate() {
                let Some(lines) = slot.as_mut() else { continue };
                match lines.next_line().await? {
                    Some(line) => {
                        line_no[partition] += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        let msg = RawMessage::new(partition as u32, line.into_bytes())
                            .with_offset(line_no[partition]);
                        ctx.collect(msg).await?;
                    }
                    None => {
                        info!(
                            path = %self.paths[partition].display(),
                            lines = line_no[partition],
                            "file source exhausted"
                        );
                        *slot = None;
                        open -= 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Writes each record value as a single JSON line to a file.
///
/// Writes are buffered until `flush` (or until the buffer reaches 1 MiB),
/// which appends and syncs the file. For
/// keyed records the key is stored in the `_key` field; keys already present
/// in the file, or seen earlier by this sink, are not written again. A torn
/// last line left by a crash is cut off when the file is opened.
pub struct FileSink {
    path: PathBuf,
    file: tokio::fs::File,
    buf: Vec<u8>,
    seen: HashSet<String>,
}

impl FileSink {
    /// Open (or create) `path`, loading the keys it already holds.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut seen = HashSet::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let whole = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
                if whole < bytes.len() {
                    // a torn line from a crash; later appends must not extend it
                    warn!(
                        path = %path.display(),
                        torn_bytes = bytes.len() - whole,
                        "truncating torn tail"
                    );
                    let f = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                    f.set_len(whole as u64).await?;
                    f.sync_all().await?;
                }
                for line in String::from_utf8_lossy(&bytes[..whole]).lines() {
                    let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
                        continue;
                    };
                    if let Some(k) = v.get(KEY_FIELD).and_then(|k| k.as_str()) {
                        seen.insert(k.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), keys = seen.len(), "file sink opened");
        Ok(Self {
            path,
            file,
            buf: Vec::new(),
            seen,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        let mut value = record.value;
        if let Some(key) = record.key {
            if !self.seen.insert(key.clone()) {
                debug!(path = %self.path.display(), %key, "skipping already written key");
                return Ok(());
            }
            if let Some(obj) = value.as_object_mut() {
                obj.insert(KEY_FIELD.into(), serde_json::Value::String(key));
            }
        }
        serde_json::to_writer(&mut self.buf, &value)?;
        self.buf.push(b'\n');
        if self.buf.len() >= FLUSH_BYTES {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buf).await?;
        self.file.sync_data().await?;
        metrics::BYTES_WRITTEN.with_label_values(&["file"]).inc_by(self.buf.len() as u64);
        self.buf.clear();
        Ok(())
    }
}

/// Prints each record value as a JSON line on stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        println!("{}", serde_json::to_string(&record.value)?);
        Ok(())
    }
}

#[cfg(feature = "kafka")]
mod kafka;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaSink, KafkaSource};

#[cfg(feature = "parquet")]
pub mod parquet_sink;
#[cfg(feature = "parquet")]
pub use parquet_sink::{ParquetSink, ParquetSinkConfig};
