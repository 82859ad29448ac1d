#![cfg(feature = "parquet")]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use arrow::array::{
    ArrayRef, Float64Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder,
    UInt8Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tally_core::{metrics, EnrichedInvoice, Record, Result, Sink};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct ParquetSinkConfig {
    pub out_dir: PathBuf,
    /// Write a partition's buffered rows early once it holds this many. Default: 100_000.
    pub max_rows: usize,
    /// none|snappy|zstd (default: snappy)
    pub compression: Option<String>,
}

impl Default for ParquetSinkConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("./out/raw"),
            max_rows: 100_000,
            compression: Some("snappy".into()),
        }
    }
}

/// Writes raw enriched invoices as parquet files under `dt=<YYYY-MM-DD>/`.
///
/// Rows are buffered per event date; every `flush` writes each buffer as a
/// complete file with a footer, so nothing half-written is ever visible.
pub struct ParquetSink {
    cfg: ParquetSinkConfig,
    pending: BTreeMap<String, Vec<EnrichedInvoice>>,
    schema: Arc<Schema>,
    seq: u64,
}

impl ParquetSink {
    pub fn new(cfg: ParquetSinkConfig) -> Self {
        let fields = vec![
            Field::new("invoice_no", DataType::Int64, false),
            Field::new("country", DataType::Utf8, false),
            Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new("total_cost", DataType::Float64, false),
            Field::new("total_items", DataType::Int64, false),
            Field::new("is_order", DataType::UInt8, false),
            Field::new("is_return", DataType::UInt8, false),
        ];
        Self {
            cfg,
            pending: BTreeMap::new(),
            schema: Arc::new(Schema::new(fields)),
            seq: 0,
        }
    }

    fn build_batch(&self, rows: &[EnrichedInvoice]) -> Result<RecordBatch> {
        let mut invoice = Int64Builder::with_capacity(rows.len());
        let mut country = StringBuilder::new();
        let mut ts = TimestampMillisecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
        let mut cost = Float64Builder::with_capacity(rows.len());
        let mut items = Int64Builder::with_capacity(rows.len());
        let mut is_order = UInt8Builder::with_capacity(rows.len());
        let mut is_return = UInt8Builder::with_capacity(rows.len());
        for r in rows {
            invoice.append_value(r.invoice_no);
            country.append_value(&r.country);
            ts.append_value(r.event_time.timestamp_millis());
            cost.append_value(r.total_cost);
            items.append_value(r.total_items);
            is_order.append_value(r.is_order);
            is_return.append_value(r.is_return);
        }
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(invoice.finish()),
            Arc::new(country.finish()),
            Arc::new(ts.finish()),
            Arc::new(cost.finish()),
            Arc::new(items.finish()),
            Arc::new(is_order.finish()),
            Arc::new(is_return.finish()),
        ];
        Ok(RecordBatch::try_new(self.schema.clone(), arrays).context("record batch")?)
    }

    fn props(&self) -> WriterProperties {
        let codec = self.cfg.compression.as_deref().unwrap_or("snappy").to_lowercase();
        let compression = match codec.as_str() {
            "snappy" => parquet::basic::Compression::SNAPPY,
            "zstd" => parquet::basic::Compression::ZSTD(parquet::basic::ZstdLevel::default()),
            _ => parquet::basic::Compression::UNCOMPRESSED,
        };
        WriterProperties::builder().set_compression(compression).build()
    }

    fn write_file(&mut self, part: &str, rows: &[EnrichedInvoice]) -> Result<PathBuf> {
        let dir = self.cfg.out_dir.join(format!("dt={}", part));
        std::fs::create_dir_all(&dir)?;
        self.seq += 1;
        let millis = chrono::Utc::now().timestamp_millis();
        let path = dir.join(format!("part-{}-{:06}.parquet", millis, self.seq));
        let batch = self.build_batch(rows)?;
        let file = std::fs::File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), Some(self.props()))
            .map_err(|e| anyhow::anyhow!(e))?;
        writer.write(&batch).map_err(|e| anyhow::anyhow!(e))?;
        let file = writer.into_inner().map_err(|e| anyhow::anyhow!(e))?;
        file.sync_all()?;
        let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
        metrics::BYTES_WRITTEN.with_label_values(&["parquet"]).inc_by(bytes);
        debug!(path = %path.display(), rows = rows.len(), "parquet file written");
        Ok(path)
    }

    fn write_partition(&mut self, part: &str) -> Result<()> {
        let Some(rows) = self.pending.remove(part) else { return Ok(()) };
        if rows.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_file(part, &rows) {
            // keep the rows for the next attempt
            self.pending.insert(part.to_string(), rows);
            return Err(e);
        }
        Ok(())
    }

    pub fn out_dir(&self) -> &Path {
        &self.cfg.out_dir
    }
}

#[async_trait]
impl Sink for ParquetSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        let row: EnrichedInvoice = serde_json::from_value(record.value)?;
        let part = row.event_time.format("%Y-%m-%d").to_string();
        let rows = self.pending.entry(part.clone()).or_default();
        rows.push(row);
        if rows.len() >= self.cfg.max_rows {
            self.write_partition(&part)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let parts: Vec<String> = self.pending.keys().cloned().collect();
        for part in parts {
            self.write_partition(&part)?;
        }
        Ok(())
    }
}
