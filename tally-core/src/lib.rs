//! tally-core: fundamental types and traits for the retail KPI pipeline.
//!
//! Provides:
//! - Domain types: `RetailEvent`, `EnrichedInvoice`, `Record`, `RawMessage`
//! - The event decoder (`decode_event`)
//! - Traits: `Source`, `Context`, `Sink`, `KvState`
//! - Error taxonomy, pipeline configuration, checkpoints and prometheus metrics
//!
//! Quick example:
//! ```no_run
//! use tally_core::{Context, RawMessage, Record, Sink, Source};
//! struct OneShot;
//! #[async_trait::async_trait]
//! impl Source for OneShot {
//!     async fn run(&mut self, ctx: &mut dyn Context) -> tally_core::Result<()> {
//!         ctx.collect(RawMessage::new(0, br#"{"invoice_no":1}"#.to_vec())).await
//!     }
//! }
//!
//! struct Stdout;
//! #[async_trait::async_trait]
//! impl Sink for Stdout {
//!     async fn on_element(&mut self, rec: Record) -> tally_core::Result<()> {
//!         println!("{}", rec.value);
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

pub mod checkpoint;
pub mod config;
pub mod event;
pub mod metrics;
pub mod record;

pub use checkpoint::{durable_offsets, CheckpointMeta, CheckpointStore};
pub use event::{decode_event, DecodeError, EnrichedInvoice, EventKind, LineItem, RetailEvent};
pub use record::{RawMessage, Record};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// Transient sink failure; callers retry with backoff.
    #[error("sink {sink} unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },
    #[error("checkpoint store: {0}")]
    Checkpoint(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl Error {
    pub fn sink_unavailable(sink: impl Into<String>, reason: impl ToString) -> Self {
        Error::SinkUnavailable {
            sink: sink.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SinkUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait KvState: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Handle given to a running `Source`.
///
/// `collect` awaits while downstream workers are saturated, so a source is
/// throttled instead of buffering without bound.
#[async_trait]
pub trait Context: Send {
    async fn collect(&mut self, msg: RawMessage) -> Result<()>;
    fn kv(&self) -> Arc<dyn KvState>;
}

#[async_trait]
pub trait Source: Send {
    /// Number of partitions the source delivers; one ingestion worker is
    /// started per partition unless the configuration overrides it.
    fn partitions(&self) -> u32 {
        1
    }

    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()>;
}

/// Output target with an idempotent-append contract.
///
/// `on_element` may buffer; a record is only considered durable once `flush`
/// has returned `Ok`. Keyed records written twice must appear once.
#[async_trait]
pub trait Sink: Send {
    async fn on_element(&mut self, record: Record) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        (**self).on_element(record).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

pub mod prelude {
    pub use super::{
        Context, EnrichedInvoice, Error, EventKind, KvState, RawMessage, Record, Result,
        RetailEvent, Sink, Source,
    };
}
