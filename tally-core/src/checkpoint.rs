use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, KvState, Result};

const CP_NS: &str = "checkpoint:";

/// Progress of one windowed output stream, persisted after its sink flushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    /// Output stream name (e.g. "time-kpi").
    pub stream: String,
    /// End of the last window whose results are durable in the sink.
    pub last_closed_end: DateTime<Utc>,
    /// Watermark observed when the checkpoint was taken.
    pub watermark: DateTime<Utc>,
    /// Per source partition, the offset a restart must resume from so that
    /// nothing folded into a still-open window is skipped.
    #[serde(default)]
    pub source_offsets: BTreeMap<u32, i64>,
}

/// Resume offsets that every stream in `cps` agrees on: the lowest per
/// partition. A partition missing from any checkpoint is left out.
pub fn durable_offsets(cps: &[CheckpointMeta]) -> BTreeMap<u32, i64> {
    let Some((first, rest)) = cps.split_first() else {
        return BTreeMap::new();
    };
    first
        .source_offsets
        .iter()
        .filter_map(|(partition, &offset)| {
            rest.iter()
                .try_fold(offset, |low, cp| cp.source_offsets.get(partition).map(|&o| low.min(o)))
                .map(|low| (*partition, low))
        })
        .collect()
}

/// Reads and writes `CheckpointMeta` through a `KvState` backend.
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KvState>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvState>) -> Self {
        Self { kv }
    }

    fn key(stream: &str) -> Vec<u8> {
        format!("{CP_NS}{stream}").into_bytes()
    }

    pub async fn load(&self, stream: &str) -> Result<Option<CheckpointMeta>> {
        match self.kv.get(&Self::key(stream)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Checkpoint(format!("corrupt checkpoint for {stream}: {e}"))),
            None => Ok(None),
        }
    }

    /// Persist `meta`, refusing to move a stream's progress backwards.
    pub async fn commit(&self, meta: &CheckpointMeta) -> Result<()> {
        if let Some(prev) = self.load(&meta.stream).await? {
            if prev.last_closed_end > meta.last_closed_end {
                return Ok(());
            }
        }
        let bytes = serde_json::to_vec(meta)?;
        self.kv.put(&Self::key(&meta.stream), bytes).await
    }

    pub async fn list(&self) -> Result<Vec<CheckpointMeta>> {
        let mut out = Vec::new();
        for (k, v) in self.kv.iter_prefix(Some(CP_NS.as_bytes())).await? {
            let meta: CheckpointMeta = serde_json::from_slice(&v).map_err(|e| {
                let key = String::from_utf8_lossy(&k);
                Error::Checkpoint(format!("corrupt checkpoint {key}: {e}"))
            })?;
            out.push(meta);
        }
        out.sort_by(|a, b| a.stream.cmp(&b.stream));
        Ok(out)
    }
}
