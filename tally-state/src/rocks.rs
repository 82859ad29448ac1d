use std::path::Path;

use async_trait::async_trait;
use tally_core::{Error, KvState, Result};

/// A RocksDB-backed `KvState` (enable with `--features rocksdb`).
pub struct RocksDbState {
    db: rocksdb::DB,
}

fn db_err(e: rocksdb::Error) -> Error {
    Error::Checkpoint(format!("rocksdb: {e}"))
}

impl RocksDbState {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path).map_err(db_err)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KvState for RocksDbState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(db_err)
    }
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut wo = rocksdb::WriteOptions::default();
        wo.set_sync(true);
        self.db.put_opt(key, value, &wo).map_err(db_err)
    }
    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key).map_err(db_err)
    }
    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        match prefix {
            Some(p) => {
                let mode = rocksdb::IteratorMode::From(p, rocksdb::Direction::Forward);
                for item in self.db.iterator(mode) {
                    let (k, v) = item.map_err(db_err)?;
                    if !k.starts_with(p) {
                        break;
                    }
                    out.push((k.to_vec(), v.to_vec()));
                }
            }
            None => {
                for item in self.db.iterator(rocksdb::IteratorMode::Start) {
                    let (k, v) = item.map_err(db_err)?;
                    out.push((k.to_vec(), v.to_vec()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_scan_stops_at_namespace_end() {
        let dir = tempfile::tempdir().unwrap();
        let s = RocksDbState::open(dir.path()).unwrap();
        s.put(b"checkpoint:country-time-kpi", b"1".to_vec()).await.unwrap();
        s.put(b"checkpoint:time-kpi", b"2".to_vec()).await.unwrap();
        s.put(b"kafka:offset:retail:g:0", b"3".to_vec()).await.unwrap();
        let cps = s.iter_prefix(Some(b"checkpoint:")).await.unwrap();
        assert_eq!(cps.len(), 2);
        s.delete(b"checkpoint:time-kpi").await.unwrap();
        assert!(s.get(b"checkpoint:time-kpi").await.unwrap().is_none());
    }
}
