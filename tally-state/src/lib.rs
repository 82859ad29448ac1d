//! tally-state: `KvState` backends for checkpoints and source offsets.
//!
//! - `InMemoryState`: process-local, for tests and throwaway runs
//! - `FileState`: a JSON document rewritten atomically on every change
//! - `RocksDbState`: behind the `rocksdb` feature

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::{KvState, Result};

mod file;
#[cfg(feature = "rocksdb")]
mod rocks;

pub use file::FileState;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbState;

#[derive(Clone, Default)]
pub struct InMemoryState(Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>);

#[async_trait]
impl KvState for InMemoryState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.0.lock().get(key).cloned())
    }
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.0.lock().insert(key.to_vec(), value);
        Ok(())
    }
    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.0.lock().remove(key);
        Ok(())
    }
    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.0.lock();
        Ok(guard
            .iter()
            .filter(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_state_put_get_delete_iter() {
        let state = InMemoryState::default();
        let key = b"checkpoint:time-kpi";
        assert!(state.get(key).await.unwrap().is_none());
        state.put(key, b"v1".to_vec()).await.unwrap();
        state.put(b"kafka:offset:retail:g:0", b"42".to_vec()).await.unwrap();
        assert_eq!(state.get(key).await.unwrap().unwrap(), b"v1".to_vec());

        let cps = state.iter_prefix(Some(b"checkpoint:")).await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(state.iter_prefix(None).await.unwrap().len(), 2);

        state.delete(key).await.unwrap();
        assert!(state.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clones_share_the_same_map() {
        let a = InMemoryState::default();
        let b = a.clone();
        a.put(b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(b.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    }
}
