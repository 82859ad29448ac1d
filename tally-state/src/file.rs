use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tally_core::{Error, KvState, Result};
use tokio::sync::Mutex;
use tracing::debug;

const FILE_NAME: &str = "state.json";

/// Durable `KvState` stored as one JSON object in `<dir>/state.json`.
///
/// Every mutation rewrites the document to a temporary file, syncs it and
/// renames it over the previous one, so readers never observe a torn write.
/// Keys and values must be UTF-8.
pub struct FileState {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl FileState {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(FILE_NAME);
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| {
                    Error::Checkpoint(format!("corrupt state file {}: {e}", path.display()))
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = map.len(), "file state opened");
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(map)?;
        let mut f = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut f, &bytes).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Checkpoint("file state keys and values must be UTF-8".into()))
}

#[async_trait]
impl KvState for FileState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = utf8(key)?;
        Ok(self.map.lock().await.get(&key).map(|v| v.clone().into_bytes()))
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let (key, value) = (utf8(key)?, utf8(&value)?);
        let mut map = self.map.lock().await;
        map.insert(key, value);
        self.persist(&map).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let key = utf8(key)?;
        let mut map = self.map.lock().await;
        if map.remove(&key).is_some() {
            self.persist(&map).await?;
        }
        Ok(())
    }

    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock().await;
        Ok(map
            .iter()
            .filter(|(k, _)| prefix.map_or(true, |p| k.as_bytes().starts_with(p)))
            .map(|(k, v)| (k.clone().into_bytes(), v.clone().into_bytes()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileState::open(dir.path()).await.unwrap();
            s.put(b"checkpoint:time-kpi", br#"{"a":1}"#.to_vec()).await.unwrap();
            s.put(b"kafka:offset:retail:g:3", b"1200".to_vec()).await.unwrap();
            s.delete(b"kafka:offset:retail:g:3").await.unwrap();
        }
        let s = FileState::open(dir.path()).await.unwrap();
        assert_eq!(s.get(b"checkpoint:time-kpi").await.unwrap(), Some(br#"{"a":1}"#.to_vec()));
        assert!(s.get(b"kafka:offset:retail:g:3").await.unwrap().is_none());
        assert_eq!(s.iter_prefix(Some(b"checkpoint:")).await.unwrap().len(), 1);
        assert!(!s.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), b"[not a map").unwrap();
        assert!(matches!(FileState::open(dir.path()).await, Err(Error::Checkpoint(_))));
    }

    #[tokio::test]
    async fn rejects_binary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileState::open(dir.path()).await.unwrap();
        assert!(s.put(&[0xff, 0xfe], b"x".to_vec()).await.is_err());
    }
}
