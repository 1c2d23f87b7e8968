//! Object store backed by a local directory tree.
//!
//! Every regular file under the root is an object whose key is its relative
//! path with `/` separators. Directories are never objects themselves; they
//! show up only as prefixes.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::{
    list_sorted, ByteStream, ListPage, ListRequest, ObjectInfo, ObjectStore, StoreError,
    StoreResult, UnfinishedUpload,
};

const DEFAULT_PAGE: usize = 1000;

/// A bucket rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens a store rooted at `root`, which must be a directory.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::NotFound {
                key: root.display().to_string(),
            });
        }
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        // an absolute key would make join() discard the root
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(StoreError::InvalidRequest {
                msg: format!("bad key {:?}", key),
            });
        }
        Ok(self.root.join(key))
    }
}

fn object_info(key: String, meta: &std::fs::Metadata) -> ObjectInfo {
    let uploaded_at_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ObjectInfo::new(key, meta.len(), uploaded_at_ms)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectInfo>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let path = entry.path();
        if meta.is_dir() {
            walk(root, &path, out)?;
        } else if meta.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(object_info(key, &meta));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn head(&self, key: &str) -> StoreResult<ObjectInfo> {
        let path = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(object_info(key.to_string(), &meta))
    }

    async fn list(&self, req: ListRequest) -> StoreResult<ListPage> {
        let root = self.root.clone();
        let mut all = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &root, &mut out).map(|_| out)
        })
        .await
        .map_err(|e| StoreError::Transport { msg: e.to_string() })??;
        all.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("local list prefix={} total={}", req.prefix, all.len());
        Ok(list_sorted(all.iter(), &req, DEFAULT_PAGE))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path).await?;
        match range {
            Some(r) => {
                file.seek(SeekFrom::Start(r.start)).await?;
                let len = r.end.saturating_sub(r.start);
                Ok(Box::pin(file.take(len)))
            }
            None => Ok(Box::pin(file)),
        }
    }

    async fn list_unfinished_uploads(&self) -> StoreResult<Vec<UnfinishedUpload>> {
        Ok(Vec::new())
    }

    async fn cancel_upload(&self, upload_id: &str) -> StoreResult<()> {
        Err(StoreError::NotFound {
            key: upload_id.to_string(),
        })
    }
}
