//! In-memory object store used by tests and demos.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    list_sorted, ByteStream, ListPage, ListRequest, ObjectInfo, ObjectStore, StoreError,
    StoreResult, UnfinishedUpload,
};

const DEFAULT_PAGE: usize = 1000;

/// Call counters for the in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreStats {
    /// Number of head calls.
    pub heads: u64,
    /// Number of list calls.
    pub lists: u64,
    /// Number of get calls.
    pub gets: u64,
    /// Number of cancelled uploads.
    pub cancels: u64,
}

impl MemoryStoreStats {
    /// Total number of remote calls.
    pub fn total(&self) -> u64 {
        self.heads + self.lists + self.gets + self.cancels
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    info: ObjectInfo,
    data: Bytes,
}

/// A bucket held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<Vec<UnfinishedUpload>>,
    stats: Mutex<MemoryStoreStats>,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `key` with the given upload time.
    pub fn put(&self, key: &str, data: impl Into<Bytes>, uploaded_at_ms: u64) {
        let data = data.into();
        let mut info = ObjectInfo::new(key, data.len() as u64, uploaded_at_ms);
        info.content_hash = Some(format!("{:016x}", fnv1a(&data)));
        self.objects
            .lock()
            .insert(key.to_string(), StoredObject { info, data });
    }

    /// Deletes `key`, returning whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.objects.lock().remove(key).is_some()
    }

    /// Registers an unfinished upload.
    pub fn put_upload(&self, upload_id: &str, key: &str, started_at_ms: u64) {
        self.uploads.lock().push(UnfinishedUpload {
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            started_at_ms,
        });
    }

    /// Ids of uploads that have not been cancelled.
    pub fn pending_uploads(&self) -> Vec<String> {
        self.uploads
            .lock()
            .iter()
            .map(|u| u.upload_id.clone())
            .collect()
    }

    /// Makes every subsequent call fail with `err`, or clears the failure.
    pub fn set_failure(&self, err: Option<StoreError>) {
        *self.failure.lock() = err;
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MemoryStoreStats {
        self.stats.lock().clone()
    }

    /// Resets the call counters.
    pub fn reset_stats(&self) {
        *self.stats.lock() = MemoryStoreStats::default();
    }

    fn check_failure(&self) -> StoreResult<()> {
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str) -> StoreResult<ObjectInfo> {
        self.stats.lock().heads += 1;
        self.check_failure()?;
        debug!("memory head key={}", key);
        self.objects
            .lock()
            .get(key)
            .map(|o| o.info.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, req: ListRequest) -> StoreResult<ListPage> {
        self.stats.lock().lists += 1;
        self.check_failure()?;
        debug!(
            "memory list prefix={} delimiter={:?} start_after={:?}",
            req.prefix, req.delimiter, req.start_after
        );
        let objects = self.objects.lock();
        Ok(list_sorted(
            objects.values().map(|o| &o.info),
            &req,
            DEFAULT_PAGE,
        ))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream> {
        self.stats.lock().gets += 1;
        self.check_failure()?;
        let data = self
            .objects
            .lock()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;

        let len = data.len() as u64;
        let slice = match range {
            Some(r) => {
                let start = r.start.min(len) as usize;
                let end = r.end.min(len).max(r.start.min(len)) as usize;
                data.slice(start..end)
            }
            None => data,
        };
        debug!("memory get key={} len={}", key, slice.len());
        Ok(Box::pin(Cursor::new(slice)))
    }

    async fn list_unfinished_uploads(&self) -> StoreResult<Vec<UnfinishedUpload>> {
        self.stats.lock().lists += 1;
        self.check_failure()?;
        Ok(self.uploads.lock().clone())
    }

    async fn cancel_upload(&self, upload_id: &str) -> StoreResult<()> {
        self.stats.lock().cancels += 1;
        self.check_failure()?;
        let mut uploads = self.uploads.lock();
        let before = uploads.len();
        uploads.retain(|u| u.upload_id != upload_id);
        if uploads.len() == before {
            return Err(StoreError::NotFound {
                key: upload_id.to_string(),
            });
        }
        Ok(())
    }
}
