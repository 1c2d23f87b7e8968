//! Remote object-store boundary.
//!
//! The filesystem core only talks to a bucket through [`ObjectStore`]. Wire
//! clients translate their status codes into [`StoreError`] exactly once, here,
//! so the rest of the crate never sees transport-specific failures.

use std::future::Future;
use std::ops::Range;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::{MemoryStore, MemoryStoreStats};

/// Errors reported by an object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key or prefix does not exist.
    #[error("object not found: {key}")]
    NotFound {
        /// Key that was requested.
        key: String,
    },

    /// Credentials were rejected for this request.
    #[error("access denied: {msg}")]
    AccessDenied {
        /// Message from the remote side.
        msg: String,
    },

    /// The request was malformed.
    #[error("invalid request: {msg}")]
    InvalidRequest {
        /// Message from the remote side.
        msg: String,
    },

    /// The service asked us to back off.
    #[error("rate limited: {msg}")]
    RateLimited {
        /// Message from the remote side.
        msg: String,
    },

    /// Anything else, including connection failures.
    #[error("transport error: {msg}")]
    Transport {
        /// Description of the failure.
        msg: String,
    },
}

impl StoreError {
    /// Classifies an HTTP-style status code returned by a wire client.
    pub fn from_status(status: u16, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match status {
            400 => StoreError::InvalidRequest { msg },
            403 => StoreError::AccessDenied { msg },
            404 => StoreError::NotFound { key: msg },
            429 | 500 | 503 => StoreError::RateLimited { msg },
            _ => StoreError::Transport {
                msg: format!("status {}: {}", status, msg),
            },
        }
    }

    /// True for a definitive "does not exist" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound { key: e.to_string() },
            std::io::ErrorKind::PermissionDenied => StoreError::AccessDenied { msg: e.to_string() },
            std::io::ErrorKind::InvalidInput => StoreError::InvalidRequest { msg: e.to_string() },
            _ => StoreError::Transport { msg: e.to_string() },
        }
    }
}

/// Result alias for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future used where probes and fetches are spawned or raced.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A byte stream returned by [`ObjectStore::get`].
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// One row of a listing page.
///
/// Prefixes collapsed by a delimiter come back as entries whose key ends in
/// the delimiter, with zero size and no hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full object key.
    pub key: String,
    /// Content length in bytes.
    pub size: u64,
    /// Upload time in milliseconds since the epoch.
    pub uploaded_at_ms: u64,
    /// Content hash reported by the store, if any.
    pub content_hash: Option<String>,
    /// Storage class reported by the store, if any.
    pub storage_class: Option<String>,
}

impl ObjectInfo {
    /// Creates an entry for a plain object.
    pub fn new(key: impl Into<String>, size: u64, uploaded_at_ms: u64) -> Self {
        Self {
            key: key.into(),
            size,
            uploaded_at_ms,
            content_hash: None,
            storage_class: None,
        }
    }

    /// Creates an entry for a delimiter-collapsed prefix.
    pub fn folder(prefix: impl Into<String>) -> Self {
        Self::new(prefix, 0, 0)
    }

    /// Upload time truncated to seconds.
    pub fn uploaded_at_secs(&self) -> u64 {
        self.uploaded_at_ms / 1000
    }
}

/// Parameters of a listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Only keys starting with this prefix are returned.
    pub prefix: String,
    /// Collapse everything past the first delimiter after the prefix.
    pub delimiter: Option<char>,
    /// Only keys strictly greater than this marker are returned.
    pub start_after: Option<String>,
    /// Page size limit.
    pub max_keys: Option<usize>,
}

impl ListRequest {
    /// Starts a request for `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Sets the delimiter.
    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    /// Resumes after `marker`.
    pub fn start_after(mut self, marker: Option<String>) -> Self {
        self.start_after = marker;
        self
    }

    /// Caps the number of returned entries.
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }
}

/// One page of listing results, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Entries in key order.
    pub objects: Vec<ObjectInfo>,
    /// Continuation marker when the listing was truncated.
    pub next_marker: Option<String>,
}

impl ListPage {
    /// True when more results are available past `next_marker`.
    pub fn is_truncated(&self) -> bool {
        self.next_marker.is_some()
    }
}

/// A large-file upload that was started but never finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfinishedUpload {
    /// Store-assigned upload id.
    pub upload_id: String,
    /// Destination key.
    pub key: String,
    /// Start time in milliseconds since the epoch.
    pub started_at_ms: u64,
}

/// Operations the filesystem needs from a bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns metadata of a single object.
    async fn head(&self, key: &str) -> StoreResult<ObjectInfo>;

    /// Lists one page of keys.
    async fn list(&self, req: ListRequest) -> StoreResult<ListPage>;

    /// Opens a byte stream over `key`, optionally limited to `range`.
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream>;

    /// Lists large-file uploads that were never finished.
    async fn list_unfinished_uploads(&self) -> StoreResult<Vec<UnfinishedUpload>>;

    /// Cancels an unfinished upload.
    async fn cancel_upload(&self, upload_id: &str) -> StoreResult<()>;
}

/// Applies listing semantics to a key-ordered iterator of objects.
///
/// Shared by the in-process stores so both paginate and collapse prefixes the
/// same way a remote bucket does.
pub(crate) fn list_sorted<'a, I>(objects: I, req: &ListRequest, default_page: usize) -> ListPage
where
    I: Iterator<Item = &'a ObjectInfo>,
{
    let limit = req.max_keys.unwrap_or(default_page).max(1);
    let mut page = ListPage::default();
    let mut last_folder: Option<String> = None;

    for obj in objects {
        if !obj.key.starts_with(&req.prefix) {
            continue;
        }
        if let Some(marker) = &req.start_after {
            if obj.key.as_str() <= marker.as_str() {
                continue;
            }
            // a collapsed prefix used as a marker covers everything beneath it
            if req.delimiter.is_some_and(|d| marker.ends_with(d)) && obj.key.starts_with(marker.as_str()) {
                continue;
            }
        }

        let rest = &obj.key[req.prefix.len()..];
        let entry = match req.delimiter.and_then(|d| rest.find(d).map(|i| (d, i))) {
            Some((d, idx)) => {
                let folder = format!("{}{}", req.prefix, &rest[..idx + d.len_utf8()]);
                if last_folder.as_deref() == Some(folder.as_str()) {
                    continue;
                }
                last_folder = Some(folder.clone());
                if folder == obj.key {
                    obj.clone()
                } else {
                    ObjectInfo::folder(folder)
                }
            }
            None => obj.clone(),
        };

        if page.objects.len() == limit {
            page.next_marker = page.objects.last().map(|o| o.key.clone());
            break;
        }
        page.objects.push(entry);
    }

    page
}
