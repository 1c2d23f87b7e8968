//! Remote existence probes for a single path.
//!
//! A path names a file if the plain key exists, and a directory if either a
//! `key/` marker object exists or anything at all is listed under `key/`.

use std::sync::Arc;

use tracing::debug;

use crate::attr::InodeAttributes;
use crate::error::{FsError, Result};
use crate::inode::InodeSeed;
use crate::race::{first_success, first_success_sequential};
use crate::store::{BoxFuture, ListRequest, ObjectStore};

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub cheap: bool,
    pub explicit_dir: bool,
    /// Attributes given to every directory found.
    pub dir_attrs: InodeAttributes,
}

fn probe_file(store: Arc<dyn ObjectStore>, key: String) -> BoxFuture<'static, Result<InodeSeed>> {
    Box::pin(async move {
        let info = store.head(&key).await?;
        Ok(InodeSeed::file(&info))
    })
}

fn probe_dir_marker(
    store: Arc<dyn ObjectStore>,
    key: String,
    dir_attrs: InodeAttributes,
) -> BoxFuture<'static, Result<InodeSeed>> {
    Box::pin(async move {
        let info = store.head(&format!("{}/", key)).await?;
        Ok(InodeSeed::directory(dir_attrs, info.content_hash, false))
    })
}

fn probe_prefix(
    store: Arc<dyn ObjectStore>,
    key: String,
    dir_attrs: InodeAttributes,
) -> BoxFuture<'static, Result<InodeSeed>> {
    Box::pin(async move {
        let marker = format!("{}/", key);
        let page = store
            .list(ListRequest::new(marker.clone()).delimiter('/').max_keys(1))
            .await?;
        match page.objects.first() {
            Some(first) => {
                let explicit = first.key == marker;
                let etag = if explicit { first.content_hash.clone() } else { None };
                Ok(InodeSeed::directory(dir_attrs, etag, !explicit))
            }
            None => Err(FsError::NotFound { path: key }),
        }
    })
}

/// Finds out what `key` names in the bucket.
pub async fn probe(store: &Arc<dyn ObjectStore>, key: &str, opts: ProbeOptions) -> Result<InodeSeed> {
    let mut probes = vec![
        probe_file(Arc::clone(store), key.to_string()),
        probe_dir_marker(Arc::clone(store), key.to_string(), opts.dir_attrs),
    ];
    if !opts.explicit_dir {
        probes.push(probe_prefix(Arc::clone(store), key.to_string(), opts.dir_attrs));
    }

    let res = if opts.cheap {
        first_success_sequential(probes).await
    } else {
        first_success(probes).await
    };
    match &res {
        Ok(seed) => debug!("probe key={} kind={:?} implicit={}", key, seed.kind, seed.implicit_dir),
        Err(e) => debug!("probe key={} failed: {}", key, e),
    }
    res
}
