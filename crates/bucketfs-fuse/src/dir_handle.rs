//! Directory listing cursor.
//!
//! A handle serves `.` and `..` itself, then either the cached children of a
//! sealed directory or pages fetched from the store. When a recursive walk is
//! detected on the parent, the first page is raced against a "slurp": one
//! undelimited listing of the parent prefix that fills in whole subtrees.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::fs::BucketFs;
use crate::inode::{entry_order, DirEntry, Inode, ROOT_INODE_ID};
use crate::race::first_success;
use crate::store::{BoxFuture, ListPage, ListRequest, ObjectInfo, ObjectStore};

/// Open-directory score at which the parent is slurped.
pub const SLURP_SCORE: u8 = 2;

#[derive(Debug, Default)]
struct DirCursor {
    entries: Option<Vec<DirEntry>>,
    marker: Option<String>,
    base_offset: u64,
    from_store: bool,
}

struct Listing {
    entries: Vec<DirEntry>,
    marker: Option<String>,
}

#[derive(Debug)]
pub struct DirHandle {
    inode: Arc<Inode>,
    cursor: Mutex<DirCursor>,
}

impl DirHandle {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            cursor: Mutex::new(DirCursor::default()),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    fn dot_entry(&self, fs: &BucketFs, offset: u64) -> DirEntry {
        let (name, ino) = if offset == 0 {
            (".", self.inode.id())
        } else {
            ("..", self.inode.parent().unwrap_or(ROOT_INODE_ID))
        };
        DirEntry {
            ino: Some(ino),
            offset: offset + 1,
            ..DirEntry::directory(name, fs.root_attrs())
        }
    }

    /// Returns the entry at listing position `offset`, or `None` past the end.
    pub async fn read_dir(&self, fs: &Arc<BucketFs>, offset: u64) -> Result<Option<DirEntry>> {
        let mut cur = self.cursor.lock().await;
        if offset == 0 {
            *cur = DirCursor::default();
        }
        if offset < 2 {
            return Ok(Some(self.dot_entry(fs, offset)));
        }

        if cur.entries.is_none() {
            if let Some(hit) = self.inode.read_dir_from_cache(offset, fs.config().type_cache_ttl()) {
                return Ok(hit);
            }
        }

        if cur.entries.is_none() || offset < cur.base_offset + 2 {
            let listing = self.list_objects(fs, None, 0).await?;
            *cur = DirCursor {
                entries: Some(listing.entries),
                marker: listing.marker,
                base_offset: 0,
                from_store: true,
            };
        }

        loop {
            let idx = offset - cur.base_offset - 2;
            let len = cur.entries.as_ref().map_or(0, Vec::len) as u64;
            if idx < len {
                return Ok(cur.entries.as_ref().and_then(|e| e.get(idx as usize)).cloned());
            }

            if let Some(marker) = cur.marker.clone() {
                let base = cur.base_offset + len;
                let listing = self.list_objects(fs, Some(marker.clone()), base).await?;
                cur.entries = Some(listing.entries);
                cur.marker = listing.marker.filter(|next| *next != marker);
                cur.base_offset = base;
                continue;
            }

            if idx == len {
                if cur.from_store {
                    self.inode.log_fuse("ReadDir", format_args!("complete"));
                    self.inode.seal();
                }
                return Ok(None);
            }
            return Err(FsError::InvalidArgument {
                msg: format!("readdir offset {} past end of {:?}", offset, self.inode.full_name()),
            });
        }
    }

    fn slurp_parent(&self, fs: &BucketFs) -> Option<Arc<Inode>> {
        if fs.config().type_cache_ttl().is_zero() {
            return None;
        }
        let parent = fs.inode(self.inode.parent()?).ok()?;
        let score = parent.lock().dir.as_ref().map_or(0, |d| d.seq_open_dir_score);
        (score >= SLURP_SCORE).then_some(parent)
    }

    async fn list_objects(&self, fs: &Arc<BucketFs>, marker: Option<String>, base: u64) -> Result<Listing> {
        let prefix = fs.config().dir_prefix(self.inode.full_name());
        let flat = flat_listing(
            Arc::clone(fs.store()),
            prefix.clone(),
            marker.clone(),
            fs.config().list_page_size,
        );

        let slurp_parent = if marker.is_none() {
            self.slurp_parent(fs)
        } else {
            None
        };
        let page = match slurp_parent {
            None => flat.await?,
            Some(parent) => {
                let slurp = slurp(Arc::clone(fs), parent, Arc::clone(&self.inode));
                if fs.config().cheap {
                    match slurp.await {
                        Ok(page) => page,
                        Err(e) => {
                            debug!("slurp for {:?} failed: {}", self.inode.full_name(), e);
                            flat.await?
                        }
                    }
                } else {
                    first_success(vec![slurp, flat]).await?
                }
            }
        };

        Ok(Listing {
            entries: self.process_page(fs, &prefix, &page.objects, base),
            marker: page.next_marker,
        })
    }

    /// Turns a page into sorted entries of this directory and makes sure each
    /// one is backed by an inode.
    fn process_page(&self, fs: &BucketFs, prefix: &str, objects: &[ObjectInfo], base: u64) -> Vec<DirEntry> {
        let mut entries = Vec::new();
        let mut last_dir: Option<&str> = None;
        for obj in objects {
            let Some(rest) = obj.key.strip_prefix(prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((name, tail)) => {
                    if name.is_empty() || last_dir == Some(name) {
                        continue;
                    }
                    last_dir = Some(name);
                    let mut entry = DirEntry::directory(name, fs.root_attrs());
                    if tail.is_empty() {
                        entry.etag = obj.content_hash.clone();
                    }
                    entries.push(entry);
                }
                None => entries.push(DirEntry::from_object(obj, rest, false, fs.root_attrs())),
            }
        }

        entries.sort_by(|a, b| entry_order(a.is_dir(), &a.name, b.is_dir(), &b.name));
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.offset = base + i as u64 + 3;
            entry.ino = Some(fs.insert_from_dir_entry(&self.inode, entry).id());
        }
        entries
    }
}

fn flat_listing(
    store: Arc<dyn ObjectStore>,
    prefix: String,
    marker: Option<String>,
    page_size: usize,
) -> BoxFuture<'static, Result<ListPage>> {
    Box::pin(async move {
        let req = ListRequest::new(prefix)
            .delimiter('/')
            .start_after(marker)
            .max_keys(page_size);
        Ok(store.list(req).await?)
    })
}

/// Lists everything under `parent` from `dir` onwards and inserts it.
///
/// Fails when the page stops inside `dir`, so the caller falls back to a
/// plain listing.
fn slurp(fs: Arc<BucketFs>, parent: Arc<Inode>, dir: Arc<Inode>) -> BoxFuture<'static, Result<ListPage>> {
    Box::pin(async move {
        let base_prefix = fs.config().dir_prefix(parent.full_name());
        let dir_prefix = fs.config().dir_prefix(dir.full_name());
        let req = ListRequest::new(base_prefix.clone())
            .start_after(Some(dir_prefix.clone()))
            .max_keys(fs.config().list_page_size);
        let mut page = fs.store().list(req).await?;
        dir.log_fuse(
            "Slurp",
            format_args!("from={:?} keys={} truncated={}", base_prefix, page.objects.len(), page.is_truncated()),
        );

        let mut prev: Vec<Arc<Inode>> = Vec::new();
        for obj in &page.objects {
            let Some(rel) = obj.key.strip_prefix(base_prefix.as_str()) else {
                continue;
            };
            if !rel.contains('/') {
                continue;
            }
            let chain = fs.insert_subtree(&parent, rel, obj);
            fs.seal_past_dirs(&prev, &chain, dir.id());
            prev = chain;
        }

        if page.is_truncated() {
            let last = page.objects.last().map_or("", |o| o.key.as_str());
            if last <= dir_prefix.as_str() || last.starts_with(dir_prefix.as_str()) {
                return Err(FsError::NotFound { path: dir_prefix });
            }
        } else {
            fs.seal_past_dirs(&prev, &[], dir.id());
        }
        page.next_marker = None;
        Ok(page)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::store::{ByteStream, MemoryStore, StoreResult, UnfinishedUpload};
    use std::ops::Range;

    /// Remembers every listing request it forwards.
    struct RecordingStore {
        inner: MemoryStore,
        lists: parking_lot::Mutex<Vec<ListRequest>>,
    }

    impl RecordingStore {
        fn take(&self) -> Vec<ListRequest> {
            std::mem::take(&mut *self.lists.lock())
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for RecordingStore {
        async fn head(&self, key: &str) -> StoreResult<ObjectInfo> {
            self.inner.head(key).await
        }

        async fn list(&self, req: ListRequest) -> StoreResult<ListPage> {
            self.lists.lock().push(req.clone());
            self.inner.list(req).await
        }

        async fn get(&self, key: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream> {
            self.inner.get(key, range).await
        }

        async fn list_unfinished_uploads(&self) -> StoreResult<Vec<UnfinishedUpload>> {
            self.inner.list_unfinished_uploads().await
        }

        async fn cancel_upload(&self, upload_id: &str) -> StoreResult<()> {
            self.inner.cancel_upload(upload_id).await
        }
    }

    fn recording_fs(inner: MemoryStore, config: FsConfig) -> (Arc<BucketFs>, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore {
            inner,
            lists: parking_lot::Mutex::new(Vec::new()),
        });
        let dynstore: Arc<dyn ObjectStore> = store.clone();
        (BucketFs::new(config, dynstore), store)
    }

    fn make_fs(store: MemoryStore, config: FsConfig) -> (Arc<BucketFs>, Arc<MemoryStore>) {
        let store = Arc::new(store);
        let dynstore: Arc<dyn ObjectStore> = store.clone();
        (BucketFs::new(config, dynstore), store)
    }

    async fn list_all(fs: &Arc<BucketFs>, path: &str) -> Vec<DirEntry> {
        let fh = fs.open_dir(path).await.unwrap();
        let handle = fs.dir_handle(fh).unwrap();
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(entry) = handle.read_dir(fs, offset).await.unwrap() {
            offset = entry.offset;
            out.push(entry);
        }
        fs.release_dir(fh).unwrap();
        out
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_listing_sorted_dirs_first() {
        let store = MemoryStore::new();
        store.put("b.txt", "b", 0);
        store.put("a.txt", "a", 0);
        store.put("z/1", "1", 0);
        store.put("m/", "", 0);
        let (fs, _) = make_fs(store, FsConfig::default());
        let entries = list_all(&fs, "").await;
        assert_eq!(names(&entries), vec![".", "..", "m", "z", "a.txt", "b.txt"]);
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5, 6]);
        assert!(entries.iter().all(|e| e.ino.is_some()));
        assert!(entries[0].is_dot());
    }

    #[tokio::test]
    async fn test_dot_entries_point_at_self_and_parent() {
        let store = MemoryStore::new();
        store.put("d/f", "f", 0);
        let (fs, _) = make_fs(store, FsConfig::default());
        let d = fs.resolve_path("d").await.unwrap();
        let entries = list_all(&fs, "d").await;
        assert_eq!(entries[0].ino, Some(d.id()));
        assert_eq!(entries[1].ino, Some(ROOT_INODE_ID));
        assert_eq!(names(&entries), vec![".", "..", "f"]);
    }

    #[tokio::test]
    async fn test_pagination_across_pages() {
        let store = MemoryStore::new();
        for i in 0..7 {
            store.put(&format!("f{}", i), "x", 0);
        }
        let config = FsConfig {
            list_page_size: 3,
            ..Default::default()
        };
        let (fs, mem) = make_fs(store, config);
        let entries = list_all(&fs, "").await;
        assert_eq!(names(&entries[2..]), vec!["f0", "f1", "f2", "f3", "f4", "f5", "f6"]);
        assert_eq!(entries.last().unwrap().offset, 9);
        assert_eq!(mem.stats().lists, 3);
    }

    #[tokio::test]
    async fn test_sealed_listing_served_from_cache() {
        let store = MemoryStore::new();
        store.put("a", "1", 0);
        store.put("b", "2", 0);
        let (fs, mem) = make_fs(store, FsConfig::default());
        list_all(&fs, "").await;
        let lists = mem.stats().lists;
        let again = list_all(&fs, "").await;
        assert_eq!(names(&again), vec![".", "..", "a", "b"]);
        assert_eq!(mem.stats().lists, lists);
    }

    #[tokio::test]
    async fn test_offset_past_end_is_invalid() {
        let store = MemoryStore::new();
        store.put("a", "1", 0);
        let config = FsConfig {
            type_cache_ttl_secs: 0,
            ..Default::default()
        };
        let (fs, _) = make_fs(store, config);
        let fh = fs.open_dir("").await.unwrap();
        let handle = fs.dir_handle(fh).unwrap();
        assert!(handle.read_dir(&fs, 3).await.unwrap().is_none());
        assert!(matches!(
            handle.read_dir(&fs, 10).await,
            Err(FsError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_dir_mtime_is_max_child_after_listing() {
        let store = MemoryStore::new();
        store.put("d/old", "1", 1_000_000);
        store.put("d/new", "2", 4_000_000_000_000);
        let (fs, _) = make_fs(store, FsConfig::default());
        list_all(&fs, "d").await;
        let d = fs.resolve_path("d").await.unwrap();
        assert_eq!(d.lock().attributes.mtime, 4_000_000_000);
    }

    #[tokio::test]
    async fn test_slurp_fills_sibling_subtrees() {
        let store = MemoryStore::new();
        for dir in ["a", "b", "c"] {
            store.put(&format!("top/{}/x/1", dir), "1", 0);
            store.put(&format!("top/{}/2", dir), "2", 0);
        }
        let (fs, mem) = make_fs(store, FsConfig::default());
        list_all(&fs, "top").await;
        // depth-first: a, then a's first child raises the score
        list_all(&fs, "top/a").await;
        list_all(&fs, "top/a/x").await;
        let before = mem.stats().lists;
        list_all(&fs, "top/b").await;
        list_all(&fs, "top/b/x").await;
        list_all(&fs, "top/c").await;
        list_all(&fs, "top/c/x").await;
        // at most one extra listing for the whole remaining walk
        assert!(mem.stats().lists - before <= 2);
        let leaves = list_all(&fs, "top/c/x").await;
        assert_eq!(names(&leaves), vec![".", "..", "1"]);
    }

    #[tokio::test]
    async fn test_cheap_slurp_runs_alone() {
        let store = MemoryStore::new();
        for dir in ["a", "b", "c"] {
            store.put(&format!("top/{}/x/1", dir), "1", 0);
            store.put(&format!("top/{}/2", dir), "2", 0);
        }
        let config = FsConfig {
            cheap: true,
            ..Default::default()
        };
        let (fs, rec) = recording_fs(store, config);
        list_all(&fs, "top").await;
        rec.take();

        // opening the first child puts "top" into readdir mode
        let entries = list_all(&fs, "top/a").await;
        assert_eq!(names(&entries), vec![".", "..", "x", "2"]);
        let lists = rec.take();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].prefix, "top/");
        assert_eq!(lists[0].delimiter, None);
        assert_eq!(lists[0].start_after.as_deref(), Some("top/a/"));

        for dir in ["top/a/x", "top/b", "top/b/x", "top/c", "top/c/x"] {
            list_all(&fs, dir).await;
        }
        assert!(rec.take().is_empty());
        assert_eq!(names(&list_all(&fs, "top/c/x").await), vec![".", "..", "1"]);
    }

    #[tokio::test]
    async fn test_cheap_slurp_stopping_inside_dir_falls_back() {
        let store = MemoryStore::new();
        for i in 0..6 {
            store.put(&format!("top/a/f{}", i), "x", 0);
        }
        store.put("top/b/1", "1", 0);
        let config = FsConfig {
            cheap: true,
            list_page_size: 3,
            ..Default::default()
        };
        let (fs, rec) = recording_fs(store, config);
        list_all(&fs, "top").await;
        rec.take();

        let entries = list_all(&fs, "top/a").await;
        assert_eq!(
            names(&entries),
            vec![".", "..", "f0", "f1", "f2", "f3", "f4", "f5"]
        );
        let lists = rec.take();
        assert!(lists.len() >= 3);
        assert_eq!(lists[0].delimiter, None);
        assert_eq!(lists[0].prefix, "top/");
        assert!(lists[1..]
            .iter()
            .all(|r| r.prefix == "top/a/" && r.delimiter == Some('/')));
    }
}
