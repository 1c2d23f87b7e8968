//! Filesystem state: the inode table, path index, handle tables and the
//! lookup-or-validate protocol that keeps them consistent.
//!
//! The global lock in [`BucketFs`] is taken before any inode lock and is never
//! held across a remote call. Reference counts live in the inode table, so
//! they only change under the global lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::attr::{secs_since_epoch, InodeAttributes, DIR_SIZE};
use crate::config::{expired, FsConfig};
use crate::dir_handle::DirHandle;
use crate::error::{FsError, Result};
use crate::file_handle::FileHandle;
use crate::inode::{DirEntry, Inode, InodeId, InodeSeed, ROOT_INODE_ID};
use crate::lookup::{self, ProbeOptions};
use crate::pool::BufferPool;
use crate::store::{ObjectInfo, ObjectStore};
use crate::ticket::{Ticket, REPLICATOR_TICKETS, RESTORER_TICKETS};

struct InodeSlot {
    inode: Arc<Inode>,
    refcnt: u64,
}

struct FsState {
    inodes: HashMap<InodeId, InodeSlot>,
    paths: HashMap<String, InodeId>,
    next_inode_id: InodeId,
    next_handle_id: u64,
    dir_handles: HashMap<u64, Arc<DirHandle>>,
    file_handles: HashMap<u64, Arc<FileHandle>>,
}

pub struct BucketFs {
    config: FsConfig,
    store: Arc<dyn ObjectStore>,
    pool: Arc<BufferPool>,
    root_attrs: InodeAttributes,
    replicators: Ticket,
    restorers: Ticket,
    state: Mutex<FsState>,
}

impl std::fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketFs")
            .field("bucket", &self.config.bucket)
            .field("prefix", &self.config.prefix)
            .field("inodes", &self.inode_count())
            .finish()
    }
}

impl BucketFs {
    pub fn new(config: FsConfig, store: Arc<dyn ObjectStore>) -> Arc<Self> {
        let root_attrs = InodeAttributes::new(DIR_SIZE, secs_since_epoch(SystemTime::now()));
        let root = Arc::new(Inode::root(root_attrs));
        let pool = BufferPool::new(config.pool_block_size, config.pool_max_buffers);

        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INODE_ID,
            InodeSlot {
                inode: root,
                refcnt: 1,
            },
        );
        let mut paths = HashMap::new();
        paths.insert(String::new(), ROOT_INODE_ID);

        info!(
            "bucketfs: bucket={} prefix={:?} cheap={} explicit_dir={}",
            config.bucket, config.prefix, config.cheap, config.explicit_dir
        );

        Arc::new(Self {
            config,
            store,
            pool,
            root_attrs,
            replicators: Ticket::new(REPLICATOR_TICKETS),
            restorers: Ticket::new(RESTORER_TICKETS),
            state: Mutex::new(FsState {
                inodes,
                paths,
                next_inode_id: ROOT_INODE_ID + 1,
                next_handle_id: 1,
                dir_handles: HashMap::new(),
                file_handles: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Attributes shared by every directory: synthetic size, mount time.
    pub fn root_attrs(&self) -> InodeAttributes {
        self.root_attrs
    }

    pub fn replicators(&self) -> &Ticket {
        &self.replicators
    }

    pub fn restorers(&self) -> &Ticket {
        &self.restorers
    }

    pub fn inode_count(&self) -> usize {
        self.state.lock().inodes.len()
    }

    pub fn root(&self) -> Arc<Inode> {
        match self.inode(ROOT_INODE_ID) {
            Ok(root) => root,
            Err(_) => unreachable!("root inode is never removed"),
        }
    }

    pub fn inode(&self, ino: InodeId) -> Result<Arc<Inode>> {
        self.state
            .lock()
            .inodes
            .get(&ino)
            .map(|slot| Arc::clone(&slot.inode))
            .ok_or_else(|| FsError::NotFound {
                path: format!("inode {}", ino),
            })
    }

    pub fn path_of(&self, ino: InodeId) -> Result<String> {
        self.inode(ino).map(|inode| inode.full_name().to_string())
    }

    /// Reference count held by the kernel, if the inode is live.
    pub fn refcnt(&self, ino: InodeId) -> Option<u64> {
        self.state.lock().inodes.get(&ino).map(|slot| slot.refcnt)
    }

    fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            cheap: self.config.cheap,
            explicit_dir: self.config.explicit_dir,
            dir_attrs: self.root_attrs,
        }
    }

    /// Cached attributes are trusted while within the stat TTL, and always
    /// while the inode has open file handles.
    fn is_fresh(&self, inode: &Inode) -> bool {
        let st = inode.lock();
        st.file_handles > 0 || (!st.invalid && !expired(Some(st.attr_time), self.config.stat_cache_ttl()))
    }

    /// Resolves a mount-relative path to its inode, revalidating stale
    /// segments against the store.
    pub async fn resolve_path(&self, path: &str) -> Result<Arc<Inode>> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(self.root());
        }

        let cached = {
            let st = self.state.lock();
            st.paths
                .get(path)
                .and_then(|id| st.inodes.get(id))
                .map(|slot| Arc::clone(&slot.inode))
        };
        if let Some(inode) = cached {
            if self.is_fresh(&inode) {
                return Ok(inode);
            }
        }

        let mut cur = self.root();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = self.lookup_child(&cur, seg, false).await?;
        }
        Ok(cur)
    }

    /// Resolves an inode number the kernel holds. A live inode within its
    /// TTL is answered by id, so a directory shadowed by a file of the same
    /// name stays reachable; a stale one is revalidated through its path.
    pub async fn resolve_ino(&self, ino: InodeId) -> Result<Arc<Inode>> {
        let inode = self.inode(ino)?;
        if self.is_fresh(&inode) {
            return Ok(inode);
        }
        self.resolve_path(inode.full_name()).await
    }

    /// Looks up `name` under `parent`, trusting a fresh cached child and
    /// probing the store otherwise. With `take_ref` the result carries one
    /// more kernel reference.
    pub async fn lookup_child(&self, parent: &Arc<Inode>, name: &str, take_ref: bool) -> Result<Arc<Inode>> {
        if !parent.is_dir() {
            return Err(FsError::NotDirectory {
                path: parent.full_name().to_string(),
            });
        }

        let cached = {
            let mut st = self.state.lock();
            let child = parent
                .lock()
                .dir
                .as_ref()
                .and_then(|d| d.find(name).cloned());
            if let Some(child) = &child {
                if take_ref {
                    if let Some(slot) = st.inodes.get_mut(&child.id()) {
                        slot.refcnt += 1;
                    }
                }
            }
            child
        };

        if let Some(child) = &cached {
            if self.is_fresh(child) {
                child.log_fuse("LookUp", format_args!("cached"));
                return Ok(Arc::clone(child));
            }
        }

        let key = self.config.key(&parent.child_name(name));
        let res = lookup::probe(&self.store, &key, self.probe_options()).await;

        let mut st = self.state.lock();
        match res {
            Err(e) => {
                if let Some(child) = cached {
                    let left = if take_ref {
                        Self::unref(&mut st, child.id(), 1)
                    } else {
                        st.inodes.get(&child.id()).map_or(0, |slot| slot.refcnt)
                    };
                    if e.is_not_found() {
                        child.lock().invalid = true;
                        if left == 0 && child.lock().file_handles == 0 {
                            Self::remove_inode(&mut st, &child);
                        }
                    }
                }
                Err(e)
            }
            Ok(seed) => match cached {
                Some(child) if child.kind() == seed.kind => {
                    child.refresh(&seed);
                    child.log_fuse("LookUp", format_args!("revalidated"));
                    Ok(child)
                }
                Some(child) => {
                    // the name changed kind remotely
                    child.lock().invalid = true;
                    let left = if take_ref {
                        Self::unref(&mut st, child.id(), 1)
                    } else {
                        st.inodes.get(&child.id()).map_or(0, |slot| slot.refcnt)
                    };
                    if left == 0 && child.lock().file_handles == 0 {
                        Self::remove_inode(&mut st, &child);
                    }
                    Ok(self.insert_locked(&mut st, parent, name, &seed, u64::from(take_ref), false))
                }
                None => Ok(self.insert_locked(&mut st, parent, name, &seed, u64::from(take_ref), false)),
            },
        }
    }

    /// Inserts `name` under `parent`, or refreshes the existing child of the
    /// same kind in place and adds `refs` to its count.
    fn insert_locked(
        &self,
        st: &mut FsState,
        parent: &Arc<Inode>,
        name: &str,
        seed: &InodeSeed,
        refs: u64,
        listed: bool,
    ) -> Arc<Inode> {
        let mut pst = parent.lock();
        let Some(dir) = pst.dir.as_mut() else {
            unreachable!("insert under non-directory {:?}", parent.full_name());
        };

        if let Some(existing) = dir.find_exact(name, seed.kind.is_dir()).cloned() {
            drop(pst);
            if listed {
                existing.refresh_listed(seed);
            } else {
                existing.refresh(seed);
            }
            if let Some(slot) = st.inodes.get_mut(&existing.id()) {
                slot.refcnt += refs;
            }
            return existing;
        }

        let id = st.next_inode_id;
        st.next_inode_id += 1;
        let inode = Arc::new(Inode::new(id, parent, name, seed.clone()));
        dir.insert(Arc::clone(&inode));
        drop(pst);

        let path = inode.full_name().to_string();
        if seed.kind.is_dir() {
            st.paths.entry(path).or_insert(id);
        } else {
            st.paths.insert(path, id);
        }
        st.inodes.insert(
            id,
            InodeSlot {
                inode: Arc::clone(&inode),
                refcnt: refs,
            },
        );
        inode.log_fuse("Insert", format_args!("kind={:?} refs={}", seed.kind, refs));
        inode
    }

    /// Adds a listed entry to `parent` without a kernel reference.
    pub fn insert_from_dir_entry(&self, parent: &Arc<Inode>, entry: &DirEntry) -> Arc<Inode> {
        let seed = InodeSeed::from_entry(entry);
        let mut st = self.state.lock();
        self.insert_locked(&mut st, parent, &entry.name, &seed, 0, true)
    }

    fn unref(st: &mut FsState, id: InodeId, n: u64) -> u64 {
        match st.inodes.get_mut(&id) {
            Some(slot) => {
                slot.refcnt = slot.refcnt.saturating_sub(n);
                slot.refcnt
            }
            None => 0,
        }
    }

    fn remove_inode(st: &mut FsState, inode: &Arc<Inode>) {
        if inode.id() == ROOT_INODE_ID {
            return;
        }
        inode.log_fuse("Remove", format_args!(""));
        st.inodes.remove(&inode.id());
        if st.paths.get(inode.full_name()) == Some(&inode.id()) {
            st.paths.remove(inode.full_name());
        }
        if let Some(parent) = inode.parent().and_then(|p| st.inodes.get(&p)) {
            if let Some(dir) = parent.inode.lock().dir.as_mut() {
                dir.remove(inode);
            }
        }

        // cached descendants go too unless the kernel still holds them
        let children: Vec<Arc<Inode>> = inode
            .lock()
            .dir
            .as_mut()
            .map(|d| std::mem::take(&mut d.children))
            .unwrap_or_default();
        for child in children {
            let held = st.inodes.get(&child.id()).is_some_and(|slot| slot.refcnt > 0)
                || child.lock().file_handles > 0;
            if !held {
                Self::detach_subtree(st, &child);
            }
        }
    }

    fn detach_subtree(st: &mut FsState, inode: &Arc<Inode>) {
        st.inodes.remove(&inode.id());
        if st.paths.get(inode.full_name()) == Some(&inode.id()) {
            st.paths.remove(inode.full_name());
        }
        let children: Vec<Arc<Inode>> = inode
            .lock()
            .dir
            .as_mut()
            .map(|d| std::mem::take(&mut d.children))
            .unwrap_or_default();
        for child in children {
            Self::detach_subtree(st, &child);
        }
    }

    /// Drops `nlookup` kernel references to `ino`.
    pub fn forget(&self, ino: InodeId, nlookup: u64) {
        if ino == ROOT_INODE_ID {
            return;
        }
        let mut st = self.state.lock();
        let Some(inode) = st.inodes.get(&ino).map(|slot| Arc::clone(&slot.inode)) else {
            return;
        };
        let left = Self::unref(&mut st, ino, nlookup);
        debug!("forget ino={} nlookup={} left={}", ino, nlookup, left);
        if left == 0 && inode.lock().file_handles == 0 {
            Self::remove_inode(&mut st, &inode);
        }
    }

    /// Registers a handle on a resolved directory.
    pub async fn open_dir(&self, path: &str) -> Result<u64> {
        let inode = self.resolve_path(path).await?;
        self.open_dir_inode(inode)
    }

    pub fn open_dir_inode(&self, inode: Arc<Inode>) -> Result<u64> {
        if !inode.is_dir() {
            return Err(FsError::NotDirectory {
                path: inode.full_name().to_string(),
            });
        }
        if let Some(parent) = inode.parent().and_then(|p| self.inode(p).ok()) {
            inode.update_open_dir_score(&parent);
        }
        inode.log_fuse("OpenDir", format_args!(""));

        let handle = Arc::new(DirHandle::new(inode));
        let mut st = self.state.lock();
        let fh = st.next_handle_id;
        st.next_handle_id += 1;
        st.dir_handles.insert(fh, handle);
        Ok(fh)
    }

    pub fn dir_handle(&self, fh: u64) -> Result<Arc<DirHandle>> {
        self.state
            .lock()
            .dir_handles
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle { fh })
    }

    pub fn release_dir(&self, fh: u64) -> Result<()> {
        self.state
            .lock()
            .dir_handles
            .remove(&fh)
            .map(|_| ())
            .ok_or(FsError::BadHandle { fh })
    }

    /// Registers a read handle on a resolved file.
    pub async fn open_file(&self, path: &str) -> Result<u64> {
        let inode = self.resolve_path(path).await?;
        self.open_file_inode(inode)
    }

    pub fn open_file_inode(&self, inode: Arc<Inode>) -> Result<u64> {
        if inode.is_dir() {
            return Err(FsError::IsDirectory {
                path: inode.full_name().to_string(),
            });
        }
        let size = {
            let mut ist = inode.lock();
            ist.file_handles += 1;
            ist.known_size
        };
        inode.log_fuse("OpenFile", format_args!("size={}", size));

        let key = self.config.key(inode.full_name());
        let handle = Arc::new(FileHandle::new(inode, key, size));
        let mut st = self.state.lock();
        let fh = st.next_handle_id;
        st.next_handle_id += 1;
        st.file_handles.insert(fh, handle);
        Ok(fh)
    }

    pub fn file_handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.state
            .lock()
            .file_handles
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle { fh })
    }

    pub fn take_file_handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.state
            .lock()
            .file_handles
            .remove(&fh)
            .ok_or(FsError::BadHandle { fh })
    }

    /// Materializes one slurped key below `base`, creating every directory on
    /// the way. Returns the chain of directories the key lives in, outermost
    /// first.
    pub fn insert_subtree(&self, base: &Arc<Inode>, rel_key: &str, obj: &ObjectInfo) -> Vec<Arc<Inode>> {
        let mut parts: Vec<&str> = rel_key.split('/').collect();
        let leaf = parts.pop().unwrap_or_default();

        let mut chain = Vec::with_capacity(parts.len());
        let mut cur = Arc::clone(base);
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                break;
            }
            let mut entry = DirEntry::directory(part, self.root_attrs);
            // a key ending in '/' is the marker of the innermost directory
            if leaf.is_empty() && i + 1 == parts.len() {
                entry.etag = obj.content_hash.clone();
            }
            cur = self.insert_from_dir_entry(&cur, &entry);
            chain.push(Arc::clone(&cur));
        }

        if !leaf.is_empty() && chain.len() == parts.len() {
            let entry = DirEntry::from_object(obj, leaf, false, self.root_attrs);
            self.insert_from_dir_entry(&cur, &entry);
        }
        chain
    }

    /// Seals directories that were open in `prev` but not in `next`, except
    /// `skip`. Keys arrive in order, so a directory left behind is complete.
    pub fn seal_past_dirs(&self, prev: &[Arc<Inode>], next: &[Arc<Inode>], skip: InodeId) {
        let common = prev
            .iter()
            .zip(next.iter())
            .take_while(|(a, b)| a.id() == b.id())
            .count();
        for dir in prev[common..].iter().rev() {
            if dir.id() != skip {
                dir.log_fuse("Seal", format_args!(""));
                dir.seal();
            }
        }
    }
}
