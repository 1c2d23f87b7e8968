//! In-memory namespace nodes.
//!
//! An [`Inode`] carries immutable identity (id, name, full path, parent id,
//! kind) plus an [`InodeState`] behind its own lock. Directories own their
//! children; parents are referenced by id only. When two inode locks are
//! needed, the ancestor is locked first.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::attr::{FileAttr, FileType, InodeAttributes};
use crate::config::{expired, FsConfig};
use crate::store::ObjectInfo;

pub type InodeId = u64;

pub const ROOT_INODE_ID: InodeId = 1;

/// Metadata key holding the remote content hash.
pub const META_ETAG: &str = "etag";
/// Metadata key holding the remote storage class.
pub const META_STORAGE_CLASS: &str = "storage-class";

const MAX_OPEN_DIR_SCORE: u8 = 255;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
    /// Set once the entry is backed by an inode.
    pub ino: Option<InodeId>,
    pub attributes: InodeAttributes,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    /// Offset to resume the listing after this entry.
    pub offset: u64,
}

impl DirEntry {
    pub fn directory(name: &str, attributes: InodeAttributes) -> Self {
        DirEntry {
            name: name.to_string(),
            kind: FileType::Directory,
            ino: None,
            attributes,
            etag: None,
            storage_class: None,
            offset: 0,
        }
    }

    /// Entry for a listed object. Directory entries take `dir_attrs` and keep
    /// only the object's hash.
    pub fn from_object(obj: &ObjectInfo, name: &str, is_dir: bool, dir_attrs: InodeAttributes) -> Self {
        if is_dir {
            DirEntry {
                etag: obj.content_hash.clone(),
                ..DirEntry::directory(name, dir_attrs)
            }
        } else {
            DirEntry {
                name: name.to_string(),
                kind: FileType::RegularFile,
                ino: None,
                attributes: InodeAttributes::new(obj.size, obj.uploaded_at_secs()),
                etag: obj.content_hash.clone(),
                storage_class: obj.storage_class.clone(),
                offset: 0,
            }
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// True for the synthesized `.` and `..` entries.
    pub fn is_dot(&self) -> bool {
        self.is_dir() && (self.name == "." || self.name == "..")
    }
}

/// Orders directories before files, then by name.
pub fn entry_order(a_is_dir: bool, a_name: &str, b_is_dir: bool, b_name: &str) -> Ordering {
    (!a_is_dir, a_name).cmp(&(!b_is_dir, b_name))
}

/// Everything needed to create or refresh an inode after a remote lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeSeed {
    pub kind: FileType,
    pub attributes: InodeAttributes,
    pub known_size: u64,
    pub metadata: HashMap<String, String>,
    pub implicit_dir: bool,
}

impl InodeSeed {
    pub fn file(obj: &ObjectInfo) -> Self {
        let mut metadata = HashMap::new();
        if let Some(hash) = &obj.content_hash {
            metadata.insert(META_ETAG.to_string(), hash.clone());
        }
        if let Some(class) = &obj.storage_class {
            metadata.insert(META_STORAGE_CLASS.to_string(), class.clone());
        }
        InodeSeed {
            kind: FileType::RegularFile,
            attributes: InodeAttributes::new(obj.size, obj.uploaded_at_secs()),
            known_size: obj.size,
            metadata,
            implicit_dir: false,
        }
    }

    pub fn directory(dir_attrs: InodeAttributes, etag: Option<String>, implicit: bool) -> Self {
        let mut metadata = HashMap::new();
        if let Some(hash) = etag {
            metadata.insert(META_ETAG.to_string(), hash);
        }
        InodeSeed {
            kind: FileType::Directory,
            attributes: dir_attrs,
            known_size: dir_attrs.size,
            metadata,
            implicit_dir: implicit,
        }
    }

    pub fn from_entry(entry: &DirEntry) -> Self {
        let mut metadata = HashMap::new();
        if let Some(etag) = &entry.etag {
            metadata.insert(META_ETAG.to_string(), etag.clone());
        }
        if let Some(class) = &entry.storage_class {
            metadata.insert(META_STORAGE_CLASS.to_string(), class.clone());
        }
        InodeSeed {
            kind: entry.kind,
            attributes: entry.attributes,
            known_size: entry.attributes.size,
            metadata,
            implicit_dir: entry.is_dir() && entry.etag.is_none(),
        }
    }
}

/// Directory-only state.
#[derive(Debug, Default)]
pub struct DirData {
    /// Sorted by [`entry_order`].
    pub children: Vec<Arc<Inode>>,
    /// When the listing was last known complete.
    pub dir_time: Option<Instant>,
    pub seq_open_dir_score: u8,
    pub last_open_dir: Option<String>,
    pub last_open_dir_idx: usize,
}

impl DirData {
    fn search(&self, name: &str, is_dir: bool) -> Result<usize, usize> {
        self.children
            .binary_search_by(|c| entry_order(c.is_dir(), c.name(), is_dir, name))
    }

    /// Child with exactly this name and kind.
    pub fn find_exact(&self, name: &str, is_dir: bool) -> Option<&Arc<Inode>> {
        self.search(name, is_dir).ok().map(|i| &self.children[i])
    }

    /// Child with this name, preferring a file over a directory.
    pub fn find(&self, name: &str) -> Option<&Arc<Inode>> {
        self.find_exact(name, false)
            .or_else(|| self.find_exact(name, true))
    }

    pub fn find_idx(&self, name: &str) -> Option<usize> {
        self.search(name, false)
            .or_else(|_| self.search(name, true))
            .ok()
    }

    pub fn insert(&mut self, child: Arc<Inode>) {
        match self.search(child.name(), child.is_dir()) {
            Ok(_) => panic!("duplicate child {:?} inserted", child.full_name()),
            Err(i) => self.children.insert(i, child),
        }
    }

    pub fn remove(&mut self, child: &Inode) -> bool {
        match self.search(child.name(), child.is_dir()) {
            Ok(i) if self.children[i].id() == child.id() => {
                self.children.remove(i);
                true
            }
            _ => false,
        }
    }

    fn bump_score(&mut self) {
        if self.seq_open_dir_score < MAX_OPEN_DIR_SCORE {
            self.seq_open_dir_score += 1;
        }
    }
}

/// Mutable part of an inode, guarded by the inode lock.
#[derive(Debug)]
pub struct InodeState {
    pub attributes: InodeAttributes,
    pub known_size: u64,
    pub attr_time: Instant,
    pub invalid: bool,
    pub implicit_dir: bool,
    pub file_handles: u32,
    pub metadata: HashMap<String, String>,
    pub dir: Option<DirData>,
}

#[derive(Debug)]
pub struct Inode {
    id: InodeId,
    name: String,
    full_name: String,
    parent: Option<InodeId>,
    kind: FileType,
    state: Mutex<InodeState>,
}

impl Inode {
    pub fn root(attributes: InodeAttributes) -> Self {
        Inode {
            id: ROOT_INODE_ID,
            name: String::new(),
            full_name: String::new(),
            parent: None,
            kind: FileType::Directory,
            state: Mutex::new(InodeState {
                attributes,
                known_size: attributes.size,
                attr_time: Instant::now(),
                invalid: false,
                implicit_dir: false,
                file_handles: 0,
                metadata: HashMap::new(),
                dir: Some(DirData::default()),
            }),
        }
    }

    pub fn new(id: InodeId, parent: &Inode, name: &str, seed: InodeSeed) -> Self {
        Inode {
            id,
            name: name.to_string(),
            full_name: parent.child_name(name),
            parent: Some(parent.id),
            kind: seed.kind,
            state: Mutex::new(InodeState {
                attributes: seed.attributes,
                known_size: seed.known_size,
                attr_time: Instant::now(),
                invalid: false,
                implicit_dir: seed.implicit_dir,
                file_handles: 0,
                metadata: seed.metadata,
                dir: seed.kind.is_dir().then(DirData::default),
            }),
        }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the mount root, without a leading slash.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<InodeId> {
        self.parent
    }

    pub fn kind(&self) -> FileType {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    pub fn child_name(&self, name: &str) -> String {
        if self.full_name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.full_name, name)
        }
    }

    /// True if `other` lives somewhere below this inode.
    pub fn is_parent_of(&self, other: &Inode) -> bool {
        if other.id == self.id || other.parent.is_none() {
            return false;
        }
        if self.full_name.is_empty() {
            return true;
        }
        other
            .full_name
            .strip_prefix(self.full_name.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn log_fuse(&self, op: &str, detail: std::fmt::Arguments<'_>) {
        debug!("{} ino={} path={:?} {}", op, self.id, self.full_name, detail);
    }

    /// Replaces the remote-derived attributes after a successful revalidation.
    pub fn refresh(&self, seed: &InodeSeed) {
        let mut st = self.lock();
        Self::apply_seed(self.is_dir(), &mut st, seed);
        st.implicit_dir = seed.implicit_dir;
    }

    /// Like [`Inode::refresh`] for an entry seen in a listing. Listings do
    /// not always carry the marker object, so they can only mark a
    /// directory explicit, never implicit again.
    pub fn refresh_listed(&self, seed: &InodeSeed) {
        let mut st = self.lock();
        Self::apply_seed(self.is_dir(), &mut st, seed);
        st.implicit_dir &= seed.implicit_dir;
    }

    fn apply_seed(is_dir: bool, st: &mut InodeState, seed: &InodeSeed) {
        if !is_dir {
            st.attributes = seed.attributes;
        }
        st.known_size = seed.known_size;
        st.attr_time = Instant::now();
        st.invalid = false;
        for (k, v) in &seed.metadata {
            st.metadata.insert(k.clone(), v.clone());
        }
    }

    /// Largest mtime among this directory and its children.
    ///
    /// Takes the already-held state of this inode; children are locked one
    /// at a time.
    pub fn find_child_max_time(st: &InodeState) -> u64 {
        let own = st.attributes.mtime;
        st.dir
            .as_ref()
            .map(|d| {
                d.children
                    .iter()
                    .map(|c| c.lock().attributes.mtime)
                    .fold(own, u64::max)
            })
            .unwrap_or(own)
    }

    /// Marks the listing complete now and recomputes mtime from the children.
    pub fn seal(&self) {
        let mut st = self.lock();
        let max = Inode::find_child_max_time(&st);
        st.attributes.mtime = max;
        if let Some(dir) = st.dir.as_mut() {
            dir.dir_time = Some(Instant::now());
        }
    }

    pub fn inflate_attributes(&self, config: &FsConfig) -> FileAttr {
        let attrs = self.lock().attributes;
        let perm = if self.is_dir() {
            config.dir_mode
        } else {
            config.file_mode
        };
        FileAttr::inflate(self.id, self.kind, attrs, perm, config.uid, config.gid)
    }

    /// Serves listing position `offset` (2 and up) from cached children.
    ///
    /// Returns `None` when the cached listing has expired, `Some(None)` past
    /// the last child.
    pub fn read_dir_from_cache(&self, offset: u64, ttl: Duration) -> Option<Option<DirEntry>> {
        let st = self.lock();
        let dir = st.dir.as_ref()?;
        if expired(dir.dir_time, ttl) {
            return None;
        }
        let idx = offset.checked_sub(2)? as usize;
        let entry = dir.children.get(idx).map(|child| {
            let cst = child.lock();
            DirEntry {
                name: child.name.clone(),
                kind: child.kind,
                ino: Some(child.id),
                attributes: cst.attributes,
                etag: cst.metadata.get(META_ETAG).cloned(),
                storage_class: cst.metadata.get(META_STORAGE_CLASS).cloned(),
                offset: offset + 1,
            }
        });
        Some(entry)
    }

    /// Updates the parent's sequential-access score for opening this
    /// directory and lets a fresh directory inherit it.
    pub fn update_open_dir_score(&self, parent: &Inode) {
        let mut pst = parent.lock();
        let Some(pdir) = pst.dir.as_mut() else {
            return;
        };
        let num = pdir.children.len();

        if pdir.last_open_dir.is_none() && num > 0 && pdir.children[0].name == self.name {
            // depth-first: the first child of a directory was opened
            pdir.bump_score();
            pdir.last_open_dir_idx = 0;
            if pdir.seq_open_dir_score >= 2 {
                debug!("{:?} in readdir mode", parent.full_name);
            }
        } else if pdir.last_open_dir.is_some()
            && pdir.last_open_dir_idx + 1 < num
            && pdir.children[pdir.last_open_dir_idx + 1].name == self.name
            && pdir.last_open_dir.as_deref() == Some(pdir.children[pdir.last_open_dir_idx].name.as_str())
        {
            // breadth-first: the next sibling of the last opened one
            pdir.bump_score();
            pdir.last_open_dir_idx += 1;
            if pdir.seq_open_dir_score == 2 {
                debug!("{:?} in readdir mode", parent.full_name);
            }
        } else {
            pdir.seq_open_dir_score = 0;
            match pdir.find_idx(&self.name) {
                Some(idx) => pdir.last_open_dir_idx = idx,
                None => {
                    pdir.last_open_dir = None;
                    return;
                }
            }
        }
        pdir.last_open_dir = Some(self.name.clone());
        let score = pdir.seq_open_dir_score;

        let mut st = self.lock();
        if let Some(dir) = st.dir.as_mut() {
            if dir.last_open_dir.is_none() {
                dir.seq_open_dir_score = score;
                if score >= 2 {
                    debug!("{:?} in readdir mode", self.full_name);
                }
            }
        }
    }
}
