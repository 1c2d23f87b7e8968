//! `fuser::Filesystem` adapter.
//!
//! The kernel speaks in inode numbers; [`FsOperations`] speaks in paths.
//! getattr and the open calls resolve the inode by id; the rest map it to
//! its full name. Every operation runs on the tokio runtime and replies from
//! inside the task so slow remote calls never block the session loop.

use std::ffi::OsStr;
use std::future::Future;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
};
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::fs::BucketFs;
use crate::ops::FsOperations;

pub struct FuseBridge {
    fs: Arc<BucketFs>,
    rt: Handle,
    ttl: Duration,
}

impl FuseBridge {
    pub fn new(fs: Arc<BucketFs>, rt: Handle) -> Self {
        let ttl = fs.config().stat_cache_ttl();
        Self { fs, rt, ttl }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.rt.spawn(fut);
    }

    fn path(&self, ino: u64) -> Result<String> {
        self.fs.path_of(ino)
    }
}

fn name_str(name: &OsStr) -> Result<String> {
    name.to_str().map(str::to_string).ok_or_else(|| FsError::InvalidArgument {
        msg: format!("non UTF-8 name {:?}", name),
    })
}

/// Answers an xattr request: a size probe when `size` is zero, the data when it
/// fits, `ERANGE` otherwise.
fn xattr_reply(data: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

fn xattr_list(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        debug!("bucketfs init bucket={}", self.fs.config().bucket);
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup parent={} name={:?}", parent, name);
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.lookup(&parent_path, &name).await {
                Ok(attr) => reply.entry(&ttl, &attr.to_fuser(), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        FsOperations::forget(&self.fs, ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.resolve_ino(ino).await {
                Ok(inode) => {
                    inode.log_fuse("GetAttr", format_args!(""));
                    reply.attr(&ttl, &inode.inflate_attributes(fs.config()).to_fuser());
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino={}", ino);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.resolve_ino(ino).await.and_then(|inode| fs.open_dir_inode(inode)) {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        debug!("readdir ino={} fh={} offset={}", ino, fh, offset);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.readdir(fh, offset.max(0) as u64).await {
                Ok(entries) => {
                    for entry in entries {
                        let entry_ino = entry.ino.unwrap_or(ino);
                        if reply.add(entry_ino, entry.offset as i64, entry.kind.to_fuser(), &entry.name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir fh={}", fh);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.releasedir(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("open ino={}", ino);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.resolve_ino(ino).await.and_then(|inode| fs.open_file_inode(inode)) {
                Ok(fh) => reply.opened(fh, fuser::consts::FOPEN_KEEP_CACHE),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} fh={} offset={} size={}", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.read(fh, offset as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release fh={}", fh);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.release(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.statfs().await {
                Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.fsync(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.flush(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let fs = Arc::clone(&self.fs);
        let data = data.to_vec();
        self.spawn(async move {
            match fs.write(fh, offset.max(0) as u64, &data).await {
                Ok(n) => reply.written(n),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.create(&parent_path, &name, mode).await {
                Ok((attr, open)) => reply.created(&ttl, &attr.to_fuser(), 0, open.fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.mkdir(&parent_path, &name, mode).await {
                Ok(attr) => reply.entry(&ttl, &attr.to_fuser(), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.mknod(&parent_path, &name, mode).await {
                Ok(attr) => reply.entry(&ttl, &attr.to_fuser(), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(link_name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let target = target.to_string_lossy().into_owned();
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.spawn(async move {
            match fs.symlink(&parent_path, &name, &target).await {
                Ok(attr) => reply.entry(&ttl, &attr.to_fuser(), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.readlink(&path).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.unlink(&parent_path, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (parent_path, name) = match self.path(parent).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.rmdir(&parent_path, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self.path(parent).and_then(|p| {
            Ok((p, name_str(name)?, self.path(newparent)?, name_str(newname)?))
        });
        let (parent_path, name, new_parent_path, new_name) = match paths {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.rename(&parent_path, &name, &new_parent_path, &new_name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (path, name) = match self.path(ino).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let value = value.to_vec();
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.setxattr(&path, &name, &value).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (path, name) = match self.path(ino).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.getxattr(&path, &name).await {
                Ok(value) => xattr_reply(&value, size, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.listxattr(&path).await {
                Ok(names) => xattr_reply(&xattr_list(&names), size, reply),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, name) = match self.path(ino).and_then(|p| Ok((p, name_str(name)?))) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.removexattr(&path, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}
