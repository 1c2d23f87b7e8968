//! The kernel-facing operation surface.
//!
//! Paths are relative to the mount root, without a leading slash. Mutating
//! operations are not supported on a bucket mount and fall through to the
//! default methods.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::attr::FileAttr;
use crate::error::{FsError, Result};
use crate::fs::BucketFs;
use crate::inode::{DirEntry, InodeId};

/// Entries handed back per readdir call.
pub const READDIR_BATCH: usize = 128;

const STATFS_BLOCK_SIZE: u32 = 4096;
const STATFS_CAPACITY: u64 = 1 << 50;
const STATFS_INODES: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatfsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReply {
    pub fh: u64,
    /// Lets the kernel keep cached pages across opens.
    pub keep_cache: bool,
}

#[async_trait]
pub trait FsOperations: Send + Sync {
    async fn statfs(&self) -> Result<StatfsReply>;

    /// Looks up `name` in directory `parent`, taking one kernel reference.
    async fn lookup(&self, parent: &str, name: &str) -> Result<FileAttr>;

    fn forget(&self, ino: InodeId, nlookup: u64);

    async fn getattr(&self, path: &str) -> Result<FileAttr>;

    async fn opendir(&self, path: &str) -> Result<u64>;

    /// Returns the entries starting at `offset`. An empty batch ends the
    /// listing.
    async fn readdir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>>;

    async fn releasedir(&self, fh: u64) -> Result<()>;

    async fn open(&self, path: &str) -> Result<OpenReply>;

    async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>>;

    async fn release(&self, fh: u64) -> Result<()>;

    /// Succeeds without doing anything; tools that sync between writes must
    /// not fail on a read-only mount.
    async fn fsync(&self, _fh: u64) -> Result<()> {
        Ok(())
    }

    async fn flush(&self, _fh: u64) -> Result<()> {
        Err(FsError::not_supported("flush"))
    }

    async fn write(&self, _fh: u64, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(FsError::not_supported("write"))
    }

    async fn create(&self, _parent: &str, _name: &str, _mode: u32) -> Result<(FileAttr, OpenReply)> {
        Err(FsError::not_supported("create"))
    }

    async fn mkdir(&self, _parent: &str, _name: &str, _mode: u32) -> Result<FileAttr> {
        Err(FsError::not_supported("mkdir"))
    }

    async fn rmdir(&self, _parent: &str, _name: &str) -> Result<()> {
        Err(FsError::not_supported("rmdir"))
    }

    async fn unlink(&self, _parent: &str, _name: &str) -> Result<()> {
        Err(FsError::not_supported("unlink"))
    }

    async fn rename(&self, _parent: &str, _name: &str, _new_parent: &str, _new_name: &str) -> Result<()> {
        Err(FsError::not_supported("rename"))
    }

    async fn getxattr(&self, _path: &str, _name: &str) -> Result<Vec<u8>> {
        Err(FsError::not_supported("getxattr"))
    }

    async fn setxattr(&self, _path: &str, _name: &str, _value: &[u8]) -> Result<()> {
        Err(FsError::not_supported("setxattr"))
    }

    async fn listxattr(&self, _path: &str) -> Result<Vec<String>> {
        Err(FsError::not_supported("listxattr"))
    }

    async fn removexattr(&self, _path: &str, _name: &str) -> Result<()> {
        Err(FsError::not_supported("removexattr"))
    }

    async fn mknod(&self, _parent: &str, _name: &str, _mode: u32) -> Result<FileAttr> {
        Err(FsError::not_supported("mknod"))
    }

    async fn symlink(&self, _parent: &str, _name: &str, _target: &str) -> Result<FileAttr> {
        Err(FsError::not_supported("symlink"))
    }

    async fn readlink(&self, _path: &str) -> Result<String> {
        Err(FsError::not_supported("readlink"))
    }
}

#[async_trait]
impl FsOperations for Arc<BucketFs> {
    async fn statfs(&self) -> Result<StatfsReply> {
        let blocks = STATFS_CAPACITY / u64::from(STATFS_BLOCK_SIZE);
        Ok(StatfsReply {
            blocks,
            bfree: blocks,
            bavail: blocks,
            files: STATFS_INODES,
            ffree: STATFS_INODES,
            bsize: STATFS_BLOCK_SIZE,
            namelen: 255,
            frsize: STATFS_BLOCK_SIZE,
        })
    }

    async fn lookup(&self, parent: &str, name: &str) -> Result<FileAttr> {
        let parent = self.resolve_path(parent).await?;
        let inode = self.lookup_child(&parent, name, true).await?;
        Ok(inode.inflate_attributes(self.config()))
    }

    fn forget(&self, ino: InodeId, nlookup: u64) {
        BucketFs::forget(self, ino, nlookup)
    }

    async fn getattr(&self, path: &str) -> Result<FileAttr> {
        let inode = self.resolve_path(path).await?;
        inode.log_fuse("GetAttr", format_args!(""));
        Ok(inode.inflate_attributes(self.config()))
    }

    async fn opendir(&self, path: &str) -> Result<u64> {
        self.open_dir(path).await
    }

    async fn readdir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>> {
        let handle = self.dir_handle(fh)?;
        let mut out = Vec::new();
        let mut next = offset;
        while out.len() < READDIR_BATCH {
            match handle.read_dir(self, next).await {
                Ok(Some(entry)) => {
                    next = entry.offset;
                    out.push(entry);
                }
                Ok(None) => break,
                Err(e) if e.is_not_found() => break,
                Err(e @ FsError::InvalidArgument { .. }) => return Err(e),
                Err(e) if out.is_empty() => {
                    debug!("readdir fh={} offset={} failed: {}", fh, next, e);
                    return Err(FsError::Busy { msg: e.to_string() });
                }
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn releasedir(&self, fh: u64) -> Result<()> {
        self.release_dir(fh)
    }

    async fn open(&self, path: &str) -> Result<OpenReply> {
        let fh = self.open_file(path).await?;
        Ok(OpenReply { fh, keep_cache: true })
    }

    async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.file_handle(fh)?;
        handle.read_file(self, offset, size as usize).await
    }

    async fn release(&self, fh: u64) -> Result<()> {
        let handle = self.take_file_handle(fh)?;
        handle.release().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::store::{MemoryStore, ObjectStore};

    fn make_fs() -> Arc<BucketFs> {
        let store = MemoryStore::new();
        store.put("dir/file.txt", "contents", 1_000);
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        BucketFs::new(FsConfig::default(), store)
    }

    #[tokio::test]
    async fn test_statfs_is_synthetic() {
        let fs = make_fs();
        let reply = fs.statfs().await.unwrap();
        assert_eq!(reply.bsize, 4096);
        assert_eq!(reply.blocks * u64::from(reply.bsize), 1 << 50);
        assert_eq!(reply.files, 1_000_000_000);
    }

    #[tokio::test]
    async fn test_lookup_then_read() {
        let fs = make_fs();
        let attr = fs.lookup("dir", "file.txt").await.unwrap();
        assert_eq!(attr.size, 8);
        assert_eq!(fs.refcnt(attr.ino), Some(1));
        let open = fs.open("dir/file.txt").await.unwrap();
        assert!(open.keep_cache);
        assert_eq!(fs.read(open.fh, 3, 100).await.unwrap(), b"tents");
        fs.release(open.fh).await.unwrap();
        assert!(matches!(
            fs.read(open.fh, 0, 1).await,
            Err(FsError::BadHandle { .. })
        ));
    }

    #[tokio::test]
    async fn test_readdir_batches_until_end() {
        let fs = make_fs();
        let fh = fs.opendir("dir").await.unwrap();
        let entries = fs.readdir(fh, 0).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "file.txt"]);
        assert!(fs.readdir(fh, 3).await.unwrap().is_empty());
        fs.releasedir(fh).await.unwrap();
        assert!(fs.releasedir(fh).await.is_err());
    }

    #[tokio::test]
    async fn test_mutations_unsupported() {
        let fs = make_fs();
        assert_eq!(
            fs.mkdir("", "new", 0o755).await.unwrap_err().to_errno(),
            libc::ENOSYS
        );
        assert!(fs.write(1, 0, b"x").await.is_err());
        assert!(fs.unlink("dir", "file.txt").await.is_err());
        assert!(fs.rename("dir", "file.txt", "", "x").await.is_err());
        assert!(fs.symlink("", "l", "dir").await.is_err());
        assert!(fs.readlink("dir/file.txt").await.is_err());
        assert!(fs.getxattr("dir", "user.x").await.is_err());
        fs.fsync(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_readdir_remote_failure_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", "1", 0);
        let dynstore: Arc<dyn ObjectStore> = store.clone();
        let fs = BucketFs::new(FsConfig::default(), dynstore);
        let fh = fs.opendir("").await.unwrap();
        store.set_failure(Some(crate::store::StoreError::from_status(502, "bad gateway")));
        // dots still come back, the failure surfaces on the first real entry
        assert_eq!(fs.readdir(fh, 0).await.unwrap().len(), 2);
        let err = fs.readdir(fh, 2).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EAGAIN);
    }
}
