use std::time::{Duration, SystemTime};

/// Size reported for every directory.
pub const DIR_SIZE: u64 = 4096;

/// The remote-derived part of an inode's attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeAttributes {
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
}

impl InodeAttributes {
    pub fn new(size: u64, mtime: u64) -> Self {
        Self { size, mtime }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
}

impl FileType {
    pub fn is_dir(self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn to_fuser(self) -> fuser::FileType {
        match self {
            FileType::RegularFile => fuser::FileType::RegularFile,
            FileType::Directory => fuser::FileType::Directory,
        }
    }

    fn type_bits(self) -> u32 {
        match self {
            FileType::RegularFile => libc::S_IFREG as u32,
            FileType::Directory => libc::S_IFDIR as u32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

impl FileAttr {
    /// Builds the POSIX view of an inode. All timestamps are the object's
    /// modification time.
    pub fn inflate(
        ino: u64,
        kind: FileType,
        attrs: InodeAttributes,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Self {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(attrs.mtime);
        FileAttr {
            ino,
            size: attrs.size,
            blocks: blocks_for_size(attrs.size),
            atime: time,
            mtime: time,
            ctime: time,
            kind,
            perm: (perm & 0o7777) as u16,
            nlink: if kind.is_dir() { 2 } else { 1 },
            uid,
            gid,
            blksize: 4096,
        }
    }

    /// Full `st_mode`, type bits included.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | u32::from(self.perm)
    }

    pub fn to_fuser(&self) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.mtime,
            kind: self.kind.to_fuser(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

pub fn secs_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
