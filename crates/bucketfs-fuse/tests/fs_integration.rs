//! End-to-end tests through the kernel-facing operation surface.
//!
//! Every test mounts an in-memory bucket and drives it the way the fuser
//! adapter would: by path for namespace calls, by handle for reads.

use std::sync::Arc;

use bucketfs_fuse::attr::{secs_since_epoch, FileType};
use bucketfs_fuse::store::{LocalStore, MemoryStore, ObjectStore};
use bucketfs_fuse::{BucketFs, FsConfig, FsOperations};

fn mount(store: MemoryStore, config: FsConfig) -> (Arc<BucketFs>, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let dynstore: Arc<dyn ObjectStore> = store.clone();
    (BucketFs::new(config, dynstore), store)
}

async fn read_all(fs: &Arc<BucketFs>, path: &str, chunk: u32) -> Vec<u8> {
    let open = fs.open(path).await.unwrap();
    let mut out = Vec::new();
    loop {
        let got = fs.read(open.fh, out.len() as u64, chunk).await.unwrap();
        if got.is_empty() {
            break;
        }
        out.extend_from_slice(&got);
    }
    fs.release(open.fh).await.unwrap();
    out
}

async fn list(fs: &Arc<BucketFs>, path: &str) -> Vec<String> {
    let fh = fs.opendir(path).await.unwrap();
    let mut names = Vec::new();
    let mut offset = 0;
    loop {
        let batch = fs.readdir(fh, offset).await.unwrap();
        let Some(last) = batch.last() else {
            break;
        };
        offset = last.offset;
        names.extend(batch.into_iter().map(|e| e.name));
    }
    fs.releasedir(fh).await.unwrap();
    names
}

#[tokio::test]
async fn test_root_getattr() {
    let (fs, _) = mount(MemoryStore::new(), FsConfig::default());
    let attr = fs.getattr("").await.unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.mode(), 0o40755);
    assert_eq!(attr.nlink, 2);
    assert_eq!(attr.size, 4096);
}

#[tokio::test]
async fn test_file_getattr() {
    let store = MemoryStore::new();
    store.put("file", vec![7u8; 42], 515_196_900_000);
    let (fs, _) = mount(store, FsConfig::default());
    let attr = fs.getattr("file").await.unwrap();
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.mode(), 0o100644);
    assert_eq!(attr.nlink, 1);
    assert_eq!(attr.size, 42);
    assert_eq!(secs_since_epoch(attr.atime), 515_196_900);
    assert_eq!(secs_since_epoch(attr.mtime), 515_196_900);
    assert_eq!(secs_since_epoch(attr.ctime), 515_196_900);
}

#[tokio::test]
async fn test_readdir_single_object_bucket() {
    let store = MemoryStore::new();
    store.put("file", "data", 0);
    let (fs, _) = mount(store, FsConfig::default());
    assert_eq!(list(&fs, "").await, vec![".", "..", "file"]);
}

#[tokio::test]
async fn test_hello_world_range_reads() {
    let store = MemoryStore::new();
    store.put("file", "Hello, world!", 0);
    let (fs, _) = mount(store, FsConfig::default());
    let open = fs.open("file").await.unwrap();
    let mut out = Vec::new();
    for (offset, size) in [(0u64, 5u32), (5, 5), (10, 3)] {
        out.extend(fs.read(open.fh, offset, size).await.unwrap());
    }
    assert_eq!(out, b"Hello, world!");
    fs.release(open.fh).await.unwrap();
}

#[tokio::test]
async fn test_getattr_within_ttl_hits_store_once() {
    let store = MemoryStore::new();
    store.put("file", "x", 0);
    let config = FsConfig {
        cheap: true,
        ..Default::default()
    };
    let (fs, mem) = mount(store, config);
    fs.getattr("file").await.unwrap();
    let after_first = mem.stats();
    assert_eq!(after_first.heads, 1);
    fs.getattr("file").await.unwrap();
    assert_eq!(mem.stats(), after_first);
}

#[tokio::test]
async fn test_getattr_after_expiry_consults_store() {
    let store = MemoryStore::new();
    store.put("file", "x", 0);
    let config = FsConfig {
        cheap: true,
        stat_cache_ttl_secs: 0,
        ..Default::default()
    };
    let (fs, mem) = mount(store, config);
    let first = fs.getattr("file").await.unwrap();
    let calls = mem.stats().total();
    let second = fs.getattr("file").await.unwrap();
    assert!(mem.stats().total() > calls);
    assert_eq!(first.ino, second.ino);
}

#[tokio::test]
async fn test_deleted_object_disappears_after_expiry() {
    let store = MemoryStore::new();
    store.put("gone", "x", 0);
    let config = FsConfig {
        stat_cache_ttl_secs: 0,
        ..Default::default()
    };
    let (fs, mem) = mount(store, config);
    fs.getattr("gone").await.unwrap();
    mem.remove("gone");
    assert_eq!(fs.getattr("gone").await.unwrap_err().to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_prefix_mount_hides_outside_keys() {
    let store = MemoryStore::new();
    store.put("pre/inside", "1", 0);
    store.put("outside", "2", 0);
    let config = FsConfig {
        prefix: "pre/".to_string(),
        ..Default::default()
    };
    let (fs, _) = mount(store, config);
    assert_eq!(list(&fs, "").await, vec![".", "..", "inside"]);
    assert!(fs.getattr("outside").await.is_err());
    assert_eq!(read_all(&fs, "inside", 16).await, b"1");
}

#[tokio::test]
async fn test_slurp_walk_discovers_every_leaf() {
    let store = MemoryStore::new();
    let mut expected = Vec::new();
    for dir in ["a", "b", "c", "d"] {
        for sub in ["p", "q"] {
            let key = format!("root/{}/{}/leaf", dir, sub);
            store.put(&key, key.clone(), 0);
            expected.push(key);
        }
    }
    let (fs, mem) = mount(store, FsConfig::default());

    // depth-first walk, the way find(1) or du(1) would do it
    let mut found = Vec::new();
    let mut dirs = Vec::new();
    let mut stack = vec!["root".to_string()];
    while let Some(dir) = stack.pop() {
        let mut children: Vec<String> = list(&fs, &dir)
            .await
            .into_iter()
            .filter(|n| n != "." && n != "..")
            .collect();
        children.reverse();
        for name in children {
            let path = format!("{}/{}", dir, name);
            if fs.getattr(&path).await.unwrap().kind == FileType::Directory {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    assert_eq!(found, expected);
    // one listing per directory would be 13
    assert!(mem.stats().lists < 13);

    assert_eq!(dirs.len(), 12);
    let lists = mem.stats().lists;
    for dir in &dirs {
        let inode = fs.resolve_path(dir).await.unwrap();
        let sealed = inode.lock().dir.as_ref().is_some_and(|d| d.dir_time.is_some());
        assert!(sealed, "{} not sealed", dir);
    }
    assert_eq!(mem.stats().lists, lists);
}

#[tokio::test]
async fn test_open_file_keeps_stale_attributes() {
    let store = MemoryStore::new();
    store.put("f", "abc", 0);
    let config = FsConfig {
        stat_cache_ttl_secs: 0,
        ..Default::default()
    };
    let (fs, mem) = mount(store, config);
    let open = fs.open("f").await.unwrap();
    mem.remove("f");
    mem.reset_stats();

    assert_eq!(fs.getattr("f").await.unwrap().size, 3);
    assert_eq!(mem.stats().total(), 0);

    fs.release(open.fh).await.unwrap();
    assert_eq!(fs.getattr("f").await.unwrap_err().to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_large_file_read_through_read_ahead() {
    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
    let store = MemoryStore::new();
    store.put("big", data.clone(), 0);
    let config = FsConfig {
        readahead_chunk: 4096,
        max_readahead: 16 * 1024,
        pool_block_size: 1024,
        pool_max_buffers: Some(64),
        ..Default::default()
    };
    let (fs, _) = mount(store, config);
    assert_eq!(read_all(&fs, "big", 1000).await, data);
    assert_eq!(fs.pool().stats().checked_out, 0);
}

#[tokio::test]
async fn test_non_sequential_reads_stay_correct() {
    let data: Vec<u8> = (0..20_000).map(|i| (i % 241) as u8).collect();
    let store = MemoryStore::new();
    store.put("f", data.clone(), 0);
    let config = FsConfig {
        readahead_chunk: 1024,
        max_readahead: 4096,
        pool_block_size: 512,
        pool_max_buffers: Some(32),
        ..Default::default()
    };
    let (fs, _) = mount(store, config);
    let open = fs.open("f").await.unwrap();
    for offset in [0u64, 2048, 512, 15_000, 15_500, 100, 19_990] {
        let got = fs.read(open.fh, offset, 700).await.unwrap();
        let end = (offset as usize + 700).min(data.len());
        assert_eq!(got, &data[offset as usize..end], "offset {}", offset);
    }
    fs.release(open.fh).await.unwrap();
}

#[tokio::test]
async fn test_directory_cannot_be_opened_for_reading() {
    let store = MemoryStore::new();
    store.put("d/f", "x", 0);
    let (fs, _) = mount(store, FsConfig::default());
    assert_eq!(fs.open("d").await.unwrap_err().to_errno(), libc::EISDIR);
    assert_eq!(fs.opendir("d/f").await.unwrap_err().to_errno(), libc::ENOTDIR);
}

#[tokio::test]
async fn test_lookup_and_forget_release_inode() {
    let store = MemoryStore::new();
    store.put("f", "x", 0);
    let (fs, _) = mount(store, FsConfig::default());
    let attr = fs.lookup("", "f").await.unwrap();
    fs.lookup("", "f").await.unwrap();
    assert_eq!(fs.refcnt(attr.ino), Some(2));
    FsOperations::forget(&fs, attr.ino, 2);
    assert_eq!(fs.refcnt(attr.ino), None);
}

#[tokio::test]
async fn test_local_directory_store() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
    std::fs::write(dir.path().join("docs/readme.txt"), "read me").unwrap();
    std::fs::write(dir.path().join("docs/sub/deep.txt"), "deep").unwrap();

    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::open(dir.path()).unwrap());
    let fs = BucketFs::new(FsConfig::default(), store);
    assert_eq!(list(&fs, "docs").await, vec![".", "..", "sub", "readme.txt"]);
    assert_eq!(read_all(&fs, "docs/sub/deep.txt", 3).await, b"deep");
    assert_eq!(fs.getattr("docs/readme.txt").await.unwrap().size, 7);
}
