//! bucketfs: a read-only FUSE view of an object-storage bucket.
//!
//! Objects map to files and common key prefixes map to directories. The
//! [`fs::BucketFs`] engine keeps the inode namespace, the [`ops::FsOperations`]
//! trait is the kernel-facing surface, and [`fuse::FuseBridge`] plugs that
//! surface into `fuser`.

pub mod attr;
pub mod buffer;
pub mod config;
pub mod dir_handle;
pub mod error;
pub mod file_handle;
pub mod fs;
pub mod fuse;
pub mod inode;
pub mod lookup;
pub mod mbuf;
pub mod mount;
pub mod ops;
pub mod pool;
pub mod race;
pub mod read_buffer;
pub mod store;
pub mod sweep;
pub mod ticket;

pub use config::FsConfig;
pub use error::{FsError, Result};
pub use fs::BucketFs;
pub use ops::FsOperations;
pub use store::{LocalStore, MemoryStore, ObjectStore, StoreError};
