//! Mount-time checks and option handling.
//!
//! A bucket mount is always read-only and always lets the kernel enforce the
//! permission bits, whatever `-o` asks for.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::FsConfig;
use crate::error::FsError;
use crate::store::{ListRequest, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub allow_other: bool,
    pub allow_root: bool,
    pub auto_unmount: bool,
    /// Name shown in the mount table. Defaults to `bucketfs:<bucket>`.
    pub fsname: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            fsname: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Bucket {bucket} is not usable: {source}")]
    Bucket {
        bucket: String,
        #[source]
        source: FsError,
    },
}

pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }
    Ok(())
}

/// Parses a comma-separated `-o` list.
///
/// `ro` and `default_permissions` are accepted and implied; `rw` is refused.
pub fn parse_mount_options(opts_str: &str) -> Result<MountOptions, MountError> {
    let mut options = MountOptions::default();

    for opt in opts_str.split(',') {
        let opt = opt.trim();
        match opt {
            "allow_other" => options.allow_other = true,
            "allow_root" => options.allow_root = true,
            "auto_unmount" => options.auto_unmount = true,
            "noauto_unmount" => options.auto_unmount = false,
            "default_permissions" | "ro" | "" => {}
            _ => match opt.strip_prefix("fsname=") {
                Some(name) if !name.is_empty() => options.fsname = Some(name.to_string()),
                _ => return Err(MountError::InvalidOption(opt.to_string())),
            },
        }
    }

    Ok(options)
}

pub fn options_to_fuser(opts: &MountOptions, bucket: &str) -> Vec<fuser::MountOption> {
    let fsname = opts
        .fsname
        .clone()
        .unwrap_or_else(|| format!("bucketfs:{}", bucket));
    let mut fuser_opts = vec![
        fuser::MountOption::RO,
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::FSName(fsname),
        fuser::MountOption::Subtype("bucketfs".to_string()),
    ];

    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }
    if opts.allow_root {
        fuser_opts.push(fuser::MountOption::AllowRoot);
    }
    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }

    fuser_opts
}

/// Checks that the bucket answers listings before anything is mounted.
///
/// Lists a random key under the prefix: an existing bucket answers with an
/// empty page, a missing one with not-found.
pub async fn validate_bucket(store: &Arc<dyn ObjectStore>, config: &FsConfig) -> Result<(), MountError> {
    let probe = config.key(&uuid::Uuid::new_v4().to_string());
    debug!("validating bucket={} probe={}", config.bucket, probe);
    match store.list(ListRequest::new(probe).max_keys(1)).await {
        Ok(_) => {
            info!("bucket {} is reachable", config.bucket);
            Ok(())
        }
        Err(e) => Err(MountError::Bucket {
            bucket: config.bucket.clone(),
            source: e.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use tempfile::{tempdir, NamedTempFile};

    fn has(opts: &[fuser::MountOption], want: &fuser::MountOption) -> bool {
        opts.iter().any(|o| o == want)
    }

    #[test]
    fn test_default_options() {
        let opts = MountOptions::default();
        assert!(!opts.allow_other);
        assert!(!opts.allow_root);
        assert!(opts.auto_unmount);
        assert!(opts.fsname.is_none());
    }

    #[test]
    fn test_parse_mount_options_multiple() {
        let opts = parse_mount_options("allow_other, ro ,fsname=photos").unwrap();
        assert!(opts.allow_other);
        assert_eq!(opts.fsname.as_deref(), Some("photos"));
    }

    #[test]
    fn test_parse_mount_options_empty_returns_default() {
        assert_eq!(parse_mount_options("").unwrap(), MountOptions::default());
    }

    #[test]
    fn test_parse_mount_options_rejects_rw() {
        assert!(matches!(
            parse_mount_options("rw"),
            Err(MountError::InvalidOption(o)) if o == "rw"
        ));
        assert!(parse_mount_options("fsname=").is_err());
        assert!(parse_mount_options("direct_io").is_err());
    }

    #[test]
    fn test_options_to_fuser_always_read_only() {
        let fuser_opts = options_to_fuser(&MountOptions::default(), "b");
        assert!(has(&fuser_opts, &fuser::MountOption::RO));
        assert!(has(&fuser_opts, &fuser::MountOption::DefaultPermissions));
        assert!(has(&fuser_opts, &fuser::MountOption::FSName("bucketfs:b".to_string())));
        assert!(has(&fuser_opts, &fuser::MountOption::AutoUnmount));
        assert!(!has(&fuser_opts, &fuser::MountOption::AllowOther));
    }

    #[test]
    fn test_options_to_fuser_allow_other_and_fsname() {
        let opts = parse_mount_options("allow_other,allow_root,noauto_unmount,fsname=x").unwrap();
        let fuser_opts = options_to_fuser(&opts, "b");
        assert!(has(&fuser_opts, &fuser::MountOption::AllowOther));
        assert!(has(&fuser_opts, &fuser::MountOption::AllowRoot));
        assert!(has(&fuser_opts, &fuser::MountOption::FSName("x".to_string())));
        assert!(!has(&fuser_opts, &fuser::MountOption::AutoUnmount));
    }

    #[test]
    fn test_validate_mountpoint() {
        let dir = tempdir().unwrap();
        assert!(validate_mountpoint(dir.path()).is_ok());
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            validate_mountpoint(file.path()),
            Err(MountError::NotADirectory(_))
        ));
        assert!(matches!(
            validate_mountpoint(&dir.path().join("missing")),
            Err(MountError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_bucket() {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn ObjectStore> = mem.clone();
        let config = FsConfig {
            bucket: "b".to_string(),
            ..Default::default()
        };
        validate_bucket(&store, &config).await.unwrap();
        assert_eq!(mem.stats().lists, 1);

        mem.set_failure(Some(StoreError::NotFound { key: "b".to_string() }));
        match validate_bucket(&store, &config).await {
            Err(MountError::Bucket { source, .. }) => assert!(source.is_not_found()),
            other => panic!("unexpected {:?}", other),
        }

        mem.set_failure(Some(StoreError::from_status(403, "denied")));
        assert!(validate_bucket(&store, &config).await.is_err());
    }
}
