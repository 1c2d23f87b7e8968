//! bucketfs mount daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bucketfs_fuse::config::parse_bucket_spec;
use bucketfs_fuse::fuse::FuseBridge;
use bucketfs_fuse::mount::{options_to_fuser, parse_mount_options, validate_bucket, validate_mountpoint};
use bucketfs_fuse::sweep::cleanup_old_uploads;
use bucketfs_fuse::{BucketFs, FsConfig, LocalStore, ObjectStore};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bucketfs")]
#[command(about = "Mount an object-storage bucket as a read-only filesystem", long_about = None)]
struct Args {
    /// Bucket to mount, optionally followed by `:prefix`.
    bucket: String,

    mountpoint: PathBuf,

    /// TOML or JSON file with filesystem settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve the bucket from this local directory.
    #[arg(long, env = "BUCKETFS_LOCAL_ROOT")]
    local_root: PathBuf,

    /// Trade latency for fewer remote calls.
    #[arg(long)]
    cheap: bool,

    /// Only treat prefixes with a marker object as directories.
    #[arg(long)]
    explicit_dir: bool,

    #[arg(long)]
    stat_cache_ttl: Option<u64>,

    #[arg(long)]
    type_cache_ttl: Option<u64>,

    #[arg(long)]
    uid: Option<u32>,

    #[arg(long)]
    gid: Option<u32>,

    /// Permission bits for files, in octal.
    #[arg(long, value_parser = parse_mode)]
    file_mode: Option<u32>,

    /// Permission bits for directories, in octal.
    #[arg(long, value_parser = parse_mode)]
    dir_mode: Option<u32>,

    /// Comma-separated mount options.
    #[arg(short = 'o', default_value = "")]
    options: String,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("bad mode {:?}: {}", s, e))
}

impl Args {
    fn fs_config(&self) -> anyhow::Result<FsConfig> {
        let mut config = match &self.config {
            Some(path) => FsConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => FsConfig::default(),
        };
        let (bucket, prefix) = parse_bucket_spec(&self.bucket);
        config.bucket = bucket;
        config.prefix = prefix;
        config.cheap |= self.cheap;
        config.explicit_dir |= self.explicit_dir;
        if let Some(ttl) = self.stat_cache_ttl {
            config.stat_cache_ttl_secs = ttl;
        }
        if let Some(ttl) = self.type_cache_ttl {
            config.type_cache_ttl_secs = ttl;
        }
        if let Some(uid) = self.uid {
            config.uid = uid;
        }
        if let Some(gid) = self.gid {
            config.gid = gid;
        }
        if let Some(mode) = self.file_mode {
            config.file_mode = mode;
        }
        if let Some(mode) = self.dir_mode {
            config.dir_mode = mode;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.fs_config()?;
    let mount_opts = parse_mount_options(&args.options)?;
    validate_mountpoint(&args.mountpoint)?;

    tracing::info!(
        "bucketfs starting: bucket={} prefix={:?} mountpoint={}",
        config.bucket,
        config.prefix,
        args.mountpoint.display()
    );

    let store: Arc<dyn ObjectStore> = Arc::new(
        LocalStore::open(&args.local_root)
            .with_context(|| format!("opening {}", args.local_root.display()))?,
    );
    validate_bucket(&store, &config).await?;

    let fuser_opts = options_to_fuser(&mount_opts, &config.bucket);
    let fs = BucketFs::new(config, Arc::clone(&store));

    let replicators = fs.replicators().clone();
    tokio::spawn(async move {
        if let Err(e) = cleanup_old_uploads(store, replicators).await {
            tracing::warn!("upload sweep failed: {}", e);
        }
    });

    let bridge = FuseBridge::new(fs, tokio::runtime::Handle::current());
    let mountpoint = args.mountpoint.clone();
    tokio::task::spawn_blocking(move || fuser::mount2(bridge, &mountpoint, &fuser_opts))
        .await?
        .with_context(|| format!("mounting {}", args.mountpoint.display()))?;

    tracing::info!("bucketfs unmounted");
    Ok(())
}
