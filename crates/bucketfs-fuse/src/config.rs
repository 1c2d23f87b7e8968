use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BLOCK_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_READAHEAD_CHUNK: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_READAHEAD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub bucket: String,
    /// Key prefix every path is mounted under, empty or ending in `/`.
    pub prefix: String,
    pub stat_cache_ttl_secs: u64,
    pub type_cache_ttl_secs: u64,
    pub cheap: bool,
    pub explicit_dir: bool,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub readahead_chunk: u64,
    pub max_readahead: u64,
    pub pool_block_size: usize,
    pub pool_max_buffers: Option<u64>,
    pub list_page_size: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            stat_cache_ttl_secs: 60,
            type_cache_ttl_secs: 60,
            cheap: false,
            explicit_dir: false,
            file_mode: 0o644,
            dir_mode: 0o755,
            uid: 0,
            gid: 0,
            readahead_chunk: DEFAULT_READAHEAD_CHUNK,
            max_readahead: DEFAULT_MAX_READAHEAD,
            pool_block_size: DEFAULT_BLOCK_SIZE,
            pool_max_buffers: None,
            list_page_size: 1000,
        }
    }
}

impl FsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn stat_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stat_cache_ttl_secs)
    }

    pub fn type_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.type_cache_ttl_secs)
    }

    /// Remote key for a path relative to the mount root.
    pub fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    /// Remote prefix whose children are the entries of directory `path`.
    pub fn dir_prefix(&self, path: &str) -> String {
        if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}/", self.prefix, path)
        }
    }
}

/// Splits `bucket[:prefix]` and normalizes the prefix to end in `/`.
pub fn parse_bucket_spec(spec: &str) -> (String, String) {
    match spec.split_once(':') {
        Some((bucket, prefix)) => {
            let prefix = prefix.trim_matches('/');
            let prefix = if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix)
            };
            (bucket.to_string(), prefix)
        }
        None => (spec.to_string(), String::new()),
    }
}

/// A cached value stamped at `stamp` is trusted while `now` is within `ttl`
/// of it. Something never stamped is always expired.
pub fn expired(stamp: Option<Instant>, ttl: Duration) -> bool {
    match stamp {
        Some(t) => t.elapsed() >= ttl,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = FsConfig::default();
        assert_eq!(config.stat_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.file_mode, 0o644);
        assert_eq!(config.dir_mode, 0o755);
        assert_eq!(config.pool_block_size, 5 * 1024 * 1024);
        assert!(!config.cheap);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "bucket = \"photos\"\ncheap = true\nstat_cache_ttl_secs = 5").unwrap();
        let config = FsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bucket, "photos");
        assert!(config.cheap);
        assert_eq!(config.stat_cache_ttl_secs, 5);
        assert_eq!(config.type_cache_ttl_secs, 60);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"bucket": "b", "explicit_dir": true}}"#).unwrap();
        let config = FsConfig::from_file(file.path()).unwrap();
        assert!(config.explicit_dir);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(FsConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_parse_bucket_spec() {
        assert_eq!(parse_bucket_spec("b"), ("b".to_string(), String::new()));
        assert_eq!(parse_bucket_spec("b:p"), ("b".to_string(), "p/".to_string()));
        assert_eq!(parse_bucket_spec("b:/p/q/"), ("b".to_string(), "p/q/".to_string()));
        assert_eq!(parse_bucket_spec("b:"), ("b".to_string(), String::new()));
    }

    #[test]
    fn test_key_and_dir_prefix() {
        let config = FsConfig {
            prefix: "pre/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.key("a/b"), "pre/a/b");
        assert_eq!(config.dir_prefix(""), "pre/");
        assert_eq!(config.dir_prefix("a"), "pre/a/");
    }

    #[test]
    fn test_expired_polarity() {
        let now = Instant::now();
        assert!(!expired(Some(now), Duration::from_secs(60)));
        assert!(expired(Some(now), Duration::ZERO));
        assert!(expired(None, Duration::from_secs(60)));
    }
}
