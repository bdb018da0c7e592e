use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the upload engine
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory under which chunks are staged, one subdirectory per session
    pub staging_root: PathBuf,

    /// Upper bound for a single chunk body
    pub max_chunk_bytes: u64,

    /// Upper bound on chunks per session (indices must stay below this)
    pub max_chunks: u32,

    /// Absolute max declared size for one upload (safety guard)
    pub max_upload_bytes: u64,

    /// Sessions with no activity for this long are evicted by the sweeper
    pub stale_after: Duration,

    /// How often the sweeper looks for stale sessions
    pub sweep_interval: Duration,

    /// Content type used when the client declares none
    pub default_content_type: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir().join("chunkyard"),
            max_chunk_bytes: 64 * 1024 * 1024, // 64MB
            max_chunks: 10_000,
            max_upload_bytes: 20 * 1024 * 1024 * 1024, // 20GB
            stale_after: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            default_content_type: "application/octet-stream".to_string(),
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `CHUNKYARD_*` environment variables, falling back to defaults
    ///
    /// - `CHUNKYARD_STAGING_ROOT`
    /// - `CHUNKYARD_MAX_CHUNK_BYTES`
    /// - `CHUNKYARD_MAX_CHUNKS`
    /// - `CHUNKYARD_MAX_UPLOAD_BYTES`
    /// - `CHUNKYARD_STALE_AFTER_SECS`
    /// - `CHUNKYARD_SWEEP_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let staging_root = std::env::var("CHUNKYARD_STAGING_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.staging_root);

        Self {
            staging_root,
            max_chunk_bytes: env_var_or("CHUNKYARD_MAX_CHUNK_BYTES", defaults.max_chunk_bytes),
            max_chunks: env_var_or("CHUNKYARD_MAX_CHUNKS", defaults.max_chunks),
            max_upload_bytes: env_var_or("CHUNKYARD_MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            stale_after: Duration::from_secs(env_var_or(
                "CHUNKYARD_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_var_or(
                "CHUNKYARD_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            default_content_type: defaults.default_content_type,
        }
    }

    /// Set staging root
    pub fn with_staging_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.staging_root = root.into();
        self
    }

    /// Set max chunk size
    pub fn with_max_chunk_bytes(mut self, bytes: u64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Set max chunks per session
    pub fn with_max_chunks(mut self, max: u32) -> Self {
        self.max_chunks = max;
        self
    }

    /// Set max declared upload size
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Set staleness window
    pub fn with_stale_after(mut self, window: Duration) -> Self {
        self.stale_after = window;
        self
    }

    /// Set sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set fallback content type
    pub fn with_default_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.default_content_type = content_type.into();
        self
    }
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Debug,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = UploadConfig::new()
            .with_staging_root("/var/lib/chunkyard")
            .with_max_chunks(3)
            .with_stale_after(Duration::from_secs(60));

        assert_eq!(config.staging_root, PathBuf::from("/var/lib/chunkyard"));
        assert_eq!(config.max_chunks, 3);
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.max_chunk_bytes, UploadConfig::default().max_chunk_bytes);
    }

    #[test]
    fn unparsable_env_values_fall_back() {
        std::env::set_var("CHUNKYARD_TEST_BOGUS_U32", "not-a-number");
        assert_eq!(env_var_or("CHUNKYARD_TEST_BOGUS_U32", 7u32), 7);
        std::env::remove_var("CHUNKYARD_TEST_BOGUS_U32");
    }
}
