//! Scan service configuration.
//!
//! Defaults come from the table in the external interfaces section;
//! every field can be overridden by an environment variable, and an
//! optional TOML file can override the defaults before env vars are
//! applied, mirroring the two-layer (file, then env) precedence the
//! rest of the corpus uses for its own config files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Resolved, ready-to-use configuration for one scan service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub worker_count: usize,
    pub max_attempts: u32,
    pub sampler_deadline_ms: u64,
    pub levels: u32,
    pub grid_y: u32,
    pub grid_x: u32,
    pub bus_capacity: usize,
    pub session_buffer: usize,
    pub slow_session_timeout_ms: u64,
    pub snapshot_regen_delta: Option<u64>,
    pub heartbeat_interval_ms: u64,
    pub session_idle_timeout_ms: u64,
    pub cache_root: PathBuf,
    pub bind_addr: String,
    /// `"fs"` (default) or `"s3"` — selects the `CacheBackend` `main.rs` wires up.
    pub cache_backend: String,
    /// Bucket name when `cache_backend = "s3"`.
    pub s3_bucket: Option<String>,
    /// Object-key prefix under the bucket when `cache_backend = "s3"`.
    pub s3_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 8,
            max_attempts: 3,
            sampler_deadline_ms: 10_000,
            levels: 4,
            grid_y: 4,
            grid_x: 4,
            bus_capacity: 1024,
            session_buffer: 256,
            slow_session_timeout_ms: 5_000,
            snapshot_regen_delta: None,
            heartbeat_interval_ms: 30_000,
            session_idle_timeout_ms: 120_000,
            cache_root: PathBuf::from("./data/cache"),
            bind_addr: "0.0.0.0:8080".to_string(),
            cache_backend: "fs".to_string(),
            s3_bucket: None,
            s3_prefix: "scanrel".to_string(),
        }
    }
}

/// File-layer representation: every field optional, so a TOML file only
/// needs to name the settings it wants to override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub worker_count: Option<usize>,
    pub max_attempts: Option<u32>,
    pub sampler_deadline_ms: Option<u64>,
    pub levels: Option<u32>,
    pub grid_y: Option<u32>,
    pub grid_x: Option<u32>,
    pub bus_capacity: Option<usize>,
    pub session_buffer: Option<usize>,
    pub slow_session_timeout_ms: Option<u64>,
    pub snapshot_regen_delta: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub session_idle_timeout_ms: Option<u64>,
    pub cache_root: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub cache_backend: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
}

impl Config {
    /// Load defaults, apply an optional TOML file, then apply environment
    /// variables (`SCANREL_*`), which always win.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = toml_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {:?}", path))?;
                let file: ConfigFile = toml::from_str(&contents)
                    .with_context(|| format!("parsing config file {:?}", path))?;
                config.apply_file(file);
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.sampler_deadline_ms {
            self.sampler_deadline_ms = v;
        }
        if let Some(v) = file.levels {
            self.levels = v;
        }
        if let Some(v) = file.grid_y {
            self.grid_y = v;
        }
        if let Some(v) = file.grid_x {
            self.grid_x = v;
        }
        if let Some(v) = file.bus_capacity {
            self.bus_capacity = v;
        }
        if let Some(v) = file.session_buffer {
            self.session_buffer = v;
        }
        if let Some(v) = file.slow_session_timeout_ms {
            self.slow_session_timeout_ms = v;
        }
        if file.snapshot_regen_delta.is_some() {
            self.snapshot_regen_delta = file.snapshot_regen_delta;
        }
        if let Some(v) = file.heartbeat_interval_ms {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = file.session_idle_timeout_ms {
            self.session_idle_timeout_ms = v;
        }
        if let Some(v) = file.cache_root {
            self.cache_root = v;
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.cache_backend {
            self.cache_backend = v;
        }
        if file.s3_bucket.is_some() {
            self.s3_bucket = file.s3_bucket;
        }
        if let Some(v) = file.s3_prefix {
            self.s3_prefix = v;
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse("SCANREL_WORKER_COUNT") {
            self.worker_count = v;
        }
        if let Some(v) = env_parse("SCANREL_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("SCANREL_SAMPLER_DEADLINE_MS") {
            self.sampler_deadline_ms = v;
        }
        if let Some(v) = env_parse("SCANREL_LEVELS") {
            self.levels = v;
        }
        if let Some(v) = env_parse("SCANREL_GRID_Y") {
            self.grid_y = v;
        }
        if let Some(v) = env_parse("SCANREL_GRID_X") {
            self.grid_x = v;
        }
        if let Some(v) = env_parse("SCANREL_BUS_CAPACITY") {
            self.bus_capacity = v;
        }
        if let Some(v) = env_parse("SCANREL_SESSION_BUFFER") {
            self.session_buffer = v;
        }
        if let Some(v) = env_parse("SCANREL_SLOW_SESSION_TIMEOUT_MS") {
            self.slow_session_timeout_ms = v;
        }
        if let Some(v) = env_parse("SCANREL_SNAPSHOT_REGEN_DELTA") {
            self.snapshot_regen_delta = Some(v);
        }
        if let Some(v) = env_parse("SCANREL_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("SCANREL_SESSION_IDLE_TIMEOUT_MS") {
            self.session_idle_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("SCANREL_CACHE_ROOT") {
            self.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCANREL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("SCANREL_CACHE_BACKEND") {
            self.cache_backend = v;
        }
        if let Ok(v) = std::env::var("SCANREL_S3_BUCKET") {
            self.s3_bucket = Some(v);
        }
        if let Ok(v) = std::env::var("SCANREL_S3_PREFIX") {
            self.s3_prefix = v;
        }
    }

    /// `Δn` for snapshot regeneration at a level with `total` subtiles,
    /// per the default in §4.5: `max(1, total / 32)` unless overridden.
    pub fn snapshot_regen_delta_for(&self, total_subtiles_at_level: u64) -> u64 {
        self.snapshot_regen_delta
            .unwrap_or_else(|| (total_subtiles_at_level / 32).max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_interface_table() {
        let config = Config::default();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.levels, 4);
        assert_eq!(config.bus_capacity, 1024);
        assert_eq!(config.session_buffer, 256);
    }

    #[test]
    fn snapshot_regen_delta_defaults_to_total_over_32_floor_1() {
        let config = Config::default();
        assert_eq!(config.snapshot_regen_delta_for(16), 1);
        assert_eq!(config.snapshot_regen_delta_for(320), 10);
    }

    #[test]
    fn toml_file_overrides_defaults_without_touching_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanrel.toml");
        std::fs::write(&path, "worker_count = 16\nlevels = 2\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.worker_count, 16);
        assert_eq!(config.levels, 2);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn cache_backend_defaults_to_fs_with_no_bucket() {
        let config = Config::default();
        assert_eq!(config.cache_backend, "fs");
        assert!(config.s3_bucket.is_none());
        assert_eq!(config.s3_prefix, "scanrel");
    }

    #[test]
    fn toml_file_selects_s3_cache_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanrel.toml");
        std::fs::write(
            &path,
            "cache_backend = \"s3\"\ns3_bucket = \"scanrel-tiles\"\ns3_prefix = \"prod\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cache_backend, "s3");
        assert_eq!(config.s3_bucket.as_deref(), Some("scanrel-tiles"));
        assert_eq!(config.s3_prefix, "prod");
    }
}
