use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::storage::Tier;

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    pub storage: StorageSettings,
    #[serde(default)]
    pub middleware: MiddlewareSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Default bucket driver: `native`, `memory`, or `empty`.
    #[serde(default)]
    pub driver: Option<String>,
    /// Default index engine: `rocks` or `memory`.
    #[serde(default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub async_load: bool,
    #[serde(default = "default_selection_policy")]
    pub selection_policy: String,
    #[serde(default)]
    pub buckets: Vec<BucketSettings>,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub dir_aware: DirAwareSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            driver: None,
            db_type: None,
            async_load: false,
            selection_policy: default_selection_policy(),
            buckets: Vec::new(),
            migration: MigrationSettings::default(),
            dir_aware: DirAwareSettings::default(),
        }
    }
}

fn default_selection_policy() -> String {
    "hashring".to_string()
}

fn default_bucket_tier() -> Tier {
    Tier::Warm
}

fn default_slice_size() -> u64 {
    1_048_576
}

fn default_max_object_limit() -> usize {
    10_000_000
}

fn default_weight() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketSettings {
    pub path: PathBuf,
    #[serde(rename = "type", default = "default_bucket_tier")]
    pub tier: Tier,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
    #[serde(default = "default_max_object_limit")]
    pub max_object_limit: usize,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub async_load: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MigrationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub promote: WindowRule,
    #[serde(default)]
    pub demote: DemoteRule,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WindowRule {
    #[serde(default)]
    pub min_hits: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DemoteRule {
    #[serde(default)]
    pub min_hits: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub occupancy: f64,
}

fn default_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirAwareSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiddlewareSettings {
    #[serde(default)]
    pub caching: CachingSettings,
}

fn default_fuzzy_refresh_rate() -> f64 {
    0.8
}

fn default_collapsed_wait_timeout() -> u64 {
    3000
}

fn default_fill_range_percent() -> u64 {
    100
}

fn default_vary_limit() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachingSettings {
    #[serde(default)]
    pub include_query_in_cache_key: bool,
    #[serde(default)]
    pub fuzzy_refresh: bool,
    #[serde(default = "default_fuzzy_refresh_rate")]
    pub fuzzy_refresh_rate: f64,
    #[serde(default)]
    pub collapsed_request: bool,
    #[serde(default = "default_collapsed_wait_timeout")]
    pub collapsed_request_wait_timeout_ms: u64,
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
    #[serde(default = "default_fill_range_percent")]
    pub fill_range_percent: u64,
    #[serde(default = "default_vary_limit")]
    pub vary_limit: usize,
    #[serde(default)]
    pub vary_ignore_key: Vec<String>,
    #[serde(default)]
    pub async_flush_chunk: bool,
    #[serde(default)]
    pub cache_error_codes: bool,
}

impl Default for CachingSettings {
    fn default() -> Self {
        Self {
            include_query_in_cache_key: false,
            fuzzy_refresh: false,
            fuzzy_refresh_rate: default_fuzzy_refresh_rate(),
            collapsed_request: false,
            collapsed_request_wait_timeout_ms: default_collapsed_wait_timeout(),
            slice_size: default_slice_size(),
            fill_range_percent: default_fill_range_percent(),
            vary_limit: default_vary_limit(),
            vary_ignore_key: Vec::new(),
            async_flush_chunk: false,
            cache_error_codes: false,
        }
    }
}

impl CachingSettings {
    pub fn collapsed_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.collapsed_request_wait_timeout_ms)
    }

    /// Fuzzy rate clamped into (0, 1); invalid input falls back to the
    /// default.
    pub fn effective_fuzzy_rate(&self) -> f64 {
        if self.fuzzy_refresh_rate <= 0.0 || self.fuzzy_refresh_rate >= 1.0 {
            default_fuzzy_refresh_rate()
        } else {
            self.fuzzy_refresh_rate
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("TAVERN")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        for bucket in &mut self.storage.buckets {
            if bucket.tier != Tier::InMemory {
                bucket.path = absolutize(&bucket.path, base_dir);
            }
            if let Some(db_path) = bucket.db_path.clone() {
                bucket.db_path = Some(absolutize(&db_path, base_dir));
            }
        }
        if let Some(store_path) = self.storage.dir_aware.store_path.clone() {
            self.storage.dir_aware.store_path = Some(absolutize(&store_path, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.storage.buckets.is_empty(),
            "at least one storage bucket must be configured"
        );
        ensure!(
            self.storage.selection_policy == "hashring",
            "unknown selection_policy {:?}",
            self.storage.selection_policy
        );
        for bucket in &self.storage.buckets {
            ensure!(
                bucket.slice_size > 0,
                "bucket {} slice_size must be greater than 0",
                bucket.path.display()
            );
            ensure!(
                bucket.max_object_limit > 0,
                "bucket {} max_object_limit must be greater than 0",
                bucket.path.display()
            );
            ensure!(
                (1..=1000).contains(&bucket.weight),
                "bucket {} weight must be in 1..=1000 (got {})",
                bucket.path.display(),
                bucket.weight
            );
        }
        let caching = &self.middleware.caching;
        ensure!(
            caching.slice_size > 0,
            "middleware.caching.slice_size must be greater than 0"
        );
        ensure!(
            caching.fill_range_percent <= 100,
            "middleware.caching.fill_range_percent must be in 0..=100 (got {})",
            caching.fill_range_percent
        );
        ensure!(
            caching.vary_limit > 0,
            "middleware.caching.vary_limit must be greater than 0"
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds"
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds"
        );
        if self.storage.migration.enabled {
            ensure!(
                self.storage.migration.promote.min_hits > 0,
                "storage.migration.promote.min_hits must be set when migration is enabled"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/tavern/tavern.toml"),
        PathBuf::from("tavern.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
