//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TiffsterError, TiffsterResult};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Pages kept resident around the current page.
pub const DEFAULT_WINDOW_SIZE: u32 = 3;

/// Frames grouped into one logical page.
pub const DEFAULT_FRAMES_PER_PAGE: u32 = 3;

/// Retries after the first failed attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Delay before retry `n` is `base^n` backoff units.
pub const DEFAULT_RETRY_BACKOFF_BASE: u32 = 2;

/// Capacity of the page-changed notification queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Retry policy for materialization and eviction.
///
/// | attempt | delay (base 2) | total waited |
/// |---------|----------------|--------------|
/// | 1       | 2s             | 2s           |
/// | 2       | 4s             | 6s           |
/// | 3       | 8s             | 14s          |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retry_count: u32,
    pub backoff_base: u32,
    /// Unit the exponential delay is expressed in (one second in production).
    pub backoff_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn new(retry_count: u32, backoff_base: u32) -> Self {
        Self {
            retry_count,
            backoff_base,
            ..Self::default()
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(self.backoff_base.saturating_pow(attempt))
    }

    /// Sum of every delay when all retries are used.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.retry_count)
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Master configuration for the page window engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub window_size: u32,
    pub frames_per_page: u32,
    pub retry: RetryConfig,
    /// Root for decoded rasters (`{document}_{page}_{sequence}.jpg`).
    pub staging_dir: PathBuf,
    /// Root holding `{document}.tif` containers.
    pub container_dir: PathBuf,
    /// Root of the directory-backed remote object store.
    pub remote_dir: PathBuf,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            frames_per_page: DEFAULT_FRAMES_PER_PAGE,
            retry: RetryConfig::default(),
            staging_dir: PathBuf::from("data/jpg"),
            container_dir: PathBuf::from("data/tiff"),
            remote_dir: PathBuf::from("data/remote"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_frames_per_page(mut self, frames_per_page: u32) -> Self {
        self.frames_per_page = frames_per_page;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_container_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.container_dir = dir.into();
        self
    }

    pub fn with_remote_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `TIFFSTER_WINDOW_SIZE`: Pages kept resident (default: 3)
    /// - `TIFFSTER_FRAMES_PER_PAGE`: Frames per logical page (default: 3)
    /// - `TIFFSTER_RETRY_COUNT`: Retries after the first failure (default: 3)
    /// - `TIFFSTER_RETRY_BACKOFF_BASE`: Exponential backoff base in seconds (default: 2)
    /// - `TIFFSTER_STAGING_DIR`: Local staging root (default: data/jpg)
    /// - `TIFFSTER_CONTAINER_DIR`: Container root (default: data/tiff)
    /// - `TIFFSTER_REMOTE_DIR`: Remote store root (default: data/remote)
    /// - `TIFFSTER_QUEUE_CAPACITY`: Notification queue capacity (default: 64)
    ///
    /// Unparseable numeric values are reported instead of silently defaulted.
    pub fn from_env() -> TiffsterResult<Self> {
        let defaults = Self::default();

        let config = Self {
            window_size: env_parse("TIFFSTER_WINDOW_SIZE", defaults.window_size)?,
            frames_per_page: env_parse("TIFFSTER_FRAMES_PER_PAGE", defaults.frames_per_page)?,
            retry: RetryConfig {
                retry_count: env_parse("TIFFSTER_RETRY_COUNT", defaults.retry.retry_count)?,
                backoff_base: env_parse(
                    "TIFFSTER_RETRY_BACKOFF_BASE",
                    defaults.retry.backoff_base,
                )?,
                backoff_unit: defaults.retry.backoff_unit,
            },
            staging_dir: env_path("TIFFSTER_STAGING_DIR", defaults.staging_dir),
            container_dir: env_path("TIFFSTER_CONTAINER_DIR", defaults.container_dir),
            remote_dir: env_path("TIFFSTER_REMOTE_DIR", defaults.remote_dir),
            queue_capacity: env_parse("TIFFSTER_QUEUE_CAPACITY", defaults.queue_capacity)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - window_size > 0
    /// - frames_per_page > 0
    /// - backoff_base > 0
    /// - queue_capacity > 0
    pub fn validate(&self) -> TiffsterResult<()> {
        if self.window_size == 0 {
            return Err(invalid("window_size", self.window_size, "must be greater than 0"));
        }

        if self.frames_per_page == 0 {
            return Err(invalid(
                "frames_per_page",
                self.frames_per_page,
                "must be greater than 0",
            ));
        }

        if self.retry.backoff_base == 0 {
            return Err(invalid(
                "retry.backoff_base",
                self.retry.backoff_base,
                "must be greater than 0",
            ));
        }

        if self.queue_capacity == 0 {
            return Err(invalid(
                "queue_capacity",
                self.queue_capacity,
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> TiffsterError {
    TiffsterError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> TiffsterResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(key, &raw, "not a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

// =============================================================================
// TESTS
// =============================================================================
