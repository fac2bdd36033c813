//! Configuration for the rendering pipeline

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest source that will be copied locally (100 MiB)
pub const DEFAULT_MAX_SOURCE_BYTES: u64 = 100 * 1024 * 1024;
/// Per-axis bitmap limit
pub const DEFAULT_MAX_BITMAP_DIMENSION: u32 = 2048;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub render: RenderConfig,
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
    pub password: PasswordConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Maximum bytes accepted for a materialized copy
    pub max_source_bytes: u64,
    /// Read/write chunk used while copying
    pub copy_buffer_bytes: usize,
    /// Backoff between accessibility attempts (attempts = len + 1)
    pub retry_backoff_ms: Vec<u64>,
    /// Directory for temporary copies (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    pub max_bitmap_width: u32,
    pub max_bitmap_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Fraction of the memory budget given to rendered pages
    pub fraction: f64,
    /// Explicit memory budget; detected from the system when unset
    pub memory_budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchConfig {
    /// Maximum renders in flight before prefetching is skipped
    pub ceiling: usize,
    /// Memory utilization (0-1) above which prefetching is skipped
    pub memory_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    /// Country calling codes stripped from phone-number passwords
    pub country_codes: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            source: SourceConfig::default(),
            render: RenderConfig::default(),
            cache: CacheConfig::default(),
            prefetch: PrefetchConfig::default(),
            password: PasswordConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            copy_buffer_bytes: 16 * 1024,
            retry_backoff_ms: vec![500, 1000],
            temp_dir: None,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            max_bitmap_width: DEFAULT_MAX_BITMAP_DIMENSION,
            max_bitmap_height: DEFAULT_MAX_BITMAP_DIMENSION,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            fraction: 0.25,
            memory_budget_bytes: None,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            ceiling: 3,
            memory_threshold: 0.75,
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        PasswordConfig {
            country_codes: ["91", "1", "44", "61", "65", "971"]
                .iter()
                .map(|code| code.to_string())
                .collect(),
        }
    }
}

impl SourceConfig {
    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl PipelineConfig {
    /// Load from `QUICKPDF_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; invalid values keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PipelineConfig::default();

        if let Some(bytes) = parse_megabytes(&lookup, "QUICKPDF_MAX_SOURCE_MB") {
            config.source.max_source_bytes = bytes;
        }
        if let Some(dir) = lookup("QUICKPDF_TEMP_DIR").filter(|d| !d.trim().is_empty()) {
            config.source.temp_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = parse_var::<u32, _>(&lookup, "QUICKPDF_MAX_BITMAP").filter(|m| *m > 0) {
            config.render.max_bitmap_width = max;
            config.render.max_bitmap_height = max;
        }
        if let Some(fraction) = parse_var::<f64, _>(&lookup, "QUICKPDF_CACHE_FRACTION") {
            if fraction > 0.0 && fraction <= 1.0 {
                config.cache.fraction = fraction;
            } else {
                tracing::warn!("QUICKPDF_CACHE_FRACTION {} outside (0, 1], using default", fraction);
            }
        }
        if let Some(bytes) = parse_megabytes(&lookup, "QUICKPDF_MEMORY_BUDGET_MB") {
            config.cache.memory_budget_bytes = Some(bytes);
        }
        if let Some(ceiling) = parse_var::<usize, _>(&lookup, "QUICKPDF_PREFETCH_CEILING") {
            config.prefetch.ceiling = ceiling;
        }
        if let Some(threshold) = parse_var::<f64, _>(&lookup, "QUICKPDF_PREFETCH_MEMORY_THRESHOLD") {
            if (0.0..=1.0).contains(&threshold) {
                config.prefetch.memory_threshold = threshold;
            } else {
                tracing::warn!(
                    "QUICKPDF_PREFETCH_MEMORY_THRESHOLD {} outside [0, 1], using default",
                    threshold
                );
            }
        }
        if let Some(codes) = lookup("QUICKPDF_COUNTRY_CODES") {
            let codes: Vec<String> = codes
                .split(',')
                .map(|c| c.trim().trim_start_matches('+').to_string())
                .filter(|c| !c.is_empty() && c.chars().all(|ch| ch.is_ascii_digit()))
                .collect();
            if !codes.is_empty() {
                config.password.country_codes = codes;
            }
        }

        config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid value for {}: {:?}, using default", key, raw);
            None
        }
    }
}

/// A megabyte count converted to bytes; `None` when it does not fit in u64
fn parse_megabytes<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let mb = parse_var::<u64, _>(lookup, key)?;
    let bytes = mb.checked_mul(1024 * 1024);
    if bytes.is_none() {
        tracing::warn!("{} {} MB is out of range, using default", key, mb);
    }
    bytes
}
