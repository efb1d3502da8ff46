//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "boardcache";
const ENV_PREFIX: &str = "BOARDCACHE";
const DEFAULT_MAX_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 1000;
const DEFAULT_EVICTION_QUEUE_CAPACITY: u64 = 1024;
const DEFAULT_SOAK_BOARDS: usize = 4;
const DEFAULT_SOAK_THREADS: u64 = 64;
const DEFAULT_SOAK_REQUESTS: usize = 10_000;
const DEFAULT_SOAK_CONCURRENCY: usize = 32;

/// Command-line arguments for the boardcache binary.
#[derive(Debug, Parser)]
#[command(name = "boardcache", version, about = "Board page cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BOARDCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drive the cache with concurrent synthetic traffic and report its counters.
    Soak(SoakArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SoakArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Number of distinct boards.
    #[arg(long, default_value_t = DEFAULT_SOAK_BOARDS)]
    pub boards: usize,

    /// Number of distinct threads.
    #[arg(long, default_value_t = DEFAULT_SOAK_THREADS)]
    pub threads: u64,

    /// Total number of cache requests.
    #[arg(long, default_value_t = DEFAULT_SOAK_REQUESTS)]
    pub requests: usize,

    /// Maximum number of requests in flight.
    #[arg(long, default_value_t = DEFAULT_SOAK_CONCURRENCY)]
    pub concurrency: usize,
}

impl Default for SoakArgs {
    fn default() -> Self {
        Self {
            overrides: CacheOverrides::default(),
            boards: DEFAULT_SOAK_BOARDS,
            threads: DEFAULT_SOAK_THREADS,
            requests: DEFAULT_SOAK_REQUESTS,
            concurrency: DEFAULT_SOAK_CONCURRENCY,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the cache memory budget in bytes.
    #[arg(long = "cache-max-memory-bytes", value_name = "BYTES")]
    pub max_memory_bytes: Option<u64>,

    /// Override the interval during which a checked entry is served without re-checking.
    #[arg(long = "cache-freshness-window-ms", value_name = "MILLISECONDS")]
    pub freshness_window_ms: Option<u64>,

    /// Override the capacity of the eviction worker queue.
    #[arg(long = "cache-eviction-queue-capacity", value_name = "COUNT")]
    pub eviction_queue_capacity: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_memory_bytes: NonZeroUsize,
    pub freshness_window: Duration,
    pub eviction_queue_capacity: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Soak(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&CacheOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(bytes) = overrides.max_memory_bytes {
            self.cache.max_memory_bytes = Some(bytes);
        }
        if let Some(ms) = overrides.freshness_window_ms {
            self.cache.freshness_window_ms = Some(ms);
        }
        if let Some(capacity) = overrides.eviction_queue_capacity {
            self.cache.eviction_queue_capacity = Some(capacity);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_memory_bytes = non_zero_usize(
        cache.max_memory_bytes.unwrap_or(DEFAULT_MAX_MEMORY_BYTES),
        "cache.max_memory_bytes",
    )?;

    let freshness_window_ms = cache
        .freshness_window_ms
        .unwrap_or(DEFAULT_FRESHNESS_WINDOW_MS);
    if freshness_window_ms == 0 {
        return Err(LoadError::invalid(
            "cache.freshness_window_ms",
            "must be greater than zero",
        ));
    }

    let eviction_queue_capacity = non_zero_usize(
        cache
            .eviction_queue_capacity
            .unwrap_or(DEFAULT_EVICTION_QUEUE_CAPACITY),
        "cache.eviction_queue_capacity",
    )?;

    Ok(CacheSettings {
        max_memory_bytes,
        freshness_window: Duration::from_millis(freshness_window_ms),
        eviction_queue_capacity,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_memory_bytes: Option<u64>,
    freshness_window_ms: Option<u64>,
    eviction_queue_capacity: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
