//! Cache configuration
//!
//! Loaded from TOML. Every field has a default so an empty file (or no file
//! at all) yields a working configuration:
//!
//! ```toml
//! [redis]
//! url = "redis://cache.internal:6379"
//!
//! [kairosdb]
//! host = "kairos.internal"
//! port = 8080
//!
//! [shadow]
//! http_header_name = "Tscached-Shadow-Load"
//! referrer_blacklist = ["alerting"]
//!
//! [expiry]
//! metricnames = 600
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "TSCACHE_CONFIG";

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "tscache.toml";

/// Top level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub kairosdb: KairosConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Read and parse a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load configuration from `TSCACHE_CONFIG`, then `./tscache.toml`, then defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            match Self::from_path(&path) {
                Ok(config) => {
                    info!(path = %path, "Loaded configuration from file");
                    return config;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to load config file, using defaults");
                }
            }
        }

        if let Some(config) = Self::from_optional_path(Path::new(DEFAULT_CONFIG_FILE)) {
            return config;
        }

        info!("Using default configuration");
        Self::default()
    }

    /// Load a file that may legitimately be absent
    ///
    /// A missing file is silent; a file that exists but does not parse is
    /// logged and ignored.
    fn from_optional_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::from_path(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration from file");
                Some(config)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config file, using defaults");
                None
            }
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8008".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Cache store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound for every store round trip
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Discover the master through Sentinel instead of connecting to `url`
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,
}

/// Redis Sentinel master discovery
///
/// ```toml
/// [redis.sentinel]
/// nodes = ["redis://10.0.0.1:26379", "redis://10.0.0.2:26379"]
/// master_name = "tscached"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    pub nodes: Vec<String>,
    pub master_name: String,
    /// Password of the discovered master
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    1_000
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            timeout_ms: default_redis_timeout_ms(),
            sentinel: None,
        }
    }
}

/// Backend TSDB settings
#[derive(Debug, Clone, Deserialize)]
pub struct KairosConfig {
    #[serde(default = "default_kairos_host")]
    pub host: String,
    #[serde(default = "default_kairos_port")]
    pub port: u16,
    #[serde(default = "default_kairos_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kairos_host() -> String {
    "localhost".to_string()
}

fn default_kairos_port() -> u16 {
    8080
}

fn default_kairos_timeout_secs() -> u64 {
    30
}

impl KairosConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for KairosConfig {
    fn default() -> Self {
        Self {
            host: default_kairos_host(),
            port: default_kairos_port(),
            timeout_secs: default_kairos_timeout_secs(),
        }
    }
}

/// Series data handling
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Cached data younger than this is served without asking the backend
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_secs: u64,

    /// Sampling interval of backend data, subtracted from gap fetches
    #[serde(default = "default_expected_resolution_ms")]
    pub expected_resolution_ms: i64,

    /// Resolution assumed by the index-arithmetic trim
    #[serde(default = "default_trim_resolution")]
    pub trim_resolution_secs: i64,

    /// Maximum positions scanned for a splice point
    #[serde(default = "default_merge_cutoff")]
    pub merge_cutoff: usize,

    #[serde(default = "default_series_expiry")]
    pub series_expiry_secs: u64,

    #[serde(default = "default_query_expiry")]
    pub query_expiry_secs: u64,
}

fn default_staleness_threshold() -> u64 {
    10
}

fn default_expected_resolution_ms() -> i64 {
    10_000
}

fn default_trim_resolution() -> i64 {
    10
}

fn default_merge_cutoff() -> usize {
    10
}

fn default_series_expiry() -> u64 {
    10_800 // 3 hours
}

fn default_query_expiry() -> u64 {
    10_800
}

impl DataConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn series_expiry(&self) -> Duration {
        Duration::from_secs(self.series_expiry_secs)
    }

    pub fn query_expiry(&self) -> Duration {
        Duration::from_secs(self.query_expiry_secs)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: default_staleness_threshold(),
            expected_resolution_ms: default_expected_resolution_ms(),
            trim_resolution_secs: default_trim_resolution(),
            merge_cutoff: default_merge_cutoff(),
            series_expiry_secs: default_series_expiry(),
            query_expiry_secs: default_query_expiry(),
        }
    }
}

/// Splitting of cold backend fetches into concurrent chunks
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_chunk_length")]
    pub chunk_length_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_chunk_length() -> u64 {
    1_800
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_length_secs: default_chunk_length(),
        }
    }
}

/// TTLs of metadata endpoints, keyed by endpoint name
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ExpiryConfig {
    pub per_name: BTreeMap<String, u64>,
}

/// Default TTL of metadata-class entries
pub const DEFAULT_META_EXPIRY_SECS: u64 = 300;

impl ExpiryConfig {
    /// TTL for a metadata endpoint, 5 minutes unless configured
    pub fn ttl_for(&self, name: &str) -> Duration {
        Duration::from_secs(
            self.per_name
                .get(name)
                .copied()
                .unwrap_or(DEFAULT_META_EXPIRY_SECS),
        )
    }
}

/// Readahead ("shadow load") settings
#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    /// Requests carrying this header are always admitted
    #[serde(default = "default_shadow_header")]
    pub http_header_name: String,

    /// Referrers containing any of these substrings are never admitted
    #[serde(default)]
    pub referrer_blacklist: Vec<String>,

    /// Leadership lease TTL
    #[serde(default = "default_leader_expiration")]
    pub leader_expiration_secs: u64,

    /// Period of the readahead cycle when running as a service
    #[serde(default = "default_shadow_interval")]
    pub interval_secs: u64,

    /// Keep refreshing the remaining candidates after a failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Run the readahead service inside the HTTP server process
    #[serde(default)]
    pub run_in_server: bool,
}

fn default_shadow_header() -> String {
    "Tscached-Shadow-Load".to_string()
}

fn default_leader_expiration() -> u64 {
    3_600
}

fn default_shadow_interval() -> u64 {
    60
}

impl ShadowConfig {
    pub fn leader_expiration(&self) -> Duration {
        Duration::from_secs(self.leader_expiration_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            http_header_name: default_shadow_header(),
            referrer_blacklist: Vec::new(),
            leader_expiration_secs: default_leader_expiration(),
            interval_secs: default_shadow_interval(),
            continue_on_error: false,
            run_in_server: false,
        }
    }
}
