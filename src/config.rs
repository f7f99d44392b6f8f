//! Configuration types for podcast-dl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration for the downloader
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session and token settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Download pipeline settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// External tool settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Session and token lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the authentication service
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,

    /// Where the token pair is persisted between runs; None disables caching
    #[serde(default)]
    pub token_cache_path: Option<PathBuf>,

    /// Safety margin subtracted from token expiry (default: 60 seconds)
    #[serde(default = "default_expiry_margin", with = "duration_serde")]
    pub expiry_margin: Duration,

    /// Retry policy for login and refresh requests
    #[serde(default = "default_auth_retry")]
    pub retry: RetryConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_base_url: default_auth_base_url(),
            token_cache_path: None,
            expiry_margin: default_expiry_margin(),
            retry: default_auth_retry(),
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URL of the podcast API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// How many times a rate-limited request is retried before surfacing
    /// (default: 3)
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,

    /// Wait applied when the server rate-limits without a Retry-After header
    /// (default: 5 seconds)
    #[serde(default = "default_rate_limit_backoff", with = "duration_serde")]
    pub rate_limit_default_backoff: Duration,

    /// Retry policy for transient network failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout: default_request_timeout(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            rate_limit_default_backoff: default_rate_limit_backoff(),
            retry: RetryConfig::default(),
        }
    }
}

/// Download pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory published episode files are placed in
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Directory staged segments live in until assembly
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Maximum segments fetched in parallel per job (default: 4)
    #[serde(default = "default_max_concurrent_segments")]
    pub max_concurrent_segments: usize,

    /// Retry policy applied to each individual segment
    #[serde(default)]
    pub segment_retry: RetryConfig,

    /// Page size used when listing episode catalogs (default: 50)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            staging_dir: default_staging_dir(),
            max_concurrent_segments: default_max_concurrent_segments(),
            segment_retry: RetryConfig::default(),
            page_size: default_page_size(),
        }
    }
}

/// External tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Explicit path to the ffmpeg binary; overrides PATH discovery
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Whether to search PATH for ffmpeg when no explicit path is given
    /// (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Upper bound on a single merge invocation (default: 300 seconds)
    #[serde(default = "default_merge_timeout", with = "duration_serde")]
    pub merge_timeout: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            search_path: true,
            merge_timeout: default_merge_timeout(),
        }
    }
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

fn default_auth_base_url() -> String {
    "https://podme-auth.example.com".to_string()
}

fn default_api_base_url() -> String {
    "https://api.podme.com/web/api/v2".to_string()
}

fn default_expiry_margin() -> Duration {
    Duration::from_secs(60)
}

fn default_auth_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        ..RetryConfig::default()
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit_max_retries() -> u32 {
    3
}

fn default_rate_limit_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./episodes")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./episodes/.staging")
}

fn default_max_concurrent_segments() -> usize {
    4
}

fn default_page_size() -> u32 {
    50
}

fn default_merge_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (seconds as integers)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
