//! Configuration module for s3-cli
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every section is optional;
//! a missing file section falls back to its defaults, and the S3 connection
//! settings can also come from the environment (`S3_ENDPOINT`,
//! `S3_BUCKET_NAME`, `AWS_REGION`).
//!
//! # Example
//!
//! ```yaml
//! s3:
//!   endpoint: "${S3_ENDPOINT:-http://localhost:9000}"
//!   region: us-east-1
//!   bucket: backups
//! transfer:
//!   part_size: 16MiB
//!   max_parallel_parts: 8
//! retry:
//!   max_attempts: 5
//! logging:
//!   format: json
//! ```

use crate::transport::retry::RetryPolicy;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Byte sizes
// ============================================================================

/// Parse a byte size such as `8388608`, `8MiB`, `16MB`, `1GiB` or `512k`.
///
/// Decimal suffixes (`KB`, `MB`, `GB`) are powers of 1000, binary suffixes
/// (`KiB`, `MiB`, `GiB`) and the single letters `K`, `M`, `G` are powers of 1024.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size '{}': expected a number", input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", input, e))?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => KIB,
        "m" | "mib" => MIB,
        "g" | "gib" => GIB,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => return Err(format!("invalid size '{}': unknown unit '{}'", input, other)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("invalid size '{}': too large", input))
}

/// Accept either an integer or a human readable size string
fn deserialize_byte_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match RawSize::deserialize(deserializer)? {
        RawSize::Number(n) => Ok(n),
        RawSize::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Prefix `https://` when the endpoint has no scheme (`S3_ENDPOINT=minio.local:9000`)
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Fill unset S3 connection settings from the environment.
    ///
    /// - `S3_ENDPOINT` (scheme defaults to `https://`)
    /// - `S3_BUCKET_NAME`
    /// - `AWS_REGION` or `AWS_DEFAULT_REGION` (only when the region is the default)
    pub fn apply_env(&mut self) {
        if self.s3.endpoint.is_none() {
            if let Some(endpoint) = non_empty_env("S3_ENDPOINT") {
                self.s3.endpoint = Some(normalize_endpoint(&endpoint));
            }
        }
        if self.s3.bucket.is_none() {
            self.s3.bucket = non_empty_env("S3_BUCKET_NAME");
        }
        if self.s3.region == default_region() {
            if let Some(region) =
                non_empty_env("AWS_REGION").or_else(|| non_empty_env("AWS_DEFAULT_REGION"))
            {
                self.s3.region = region;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref endpoint) = self.s3.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid S3 endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        if self.s3.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "S3 region cannot be empty".into(),
            ));
        }

        if self.transfer.part_size == 0 {
            return Err(ConfigError::ValidationError(
                "transfer.part_size must be greater than zero".into(),
            ));
        }

        if self.transfer.max_parallel_parts == 0 {
            return Err(ConfigError::ValidationError(
                "transfer.max_parallel_parts must be at least 1".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid retry multiplier {}: must be >= 1.0",
                self.retry.multiplier
            )));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid retry jitter {}: must be between 0.0 and 1.0",
                self.retry.jitter
            )));
        }

        if self.http.request_timeout_secs == 0 || self.http.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "HTTP timeouts must be greater than zero".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'pretty', 'compact' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

// ============================================================================
// S3 connection
// ============================================================================

/// S3 endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Endpoint URL. Default: AWS (`https://s3.<region>.amazonaws.com`)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Bucket used when a command names a bare key
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// `http://endpoint/bucket/key` instead of `http://bucket.endpoint/key`
    #[serde(default = "default_path_style")]
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            bucket: None,
            access_key: None,
            secret_key: None,
            session_token: None,
            path_style: default_path_style(),
        }
    }
}

impl S3Config {
    /// Endpoint URL, falling back to the regional AWS endpoint
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region))
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_path_style() -> bool {
    true
}

// ============================================================================
// Transfers
// ============================================================================

/// Multipart transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Objects smaller than this use a single PUT/GET. Default: 8MiB
    #[serde(
        default = "default_multipart_threshold",
        deserialize_with = "deserialize_byte_size"
    )]
    pub multipart_threshold: u64,
    /// Requested part size. Default: 8MiB
    #[serde(default = "default_part_size", deserialize_with = "deserialize_byte_size")]
    pub part_size: u64,
    /// Parts in flight per transfer. Default: 4
    #[serde(default = "default_max_parallel_parts")]
    pub max_parallel_parts: usize,
    /// Journal completed parts so an interrupted transfer can resume. Default: true
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Where journals are kept. Default: next to the local file
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            max_parallel_parts: default_max_parallel_parts(),
            resume: default_resume(),
            state_dir: None,
        }
    }
}

fn default_multipart_threshold() -> u64 {
    8 * MIB
}

fn default_part_size() -> u64 {
    8 * MIB
}

fn default_max_parallel_parts() -> usize {
    4
}

fn default_resume() -> bool {
    true
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per request, including the first. Default: 4
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 200ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between retries. Default: 2.0
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for a single delay. Default: 20s
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random spread applied to each delay (0.2 = +/-20%). Default: 0.2
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(self.multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_jitter() -> f64 {
    0.2
}

// ============================================================================
// HTTP
// ============================================================================

/// HTTP connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, body included. Default: 120s
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
        }
    }
}

impl HttpConfig {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            ..TransportConfig::default()
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_pool_max_idle() -> usize {
    16
}

// ============================================================================
// Logging and metrics
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty", "compact" or "json". Default: "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Write the Prometheus text exposition here after each command
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}
