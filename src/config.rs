//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for every component of the
//! service, plus the capture request value object and the normalization rules
//! that turn raw, untrusted parameters into it.

use crate::{ScreenshotError, UrlValidator};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted viewport width in pixels
pub const MIN_WIDTH: u32 = 320;
/// Largest accepted viewport width in pixels
pub const MAX_WIDTH: u32 = 3840;
/// Smallest accepted viewport height in pixels
pub const MIN_HEIGHT: u32 = 240;
/// Largest accepted viewport height in pixels
pub const MAX_HEIGHT: u32 = 2160;
/// Longest accepted post-load delay in seconds
pub const MAX_DELAY_SECS: u32 = 10;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 800;

/// Main configuration structure for the service
///
/// Each collaborator gets its own section so that a JSON config file can
/// override a single knob without restating the rest.
///
/// # Examples
///
/// ```rust
/// use screenshot_queue::Config;
///
/// let config = Config::default();
/// assert_eq!(config.rate_limit.max_requests, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Fingerprint cache settings
    pub cache: CacheConfig,

    /// Job scheduler settings
    pub scheduler: SchedulerConfig,

    /// Per-client rate limiter settings
    pub rate_limit: RateLimitConfig,

    /// Browser capture settings
    pub capture: CaptureConfig,
}

impl Config {
    /// Load a configuration from a JSON file; missing sections keep their defaults
    pub async fn from_file(path: &std::path::Path) -> Result<Self, ScreenshotError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScreenshotError> {
        let invalid = |msg: &str| Err(ScreenshotError::Configuration(msg.to_string()));

        if self.cache.max_size_bytes == 0 {
            return invalid("Cache max size must be greater than 0");
        }
        if self.cache.max_age.is_zero() {
            return invalid("Cache max age must be greater than 0");
        }
        if self.cache.sweep_interval.is_zero() {
            return invalid("Cache sweep interval must be greater than 0");
        }
        if self.scheduler.cleanup_interval.is_zero() {
            return invalid("Job cleanup interval must be greater than 0");
        }
        if self.scheduler.retry.multiplier < 1.0 {
            return invalid("Retry multiplier must be at least 1.0");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("Rate limit must allow at least one request per window");
        }
        if self.rate_limit.window.is_zero() {
            return invalid("Rate limit window must be greater than 0");
        }
        if self.rate_limit.sweep_interval.is_zero() {
            return invalid("Rate limit sweep interval must be greater than 0");
        }
        if self.capture.page_load_timeout.is_zero() {
            return invalid("Page load timeout must be greater than 0");
        }

        Ok(())
    }
}

/// Fingerprint cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one blob file per cache entry (default: ./cache/screenshots)
    pub directory: PathBuf,

    /// Used when `directory` cannot be created (default: <tmp>/screenshot-queue-cache)
    pub fallback_directory: PathBuf,

    /// Aggregate blob size that triggers eviction (default: 500 MiB)
    ///
    /// Eviction runs down to 80% of this value so that the next few inserts
    /// do not each trigger another pass.
    pub max_size_bytes: u64,

    /// Entries older than this are never served (default: 24 hours)
    pub max_age: Duration,

    /// How often expired entries are swept (default: 1 hour)
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache/screenshots"),
            fallback_directory: std::env::temp_dir().join("screenshot-queue-cache"),
            max_size_bytes: 500 * 1024 * 1024,
            max_age: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Job scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retry policy applied to failed captures
    pub retry: RetryConfig,

    /// Finished jobs stay visible this long after completion (default: 1 hour)
    pub job_retention: Duration,

    /// How often finished jobs are removed (default: 1 hour)
    pub cleanup_interval: Duration,

    /// Jobs stuck in `processing` longer than this are failed by the cleanup
    /// sweep (default: 10 minutes)
    pub processing_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            job_retention: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            processing_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Bounded retry policy for captures
///
/// A `multiplier` of 1.0 gives a fixed backoff; larger values grow the delay
/// geometrically up to `max_delay`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2, i.e. 3 attempts in total)
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    pub fn total_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Per-client rate limiter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window (default: 10)
    pub max_requests: u32,

    /// Length of a fixed window (default: 60 seconds)
    pub window: Duration,

    /// How often elapsed windows are dropped (default: 5 minutes)
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Browser capture settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bound on navigation plus load (default: 30 seconds)
    pub page_load_timeout: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads
    pub user_agent: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(30),
            chrome_path: None,
            user_agent: None,
        }
    }
}

/// Supported output image formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG format - lossless compression, best quality
    #[default]
    Png,
    /// JPEG format - lossy compression, smaller files
    Jpeg,
    /// WebP format - modern compression, good balance of size and quality
    Webp,
}

impl OutputFormat {
    /// Parse a user supplied format name, falling back to PNG for anything unknown
    pub fn parse_or_default(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "png" => OutputFormat::Png,
            "jpeg" | "jpg" => OutputFormat::Jpeg,
            "webp" => OutputFormat::Webp,
            _ => OutputFormat::default(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    pub fn all() -> [OutputFormat; 3] {
        [OutputFormat::Png, OutputFormat::Jpeg, OutputFormat::Webp]
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture parameters as received from a caller, before any checking
///
/// Numeric fields are kept as text because they usually arrive as query
/// string values; text that is not a number is rejected, numbers outside the
/// accepted range are clamped.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawCaptureParams {
    pub url: String,
    pub width: Option<String>,
    pub height: Option<String>,
    pub full_page: bool,
    pub format: Option<String>,
    pub delay: Option<String>,
}

impl RawCaptureParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width.to_string());
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height.to_string());
        self
    }

    pub fn full_page(mut self, full_page: bool) -> Self {
        self.full_page = full_page;
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn delay(mut self, seconds: u32) -> Self {
        self.delay = Some(seconds.to_string());
        self
    }

    /// Validate the URL and clamp everything else into a [`CaptureRequest`]
    pub fn normalize(&self, validator: &UrlValidator) -> Result<CaptureRequest, ScreenshotError> {
        validator.validate(&self.url)?;

        let width = parse_dimension("width", self.width.as_deref())?.unwrap_or(DEFAULT_WIDTH as i64);
        let height =
            parse_dimension("height", self.height.as_deref())?.unwrap_or(DEFAULT_HEIGHT as i64);
        let delay = parse_dimension("delay", self.delay.as_deref())?.unwrap_or(0);
        let format = self
            .format
            .as_deref()
            .map(OutputFormat::parse_or_default)
            .unwrap_or_default();

        Ok(CaptureRequest::new(
            &self.url,
            width,
            height,
            self.full_page,
            format,
            delay,
        ))
    }
}

fn parse_dimension(name: &'static str, value: Option<&str>) -> Result<Option<i64>, ScreenshotError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ScreenshotError::InvalidParameter {
                name,
                reason: format!("'{text}' is not a whole number"),
            }),
    }
}

/// A normalized, immutable capture request
///
/// Every constructor clamps its inputs, so a value of this type always sits
/// inside the accepted bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureRequest {
    url: String,
    width: u32,
    height: u32,
    full_page: bool,
    format: OutputFormat,
    delay_secs: u32,
}

impl CaptureRequest {
    pub fn new(
        url: &str,
        width: i64,
        height: i64,
        full_page: bool,
        format: OutputFormat,
        delay_secs: i64,
    ) -> Self {
        Self {
            url: url.trim().to_string(),
            width: width.clamp(MIN_WIDTH as i64, MAX_WIDTH as i64) as u32,
            height: height.clamp(MIN_HEIGHT as i64, MAX_HEIGHT as i64) as u32,
            full_page,
            format,
            delay_secs: delay_secs.clamp(0, MAX_DELAY_SECS as i64) as u32,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn full_page(&self) -> bool {
        self.full_page
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs as u64)
    }

    pub fn delay_secs(&self) -> u32 {
        self.delay_secs
    }
}
