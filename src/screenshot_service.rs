//! Screenshot service wiring the cache, scheduler and rate limiter together
//!
//! This module provides the `ScreenshotService` used by the CLI. It owns the
//! single serialized capture engine that both the synchronous path and the
//! job worker go through, and the background sweeps that keep the cache, the
//! job table and the rate-limit windows bounded.

use crate::{
    capture_with_retry, CacheStats, CapturePort, ChromeCapture, Config,
    FingerprintCache, JobId, JobScheduler, JobView, Metrics, OutputFormat, QueueStats,
    RateLimitDecision, RateLimiter, RawCaptureParams, RetryConfig, ScreenshotError,
    SerializedCapture, UrlValidator,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a synchronous capture
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub data: Vec<u8>,
    pub format: OutputFormat,
    pub from_cache: bool,
}

/// Front door for captures
///
/// # Examples
///
/// ```rust,no_run
/// use screenshot_queue::{Config, Metrics, RawCaptureParams, ScreenshotService};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = ScreenshotService::with_chrome(Config::default(), Arc::new(Metrics::new())).await?;
///
///     let job = service.create_job(&RawCaptureParams::new("https://example.com")).await?;
///     println!("queued {job}");
///
///     let shot = service.capture_now(&RawCaptureParams::new("https://example.com").width(1024)).await?;
///     println!("captured {} bytes", shot.data.len());
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ScreenshotService {
    config: Config,
    cache: Arc<FingerprintCache>,
    scheduler: JobScheduler,
    rate_limiter: Arc<RateLimiter>,
    capture: Arc<dyn CapturePort>,
    validator: Arc<UrlValidator>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
    housekeeping: Mutex<Vec<JoinHandle<()>>>,
}

impl ScreenshotService {
    /// Build the service around `engine`, which gets wrapped so that captures
    /// never overlap
    pub async fn new(
        config: Config,
        engine: Arc<dyn CapturePort>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ScreenshotError> {
        config.validate()?;

        let cache = Arc::new(FingerprintCache::open(&config.cache, metrics.clone()).await?);
        let capture: Arc<dyn CapturePort> = Arc::new(SerializedCapture::new(engine));
        let validator = Arc::new(UrlValidator::default());
        let scheduler = JobScheduler::new(
            config.scheduler.clone(),
            cache.clone(),
            capture.clone(),
            validator.clone(),
            metrics.clone(),
        );
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, metrics.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Screenshot service initialized");

        Ok(Self {
            config,
            cache,
            scheduler,
            rate_limiter,
            capture,
            validator,
            metrics,
            shutdown_tx,
            housekeeping: Mutex::new(Vec::new()),
        })
    }

    /// Build the service with the headless Chrome engine
    pub async fn with_chrome(config: Config, metrics: Arc<Metrics>) -> Result<Self, ScreenshotError> {
        let engine = Arc::new(ChromeCapture::new(config.capture.clone()));
        Self::new(config, engine, metrics).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the cache, job and rate-limit sweeps
    pub async fn start_housekeeping(&self) {
        let mut handles = self.housekeeping.lock().await;
        if !handles.is_empty() {
            return;
        }

        handles.push(self.cache.spawn_sweeper(self.shutdown_tx.subscribe()));
        handles.push(self.scheduler.spawn_cleanup(self.shutdown_tx.subscribe()));
        handles.push(self.rate_limiter.spawn_sweeper(self.shutdown_tx.subscribe()));
        debug!("Started {} housekeeping tasks", handles.len());
    }

    /// Capture synchronously, serving from the cache when possible
    ///
    /// The engine is tried once; callers decide whether to retry.
    pub async fn capture_now(&self, raw: &RawCaptureParams) -> Result<CaptureOutcome, ScreenshotError> {
        let request = raw.normalize(&self.validator)?;

        if let Some(data) = self.cache.get(&request).await {
            return Ok(CaptureOutcome {
                data,
                format: request.format(),
                from_cache: true,
            });
        }

        let single_attempt = RetryConfig {
            max_retries: 0,
            ..self.config.scheduler.retry.clone()
        };
        let data = capture_with_retry(self.capture.as_ref(), &request, &single_attempt, &self.metrics).await?;

        if !self.cache.put(&request, &data).await {
            warn!("Captured {} but could not cache it", request.url());
        }

        Ok(CaptureOutcome {
            data,
            format: request.format(),
            from_cache: false,
        })
    }

    pub async fn create_job(&self, raw: &RawCaptureParams) -> Result<JobId, ScreenshotError> {
        self.scheduler.create_job(raw).await
    }

    pub fn get_job(&self, id: &JobId) -> Option<JobView> {
        self.scheduler.get_job(id)
    }

    pub fn get_all_jobs(&self) -> Vec<JobView> {
        self.scheduler.get_all_jobs()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.queue_stats()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn cache_clear(&self) -> usize {
        self.cache.clear().await
    }

    pub fn check_rate_limit(&self, client_id: &str) -> RateLimitDecision {
        self.rate_limiter.check_limit(client_id)
    }

    /// Stop the housekeeping tasks and wait for them to exit
    pub async fn shutdown(&self) {
        info!("Shutting down screenshot service");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.housekeeping.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Housekeeping task ended abnormally: {}", e);
            }
        }

        info!("Screenshot service shutdown complete");
    }
}
