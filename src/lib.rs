//! # Screenshot Queue
//!
//! Capture core for a web screenshot service: a content-addressable cache of
//! rendered images, a single-worker job queue with retries, and a per-client
//! fixed-window rate limiter. Rendering is done by headless Chrome through
//! `chromiumoxide`, one isolated browser per capture and never more than one
//! capture at a time.
//!
//! ## Features
//!
//! - **Fingerprint Cache**: SHA-256 keyed blobs on disk with age expiry and
//!   least-recently-used eviction down to 80% of the size limit
//! - **Job Scheduler**: `pending -> processing -> completed | failed` jobs,
//!   executed in submission order by a worker that starts on demand
//! - **Retry Logic**: fixed backoff retries for timeouts, DNS and page errors
//! - **Rate Limiter**: per-client request windows with periodic sweeping
//! - **Housekeeping**: cache, job and rate-limit sweeps stopped on shutdown
//! - **Metrics**: counters and gauges exportable in Prometheus format
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_queue::{Config, Metrics, RawCaptureParams, ScreenshotService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ScreenshotService::with_chrome(Config::default(), Arc::new(Metrics::new())).await?;
//!     service.start_housekeeping().await;
//!
//!     let request = RawCaptureParams::new("https://example.com").format("jpeg");
//!     let screenshot = service.capture_now(&request).await?;
//!     println!("Screenshot captured: {} bytes", screenshot.data.len());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Single Screenshot
//! ```bash
//! screenshot-queue capture --url https://example.com --output screenshot.png
//! ```
//!
//! ### Queued Jobs
//! ```bash
//! screenshot-queue --client 203.0.113.7 submit --input urls.txt --output screenshots/
//! ```
//!
//! ### Cache Maintenance
//! ```bash
//! screenshot-queue cache-stats
//! screenshot-queue cache-clear
//! ```

/// Configuration, output formats and capture request normalization
pub mod config;

/// Error types and error classification
pub mod error;

/// Request fingerprints used as cache keys
pub mod fingerprint;

/// On-disk screenshot cache
pub mod cache;

/// Capture engine abstraction and the headless Chrome implementation
pub mod capture;

/// Asynchronous job queue and worker loop
pub mod scheduler;

/// Per-client request rate limiting
pub mod rate_limiter;

/// Service composing cache, scheduler and rate limiter
pub mod screenshot_service;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection
pub mod metrics;

/// URL validation and formatting helpers
pub mod utils;


pub use cache::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use fingerprint::*;
pub use crate::metrics::*;
pub use rate_limiter::*;
pub use scheduler::*;
pub use screenshot_service::*;
pub use utils::*;
