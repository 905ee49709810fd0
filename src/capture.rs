//! Page capture engine
//!
//! The rest of the crate only talks to [`CapturePort`]. [`ChromeCapture`]
//! implements it with a fresh headless Chrome instance per capture, and
//! [`SerializedCapture`] wraps any port so that at most one capture runs at a
//! time across the process.

use crate::{CaptureConfig, CaptureRequest, OutputFormat, ScreenshotError};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapturePort: Send + Sync {
    /// Render `request` and return the encoded image bytes
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError>;
}

/// Runs captures one at a time through the wrapped port
pub struct SerializedCapture {
    inner: Arc<dyn CapturePort>,
    gate: Mutex<()>,
}

impl SerializedCapture {
    pub fn new(inner: Arc<dyn CapturePort>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CapturePort for SerializedCapture {
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError> {
        let _guard = self.gate.lock().await;
        self.inner.capture(request).await
    }
}

/// Capture engine backed by a headless Chrome launched per request
pub struct ChromeCapture {
    config: CaptureConfig,
}

impl ChromeCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    async fn launch(
        &self,
        request: &CaptureRequest,
        profile_dir: &Path,
    ) -> Result<(Browser, tokio::task::JoinHandle<()>), ScreenshotError> {
        let browser_config = create_browser_config(&self.config, request, profile_dir)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScreenshotError::BrowserLaunchFailed(e.to_string()))?;

        // The handler drives the DevTools connection and must be polled for
        // the browser to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
        });

        Ok((browser, handler_task))
    }

    async fn render(&self, browser: &Browser, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScreenshotError::PageError(e.to_string()))?;

        let result = self.render_page(&page, request).await;
        let _ = page.close().await;
        result
    }

    async fn render_page(&self, page: &Page, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(request.width())
            .height(request.height())
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(ScreenshotError::PageError)?;
        page.execute(metrics)
            .await
            .map_err(|e| ScreenshotError::PageError(e.to_string()))?;

        let load_timeout = self.config.page_load_timeout;
        match timeout(load_timeout, navigate(page, request.url(), load_timeout)).await {
            Ok(result) => result?,
            Err(_) => return Err(ScreenshotError::NavigationTimeout(load_timeout)),
        }

        if !request.delay().is_zero() {
            sleep(request.delay()).await;
        }

        let params = ScreenshotParams::builder()
            .format(cdp_format(request.format()))
            .full_page(request.full_page())
            .build();

        page.screenshot(params)
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))
    }
}

#[async_trait]
impl CapturePort for ChromeCapture {
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, ScreenshotError> {
        let start = Instant::now();
        let profile_dir = profile_dir();

        let result = match self.launch(request, &profile_dir).await {
            Ok((mut browser, handler_task)) => {
                let result = self.render(&browser, request).await;

                if let Err(e) = browser.close().await {
                    debug!("Browser close failed: {}; killing it", e);
                    if let Some(Err(e)) = browser.kill().await {
                        debug!("Browser kill failed: {}", e);
                    }
                }
                // Wait for the process to exit so it releases the profile
                if let Err(e) = browser.wait().await {
                    debug!("Browser wait failed: {}", e);
                }
                handler_task.abort();
                result
            }
            Err(e) => Err(e),
        };

        remove_profile(&profile_dir).await;

        match &result {
            Ok(data) => info!(
                "Captured {} ({} bytes) in {:?}",
                request.url(),
                data.len(),
                start.elapsed()
            ),
            Err(e) => error!("Capture of {} failed: {}", request.url(), e),
        }

        result
    }
}

async fn navigate(page: &Page, url: &str, load_timeout: Duration) -> Result<(), ScreenshotError> {
    page.goto(url)
        .await
        .map_err(|e| classify_navigation_error(url, &e.to_string(), load_timeout))?;
    Ok(())
}

/// Map a raw navigation failure onto the timeout / DNS / generic split that
/// callers use to pick a response
fn classify_navigation_error(url: &str, message: &str, load_timeout: Duration) -> ScreenshotError {
    let lowered = message.to_lowercase();

    if lowered.contains("err_name_not_resolved") || lowered.contains("name not resolved") {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        ScreenshotError::DnsResolution(host)
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        ScreenshotError::NavigationTimeout(load_timeout)
    } else {
        ScreenshotError::PageError(message.to_string())
    }
}

fn cdp_format(format: OutputFormat) -> CaptureScreenshotFormat {
    match format {
        OutputFormat::Png => CaptureScreenshotFormat::Png,
        OutputFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        OutputFormat::Webp => CaptureScreenshotFormat::Webp,
    }
}

/// Fresh Chrome profile location, unique across processes and captures
fn profile_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "screenshot-queue-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4()
    ))
}

async fn remove_profile(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed browser profile {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove browser profile {}: {}", path.display(), e),
    }
}

/// Chrome command-line arguments for a single isolated headless capture
pub fn get_chrome_args(config: &CaptureConfig, request: &CaptureRequest, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!("--window-size={},{}", request.width(), request.height()),
        format!("--user-data-dir={}", profile_dir.display()),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &CaptureConfig,
    request: &CaptureRequest,
    profile_dir: &Path,
) -> Result<BrowserConfig, ScreenshotError> {
    let mut builder = BrowserConfig::builder()
        .window_size(request.width(), request.height())
        .request_timeout(config.page_load_timeout)
        .args(get_chrome_args(config, request, profile_dir));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(ScreenshotError::BrowserLaunchFailed)
}
