use crate::{
    format_bytes, format_duration, Config, JobId, JobStatus, JobView, Metrics, OutputFormat,
    RawCaptureParams, ScreenshotService,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "screenshot-queue")]
#[command(about = "Cached, rate-limited web screenshot queue")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Cache directory")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, help = "Page load timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, default_value = "local", help = "Client id charged against the rate limit")]
    pub client: String,

    #[arg(long, help = "Print Prometheus metrics before exiting")]
    pub metrics: bool,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single screenshot synchronously
    Capture {
        #[arg(short, long, help = "URL to screenshot")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[command(flatten)]
        options: CaptureOptions,
    },

    /// Queue URLs as jobs and wait for all of them to finish
    Submit {
        #[arg(help = "URLs to capture")]
        urls: Vec<String>,

        #[arg(short, long, help = "File containing URLs (one per line)")]
        input: Option<PathBuf>,

        #[arg(short, long, help = "Output directory for screenshots")]
        output: PathBuf,

        #[arg(long, default_value = "500", help = "Job polling interval in milliseconds")]
        poll_interval: u64,

        #[command(flatten)]
        options: CaptureOptions,
    },

    /// Show cache statistics
    CacheStats,

    /// Remove every cached screenshot
    CacheClear,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct CaptureOptions {
    #[arg(long, help = "Output format (png, jpeg, webp)")]
    pub format: Option<String>,

    #[arg(long, help = "Viewport width")]
    pub width: Option<String>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<String>,

    #[arg(long, help = "Capture the full page")]
    pub full_page: bool,

    #[arg(long, help = "Seconds to wait after load before capturing")]
    pub delay: Option<String>,
}

impl CaptureOptions {
    pub fn to_params(&self, url: &str) -> RawCaptureParams {
        RawCaptureParams {
            url: url.to_string(),
            width: self.width.clone(),
            height: self.height.clone(),
            full_page: self.full_page,
            format: self.format.clone(),
            delay: self.delay.clone(),
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub client: String,
    pub service: Arc<ScreenshotService>,
}

impl CliRunner {
    pub async fn new(
        config: Config,
        client: String,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let service = Arc::new(ScreenshotService::with_chrome(config.clone(), metrics).await?);
        service.start_housekeeping().await;

        Ok(Self {
            config,
            client,
            service,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Capture {
                url,
                output,
                options,
            } => self.run_capture(&url, &output, &options).await,
            Commands::Submit {
                urls,
                input,
                output,
                poll_interval,
                options,
            } => {
                let mut all_urls = urls;
                if let Some(input) = input {
                    all_urls.extend(read_urls_from_file(&input).await?);
                }
                self.run_submit(all_urls, &output, Duration::from_millis(poll_interval.max(1)), &options)
                    .await
            }
            Commands::CacheStats => self.show_cache_stats().await,
            Commands::CacheClear => {
                let removed = self.service.cache_clear().await;
                println!("Removed {removed} cached screenshots");
                Ok(())
            }
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    fn admit(&self) -> Result<(), Box<dyn std::error::Error>> {
        let decision = self.service.check_rate_limit(&self.client);
        if decision.allowed {
            Ok(())
        } else {
            Err(format!(
                "Rate limit exceeded for client {}; retry after {}",
                self.client, decision.reset_time
            )
            .into())
        }
    }

    pub async fn run_capture(
        &self,
        url: &str,
        output: &Path,
        options: &CaptureOptions,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.admit()?;
        info!("Taking screenshot of: {}", url);

        let start = std::time::Instant::now();
        let outcome = self.service.capture_now(&options.to_params(url)).await?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &outcome.data).await?;
        info!("Screenshot saved to: {}", output.display());

        println!("Screenshot captured successfully:");
        println!("  URL: {url}");
        println!("  Output: {}", output.display());
        println!("  Format: {}", outcome.format);
        println!("  Size: {}", format_bytes(outcome.data.len() as u64));
        println!("  From cache: {}", outcome.from_cache);
        println!("  Duration: {}", format_duration(start.elapsed()));

        Ok(())
    }

    pub async fn run_submit(
        &self,
        urls: Vec<String>,
        output: &Path,
        poll_interval: Duration,
        options: &CaptureOptions,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if urls.is_empty() {
            return Err("No URLs to submit".into());
        }
        fs::create_dir_all(output).await?;

        let mut submitted: Vec<(JobId, String)> = Vec::new();
        for url in urls {
            if let Err(e) = self.admit() {
                warn!("Skipping {}: {}", url, e);
                continue;
            }
            match self.service.create_job(&options.to_params(&url)).await {
                Ok(id) => submitted.push((id, url)),
                Err(e) => warn!("Rejected {}: {}", url, e),
            }
        }
        info!("Submitted {} jobs", submitted.len());

        let mut interval = tokio::time::interval(poll_interval);
        let finished = loop {
            interval.tick().await;

            let views: Vec<JobView> = submitted
                .iter()
                .filter_map(|(id, _)| self.service.get_job(id))
                .collect();
            let stats = self.service.queue_stats();
            println!(
                "Progress: {} pending, {} processing, {} completed, {} failed",
                stats.pending, stats.processing, stats.completed, stats.failed
            );

            if views.iter().all(|view| view.status.is_terminal()) {
                break views;
            }
        };

        let mut success_count = 0;
        let mut error_count = 0;

        for view in finished {
            let url = submitted
                .iter()
                .find(|(id, _)| *id == view.id)
                .map(|(_, url)| url.as_str())
                .unwrap_or_default();

            match (view.status, &view.result) {
                (JobStatus::Completed, Some(result)) => {
                    let filepath = output.join(generate_filename(url, result.format));
                    fs::write(&filepath, result.decode_image()?).await?;
                    success_count += 1;
                    info!(
                        "Saved screenshot: {} (from cache: {})",
                        filepath.display(),
                        result.from_cache
                    );
                }
                _ => {
                    error_count += 1;
                    error!(
                        "Job {} for {} failed: {}",
                        view.id,
                        url,
                        view.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }

        info!(
            "Submit completed. Success: {}, Errors: {}",
            success_count, error_count
        );
        Ok(())
    }

    pub async fn show_cache_stats(&self) -> Result<(), Box<dyn std::error::Error>> {
        let stats = self.service.cache_stats().await;

        println!("Screenshot Cache");
        println!("================");
        println!("  Directory: {}", stats.directory.display());
        println!("  Entries: {}", stats.entries);
        println!(
            "  Size: {} of {}",
            format_bytes(stats.total_size),
            format_bytes(stats.max_size)
        );
        println!("  Max age: {}", format_duration(stats.max_age));
        if let (Some(oldest), Some(newest)) = (stats.oldest_entry, stats.newest_entry) {
            println!("  Oldest entry: {oldest}");
            println!("  Newest entry: {newest}");
        }
        println!(
            "  Hit rate: {:.1}% ({} hits, {} misses)",
            stats.hit_rate * 100.0,
            stats.hits,
            stats.misses
        );

        Ok(())
    }
}

pub async fn validate_config(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(config_path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Cache directory: {}", config.cache.directory.display());
    println!("  Cache max size: {}", format_bytes(config.cache.max_size_bytes));
    println!("  Cache max age: {}", format_duration(config.cache.max_age));
    println!("  Capture retries: {}", config.scheduler.retry.max_retries);
    println!(
        "  Rate limit: {} per {}",
        config.rate_limit.max_requests,
        format_duration(config.rate_limit.window)
    );
    println!(
        "  Page load timeout: {}",
        format_duration(config.capture.page_load_timeout)
    );

    Ok(())
}

pub async fn read_urls_from_file(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path).await?;
    let urls: Vec<String> = content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect();

    Ok(urls)
}

/// File name for a job result, derived from its URL
pub fn generate_filename(url: &str, format: OutputFormat) -> String {
    let sanitized: String = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();

    format!("{}.{}", sanitized.trim_end_matches('_'), format.extension())
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
