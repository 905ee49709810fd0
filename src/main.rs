use clap::Parser;
use screenshot_queue::{install_prometheus, setup_logging, Cli, CliRunner, Config, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting screenshot-queue v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args).await?;

    // The recorder has to exist before any metric handle is registered
    let prometheus = if args.metrics {
        Some(install_prometheus()?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    // Create CLI runner
    let cli_runner = CliRunner::new(config, args.client.clone(), metrics).await?;

    // Setup graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    // Run the command
    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Command completed");
            result
        }
        Ok(()) = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    // Graceful shutdown
    info!("Shutting down...");
    cli_runner.service.shutdown().await;

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("screenshot-queue stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path).await?
    } else {
        Config::default()
    };

    // Override with CLI arguments
    if let Some(cache_dir) = &args.cache_dir {
        config.cache.directory = cache_dir.clone();
    }

    if let Some(timeout) = args.timeout {
        config.capture.page_load_timeout = Duration::from_secs(timeout);
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.capture.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Cache directory: {}", config.cache.directory.display());
    info!(
        "Rate limit: {} requests per {:?}",
        config.rate_limit.max_requests, config.rate_limit.window
    );
    info!("Page load timeout: {:?}", config.capture.page_load_timeout);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Cannot install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
