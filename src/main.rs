use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use collection_archiver::config::Config;
use collection_archiver::fetch;
use collection_archiver::{Collaborators, Runner};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting collection-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        input = %config.input_path.display(),
        primary_workers = config.primary_workers,
        fallback_workers = config.fallback_workers,
        skip_sync = config.skip_sync,
        "Configuration loaded"
    );

    let mut tools = vec![
        ("yt-dlp", config.yt_dlp_path.as_str()),
        ("gallery-dl", config.gallery_dl_path.as_str()),
    ];
    if !config.skip_sync {
        tools.push(("rclone", config.rclone_path.as_str()));
    }
    for (name, program) in tools {
        if !fetch::is_available(program).await {
            warn!(tool = name, program, "External tool not found - jobs using it will fail");
        }
    }

    let parts = Collaborators::from_config(&config);
    let runner = Runner::new(config, parts);

    let result = tokio::select! {
        result = runner.run() => Some(result),
        () = shutdown_signal() => None,
    };

    info!("Shutting down...");
    runner.shutdown().await;

    match result {
        Some(summary) => {
            let summary = summary?;
            info!(
                unique_downloaded = summary.unique_downloaded,
                failed = summary.failed,
                "Run complete"
            );
        }
        None => warn!("Interrupted before the run finished"),
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,collection_archiver=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
