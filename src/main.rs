use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deployadactyl::config::Config;
use deployadactyl::courier::{CfCourier, CfCourierFactory};
use deployadactyl::engine::{
    ArtifactFetcher, BlueGreen, Deployer, EventManager, Fetcher, FoundationPrechecker,
};
use deployadactyl::AppState;

const LOG_LEVEL_ENV: &str = "DEPLOYADACTYL_LOGLEVEL";

#[derive(Parser, Debug)]
#[command(name = "deployadactyl")]
#[command(author, version, about = "Blue/green deploys across every foundation of an environment", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (required env vars are checked here)
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Deployadactyl v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environments = config.environments.len(),
        "Loaded deployment environments"
    );

    if !CfCourier::is_available().await {
        tracing::warn!("cf CLI not found on PATH. Deploys will fail until it is installed.");
    }

    // Wire the pipeline
    let event_manager = Arc::new(EventManager::new());
    let blue_greener = Arc::new(BlueGreen::new(Arc::new(CfCourierFactory)));
    let prechecker = Arc::new(FoundationPrechecker::new(event_manager.clone()));
    let fetcher: Arc<dyn Fetcher> = Arc::new(ArtifactFetcher::new()?);

    let deployer = Arc::new(Deployer::new(
        config.clone(),
        blue_greener,
        fetcher.clone(),
        prechecker,
        event_manager,
    ));

    let state = Arc::new(AppState::new(deployer, fetcher));
    let app = deployadactyl::api::create_router(state);

    // Start API server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
