use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, Config, DeployMode};
use crate::download::Orchestrator;
use crate::metadata::MetadataFetcher;
use crate::models::VideoInfoResponse;
use crate::rate_limit::RateLimiter;
use crate::runner::{SystemRunner, ToolRunner};
use crate::tool::ToolLocator;

// --- Modules ---
pub mod config;
pub mod display;
pub mod download;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod models;
pub mod rate_limit;
pub mod runner;
pub mod tool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub locator: Arc<ToolLocator>,
    pub metadata: Arc<MetadataFetcher>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    /// Wires every component around one runner, so tests can swap in a fake.
    pub fn with_runner(config: Config, runner: Arc<dyn ToolRunner>) -> anyhow::Result<Self> {
        let locator = Arc::new(ToolLocator::new(&config, runner.clone())?);
        let metadata = MetadataFetcher::new(
            locator.clone(),
            runner.clone(),
            config.max_metadata_bytes,
            config.metadata_timeout(),
        );
        let orchestrator = Orchestrator::new(
            locator.clone(),
            runner,
            PathBuf::from(&config.temp_directory),
            config.download_timeout(),
            config.handoff_ttl(),
        );

        Ok(AppState {
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            locator,
            metadata: Arc::new(metadata),
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
        })
    }
}

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Streams yt-dlp downloads over HTTP.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manages the HTTP server.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Manages the yt-dlp binary.
    Tool {
        #[command(subcommand)]
        action: ToolAction,
    },
    /// Prints the metadata `POST /video-info` would return for a URL.
    Info { url: String },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Run the server in the foreground.
    Run,
}

#[derive(Subcommand, Debug)]
enum ToolAction {
    /// Locate yt-dlp, downloading it first in hosted mode.
    Install,
    /// Report the installed yt-dlp without fetching anything.
    Status,
}

// --- Main Application Logic ---
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = load_config().await?;

    match cli.command {
        Commands::Server { action: ServerAction::Run } => run_server(config).await?,
        Commands::Tool { action } => {
            let state = AppState::new(config)?;
            match action {
                ToolAction::Install => {
                    let tool = state.locator.ensure_available().await?;
                    println!("yt-dlp {} at {}", tool.version, tool.path.display());
                }
                ToolAction::Status => {
                    let status = state.locator.status().await;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
        }
        Commands::Info { url } => {
            let state = AppState::new(config)?;
            let meta = state.metadata.fetch(&url).await?;
            println!("{}", serde_json::to_string_pretty(&VideoInfoResponse::from(&meta))?);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/video-info", post(handlers::video_info))
        .route("/download", get(handlers::download))
        .route("/get-file/:filename", get(handlers::get_file))
        .route("/status", get(handlers::get_status))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state)
}

/// The core function that runs the Axum web server.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    tokio::fs::create_dir_all(&config.temp_directory).await?;
    let state = AppState::new(config)?;

    // Hosted deployments install up front so the first request is not the slow one.
    if state.config.mode == DeployMode::Hosted {
        if let Err(e) = state.locator.ensure_available().await {
            tracing::warn!("yt-dlp not ready at startup, will retry per request: {}", e);
        }
    }

    let app = router(state);
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutting down");
}
