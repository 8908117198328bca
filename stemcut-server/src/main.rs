//! stemcut - audio stem separation and DJ edit service
//!
//! Accepts uploads, separates them with Demucs, exports edits, reports each
//! file to the external API or the catalog database, and keeps outputs on
//! disk until the consumer confirms the download.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use stemcut_common::config::{CliOverrides, Settings};
use tokio::signal;
use tracing::{error, info, warn};

use stemcut_server::db::{self, CatalogDb};
use stemcut_server::{build_router, cleanup, worker, AppState};

/// Command-line arguments for stemcut
#[derive(Parser, Debug)]
#[command(name = "stemcut")]
#[command(about = "Audio stem separation and DJ edit service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Root folder holding uploads, outputs and the local database
    #[arg(short, long, env = "STEMCUT_ROOT")]
    root_folder: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(
        "Starting stemcut v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();
    let settings = Settings::load(&CliOverrides {
        port: args.port,
        root_folder: args.root_folder,
    })
    .context("Failed to load settings")?;

    settings.ensure_folders().context("Failed to create folder layout")?;
    info!("Root folder: {}", settings.root_folder.display());

    let db_path = settings.local_db_path();
    info!("Database: {}", db_path.display());
    let pool = db::init_local_pool(&db_path).await?;

    let (catalog, catalog_error) = connect_catalog(&settings).await;
    match (&catalog, settings.api_endpoint.is_empty()) {
        (Some(_), _) => info!("Reporting mode: database"),
        (None, false) => info!(endpoint = %settings.api_endpoint, "Reporting mode: external API"),
        (None, true) => warn!("Reporting mode: external API, but API_ENDPOINT is not set; reports are skipped"),
    }
    if settings.auth_enabled() {
        info!("API key authentication enabled");
    } else {
        warn!("API_KEY not set; protected routes are open");
    }

    let addr = format!("{}:{}", settings.host, settings.port);
    let state = AppState::new(settings, pool, catalog, catalog_error)?;

    let workers = worker::spawn_workers(&state);
    let services = cleanup::spawn_background_services(&state);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for handle in workers.into_iter().chain(services) {
        handle.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Catalog connection in database mode, or why it is unavailable
async fn connect_catalog(settings: &Settings) -> (Option<CatalogDb>, Option<String>) {
    if !settings.use_database_mode {
        return (None, None);
    }
    let Some(url) = settings.database_url.as_deref() else {
        warn!("USE_DATABASE_MODE is set but DATABASE_URL is empty; falling back to external API");
        return (None, None);
    };
    match CatalogDb::connect(url).await {
        Ok(catalog) => (Some(catalog), None),
        Err(e) => {
            error!("Catalog database unavailable, falling back to external API: {}", e);
            (None, Some(e.to_string()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
