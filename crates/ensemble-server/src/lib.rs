//! Ensemble Server — multi-agent orchestration backend.
//!
//! A standalone Rust backend providing:
//! - RESTful HTTP API via axum
//! - SSE streaming of agent session updates
//! - Tool endpoint for agent callbacks
//! - GitHub webhook receiver and polling triggers
//!
//! This crate can be used standalone or embedded in other applications.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ensemble_core::state::{AppState, AppStateInner};
use ensemble_core::Database;

/// Configuration for the Ensemble backend server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3210),
            db_path: std::env::var("ENSEMBLE_DB_PATH")
                .unwrap_or_else(|_| "ensemble.db".to_string()),
        }
    }
}

/// Create a shared `AppState` from a database path.
///
/// Useful when the state must be shared between the HTTP server and other
/// consumers (embedded hosts, tests).
pub async fn create_app_state(db_path: &str) -> Result<AppState, String> {
    let db = if db_path == ":memory:" {
        Database::open_in_memory().map_err(|e| format!("Failed to open database: {}", e))?
    } else {
        Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?
    };

    let state: AppState = Arc::new(AppStateInner::new(db));

    // Ensure default workspace exists
    state
        .workspace_store
        .ensure_default()
        .await
        .map_err(|e| format!("Failed to initialize default workspace: {}", e))?;

    Ok(state)
}

/// Start the backend server.
///
/// Returns the actual address the server is listening on.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ensemble_server=info,ensemble_core=info,tower_http=info".into()),
        )
        .init();

    tracing::info!(
        "Starting Ensemble backend server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.db_path).await?;
    state.start_services();

    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app: Router = Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Ensemble backend server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "ensemble-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
