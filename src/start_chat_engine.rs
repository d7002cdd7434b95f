//! Startup helpers for the chat engine server.

use std::process::ExitCode;
use std::sync::Arc;

use crate::core::config::EngineConfig;
use crate::server::{self, AppState};

/// Run the server until the process is stopped.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat engine v{}", env!("CARGO_PKG_VERSION"));

    let state = match initialize() {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let port = state.config.server.port;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    };

    if let Err(e) = rt.block_on(server::run_server_with_shutdown(state, port, shutdown)) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Load configuration and build application state without starting the server.
///
/// # Errors
/// Returns an error if the configuration is invalid or state creation fails.
pub fn initialize() -> Result<Arc<AppState>, Box<dyn std::error::Error + Send + Sync>> {
    let config = EngineConfig::load().map_err(|e| format!("Invalid configuration: {e}"))?;
    tracing::info!(
        ollama = %config.backends.ollama_base_url,
        openai = %config.backends.openai_base_url,
        models = config.models.len(),
        "Backends configured"
    );
    if config.models.is_empty() {
        tracing::warn!("No models configured; every submission will be rejected");
    }

    AppState::new(config).map_err(|e| format!("Failed to create state: {e}").into())
}
