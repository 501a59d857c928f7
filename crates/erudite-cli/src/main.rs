//! Erudite CLI
//!
//! Main entry point for running the Erudite relay server.

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use erudite_model::{GeminiClient, GeminiConfig};
use erudite_orchestrator::{
    create_router, AppState, Config, JsonFileBackend, LearningStore,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Erudite - AI Tutoring Relay
///
/// Serves the relay API that composes teaching prompts, tracks learner
/// progress and forwards conversations to the hosted model.
#[derive(Parser, Debug)]
#[command(name = "erudite")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: erudite.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Port for the HTTP API server (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for persisted learning state (overrides the config file)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Erudite relay starting");
    tracing::debug!(config = ?args.config, "Config file");

    match run_server(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Loads configuration, wires the model client and learning store, and
/// serves the API until Ctrl+C.
async fn run_server(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ref state_dir) = args.state_dir {
        config.state_dir.clone_from(state_dir);
    }

    // Re-validate after overrides
    config.validate()?;

    let api_key = config.api_key()?;
    let model = GeminiClient::new(GeminiConfig {
        api_base_url: config.api_base_url.clone(),
        model: config.model.clone(),
        api_key,
        timeout: config.request_timeout(),
    })
    .map_err(|e| anyhow::anyhow!("Failed to create model client: {e}"))?;

    let state_path = config.state_path();
    tokio::fs::create_dir_all(&state_path).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to create state directory: {e}\n\nPath: {}",
            state_path.display()
        )
    })?;
    let learning = LearningStore::new(
        Arc::new(JsonFileBackend::new(state_path.clone())),
        config.recent_misconceptions,
    );

    print_config(&config, &state_path);

    let addr: SocketAddr = ([127, 0, 0, 1], config.port).into();
    let app_state = AppState::new(config, Arc::new(model), Arc::new(learning));
    let router = create_router(app_state);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!();
    println!("Erudite backend running on http://{addr}");
    print_endpoints();
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;

    println!("Server stopped");
    Ok(())
}

/// Resolves when Ctrl+C is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    tracing::info!("Received Ctrl+C, shutting down");
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

/// Prints the loaded configuration.
fn print_config(config: &Config, state_path: &Path) {
    println!("Configuration loaded:");
    println!("  Model: {}", config.model);
    println!("  Request timeout: {}s", config.request_timeout_secs);
    println!("  Default difficulty: {}", config.default_difficulty);
    println!("  Max document chars: {}", config.max_document_chars);
    println!("  State directory: {}", state_path.display());
}

/// Prints the served endpoints.
fn print_endpoints() {
    println!("Endpoints:");
    for (method, path) in [
        ("GET", "/api/health"),
        ("POST", "/api/chat"),
        ("POST", "/api/chat/context"),
        ("POST", "/api/concept-map"),
        ("POST", "/api/study-plan"),
        ("POST", "/api/revision-sheet"),
        ("POST", "/api/sessions"),
        ("POST", "/api/sessions/:id/turns"),
        ("GET", "/api/learning/:user_id"),
    ] {
        println!("  {method:<6} {path}");
    }
}
