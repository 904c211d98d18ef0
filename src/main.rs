use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use webhook_runner::api::{self, AllowList};
use webhook_runner::config::load_config;
use webhook_runner::error::{Result, RunnerError};
use webhook_runner::logging::setup_logging;
use webhook_runner::template::ProcessEnv;
use webhook_runner::{AppState, SharedState};

const DEFAULT_CONFIG_PATH: &str = "webhook_runner.toml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    if let Err(e) = run().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = std::env::var("WEBHOOK_RUNNER_CONFIG")
        .ok()
        .or_else(|| args.next())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    eprintln!("Loading main config from {}", config_path);
    let mut config = load_config(&config_path)?;

    // Held until exit so the file writer flushes.
    let _guard = setup_logging(config.log_dir.clone())?;

    config.load_hook_paths()?;
    for path in args {
        config.add_hook_path(&PathBuf::from(path))?;
    }

    let hooks = config.build_hooks(&ProcessEnv)?;
    info!("Loaded {} hooks", hooks.len());

    let allow = AllowList::new(config.accept_networks()?);
    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| config.listen_address.clone());

    let state: SharedState = Arc::new(AppState::new());
    let app = api::router(hooks, Arc::clone(&state), allow);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| RunnerError::Config(format!("Failed to bind {}: {}", bind_address, e)))?;
    info!("Listening on {}", bind_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let running = state.dispatcher.in_flight();
    if running > 0 {
        info!("Waiting for {} running hooks", running);
    }
    if !state.dispatcher.shutdown(SHUTDOWN_GRACE).await {
        warn!(
            "Hooks still running after {:?}, exiting anyway",
            SHUTDOWN_GRACE
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down");
}
