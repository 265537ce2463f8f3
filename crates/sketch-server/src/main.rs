use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sketch_db::Database;
use sketch_gateway::Hub;
use sketch_gateway::auth::ServiceCredential;
use sketch_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sketch=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // The store is required; failing to open it aborts startup
    let db = Database::open(&config.db_path)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;

    let hub = Hub::new(
        Arc::new(db),
        ServiceCredential::new(config.service_key.clone()),
        config.presence.clone(),
        config.message_history,
    );
    hub.admin_keys.init()?;

    // Presence sweep runs until shutdown
    let shutdown = CancellationToken::new();
    let sweep = tokio::spawn(hub.presence.clone().run_sweep_loop(shutdown.clone()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Sketch server listening on {}", addr);

    let signal_token = shutdown.clone();
    axum::serve(listener, sketch_server::app(hub))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweep.await;
    info!("Sketch server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
