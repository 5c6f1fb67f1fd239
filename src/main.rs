use justification_api::{audit, certs, config, handlers};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "justification_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match config::load_config_with_fallback() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let mut provisioned = config.key_names.clone();
    provisioned.push(config.signing_key.clone());
    let backend = certs::create_backend(&config.backend, &provisioned).await?;
    let audit_logger = Arc::new(audit::AuditLogger::new(Arc::new(
        audit::MemoryAuditStorage::new(),
    )));
    let state = handlers::AppState::new(config.clone(), backend, audit_logger);

    // Mint initial primaries before serving.
    if let Err(e) = state.scheduler.run_once().await {
        tracing::warn!("Initial rotation pass incomplete: {}", e);
    }

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(state.scheduler.clone().run(shutdown.clone()));

    let app = handlers::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting justification API on {}", addr);
    tracing::info!("Signing key: {}", config.signing_key);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    scheduler.await?;
    Ok(())
}
