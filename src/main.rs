use axum::{middleware, routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use panier_rs::{
    handlers::{create_api_router, health_check, metrics_handler},
    init_observability,
    observability::{observability_middleware, Metrics},
    repositories::HttpBackend,
    services::{CartService, CartSubscription},
    shutdown_observability, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_environment()?;
    println!("Configuration loaded successfully");

    init_observability(&config.observability)?;

    info!(
        "Starting {} v{}",
        config.observability.service_name, config.observability.service_version
    );
    info!(
        backend = %config.backend.backend_url,
        timeout_seconds = config.backend.request_timeout_seconds,
        "Cart backend configured"
    );

    let metrics = Arc::new(Metrics::new()?);

    let backend = Arc::new(HttpBackend::new(&config.backend)?.with_metrics(metrics.clone()));
    let cart_service = Arc::new(
        CartService::new(
            backend.clone(),
            backend.clone(),
            backend,
            &config.events,
        )
        .with_metrics(metrics.clone()),
    );
    info!("Services initialized successfully");

    tokio::spawn(log_cart_changes(cart_service.on_change_cart()));

    let app = create_app(metrics, cart_service);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn create_app(metrics: Arc<Metrics>, cart_service: Arc<CartService>) -> Router {
    let metrics_for_middleware = metrics.clone();

    Router::new()
        .route("/health/status", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .merge(create_api_router(cart_service))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(move |req, next| {
            observability_middleware(metrics_for_middleware.clone(), req, next)
        }))
}

/// Log every cart change until the service shuts down
async fn log_cart_changes(mut changes: CartSubscription) {
    while let Some(event) = changes.recv().await {
        info!(
            cause = %event.cause.name,
            message = event.cause.message.as_deref().unwrap_or(""),
            items = event.current.total_items(),
            price = %event.current.price,
            "Cart change"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    shutdown_observability().await;
}
