use std::sync::Arc;

use order_tracker::api;
use order_tracker::config::Config;
use order_tracker::engine::view_model::TrackingDeps;
use order_tracker::error::AppError;
use order_tracker::services::headless::{
    FixedGeolocation, HeadlessNotifier, LoggingAnalytics, LoggingShare,
};
use order_tracker::services::memory::{demo_order, simulate_order_progress, InMemoryBackend};
use order_tracker::services::{Permission, SystemClock};
use order_tracker::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let backend = Arc::new(InMemoryBackend::new());
    let order = demo_order();
    let order_id = order.id;
    let user_location = order.delivery_address.location.clone();
    backend.insert_order(order);

    let geolocation = match user_location {
        Some(location) => FixedGeolocation::at(location),
        None => FixedGeolocation::with_result(Err(AppError::PositionUnavailable(
            "no demo location configured".to_string(),
        ))),
    };

    let deps = TrackingDeps {
        orders: backend.clone(),
        tracking: backend.clone(),
        analytics: Arc::new(LoggingAnalytics::new()),
        cart: backend.clone(),
        geolocation: Arc::new(geolocation),
        notifier: Arc::new(HeadlessNotifier::new(Permission::Default, Permission::Granted)),
        share: Arc::new(LoggingShare::new()),
        clock: Arc::new(SystemClock),
    };

    let shared_state = Arc::new(AppState::new(deps, config.session_options()));
    let app = api::rest::router(shared_state.clone());

    tokio::spawn(simulate_order_progress(
        backend.clone(),
        order_id,
        config.demo_step,
    ));
    tracing::info!(order_id = %order_id, "demo order seeded");

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.close_all();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
