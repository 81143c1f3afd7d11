mod api;
mod auth;
mod config;
mod engine;
mod error;
mod geo;
mod guard;
mod models;
mod observability;
mod protocol;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing_subscriber::EnvFilter;

use crate::protocol::ServerEvent;

const RECONCILE_PERIOD: Duration = Duration::from_secs(300);
const SWEEP_PERIOD: Duration = Duration::from_secs(60);
const STATS_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = store::Store::connect(&config.database_url).await?;

    let http_port = config.http_port;
    let shared_state = Arc::new(state::AppState::new(config, store));

    let app = api::rest::router(shared_state.clone());

    {
        let state = shared_state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(RECONCILE_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine::proximity::run_reconciliation(&state).await;
            }
        });
    }

    {
        let state = shared_state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                state.limiter.sweep();
                state.timers.sweep();
                engine::dispatch::expire_stale_locks(&state).await;
            }
        });
    }

    {
        let state = shared_state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(STATS_PERIOD);
            loop {
                ticker.tick().await;
                let _ = state.stats_tx.send(ServerEvent::DispatchStats {
                    snapshot: state.stats_snapshot(),
                });
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "dispatch server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| error::AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
