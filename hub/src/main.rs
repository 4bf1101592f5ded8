//! Process entrypoint: config/logging bootstrap, the idle-connection
//! reaper, and graceful shutdown — the same `tokio_graceful::Shutdown`
//! shape `server_speak`'s `main` uses, adapted to axum's `serve` instead of
//! a raw `TcpListener::accept` loop (the `axum::serve` + graceful-shutdown
//! future comes from `yahoo_logic::downstream::run`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{info, warn};

use hub::config::Config;
use hub::logging;
use hub::state::AppState;

#[tokio::main]
async fn main() {
    let config = Config::load();
    let _log_guard = logging::init(&config);

    match lib_common::get_process_info() {
        Ok(process_info) => info!(%process_info, "editmash-hub starting"),
        Err(err) => warn!(error = %err, "failed to collect process info"),
    }

    let shutdown_grace = config.shutdown_grace();
    let idle_timeout = config.idle_timeout();
    let state = AppState::new(config);

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn({
        let state = state.clone();
        move |guard| serve(state, idle_timeout, guard)
    });

    match shutdown.shutdown_with_limit(shutdown_grace).await {
        Ok(elapsed) => info!(elapsed_secs = elapsed.as_secs_f64(), "shutdown: graceful"),
        Err(elapsed) => warn!(elapsed_secs = elapsed.as_secs_f64(), "shutdown: forced after grace period"),
    }

    info!("editmash-hub stopped");
}

async fn serve(state: Arc<AppState>, idle_timeout: Duration, shutdown_guard: ShutdownGuard) {
    let listener = match TcpListener::bind(state.config.bind_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %state.config.bind_addr(), error = %err, "failed to bind listener");
            return;
        }
    };
    info!(addr = %state.config.bind_addr(), "editmash-hub listening");

    tokio::spawn(idle_reaper(state.clone(), idle_timeout, shutdown_guard.clone()));

    let app = hub::hub::router(state);
    let shutdown_signal = {
        let shutdown_guard = shutdown_guard.clone();
        async move {
            shutdown_guard.cancelled().await;
            info!("signal received: draining connections");
        }
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
        tracing::error!(error = %err, "server exited with error");
    }

    drop(shutdown_guard);
}

/// Closes connections silent for longer than `idle_timeout`, pinging
/// everyone else first so a connection that is merely quiet (not dead) gets
/// one more round-trip to prove it's alive before being reaped.
async fn idle_reaper(state: Arc<AppState>, idle_timeout: Duration, shutdown_guard: ShutdownGuard) {
    let mut ticker = tokio::time::interval(idle_timeout / 4);
    loop {
        tokio::select! {
            _ = shutdown_guard.cancelled() => break,
            _ = ticker.tick() => {
                let idle = state.registry.idle_connections(idle_timeout, Instant::now()).await;
                for conn_id in &idle {
                    if let Some(entry) = state.registry.get(*conn_id) {
                        info!(conn_id = *conn_id, "closing idle connection");
                        entry.close();
                    }
                }
                for conn_id in state.registry.all_ids() {
                    if idle.contains(&conn_id) {
                        continue;
                    }
                    if let Some(entry) = state.registry.get(conn_id) {
                        entry.ping();
                    }
                }
            }
        }
    }
}
