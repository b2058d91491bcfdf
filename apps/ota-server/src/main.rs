use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{error, info};

mod api;
mod app_state;
mod bootstrap;
mod dispatcher;
mod gateway;
mod registry;
mod responses;
mod router;
mod tasks;
mod transfer;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    ota_otel::init();

    let cfg = match bootstrap::config_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let bootstrap::BootstrapOutput {
        state,
        background_tasks,
    } = match bootstrap::build(&cfg).await {
        Ok(out) => out,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let admin_app = router::admin_router(state.clone())
        .layer(tower::limit::ConcurrencyLimitLayer::new(cfg.concurrency_limit));
    let device_app = router::device_router(state.clone());

    let admin_listener = tokio::net::TcpListener::bind(cfg.admin_addr)
        .await
        .expect("bind admin socket");
    let device_listener = tokio::net::TcpListener::bind(cfg.device_addr)
        .await
        .expect("bind device socket");
    info!(admin = %cfg.admin_addr, device = %cfg.device_addr, "listening");

    // Both listeners share one shutdown edge.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut admin_rx = shutdown_rx.clone();
    let admin = axum::serve(
        admin_listener,
        admin_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = admin_rx.changed().await;
    });
    let mut device_rx = shutdown_rx;
    let device = axum::serve(
        device_listener,
        device_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = device_rx.changed().await;
    });

    let (admin_res, device_res) = tokio::join!(admin.into_future(), device.into_future());
    if let Err(err) = admin_res {
        error!("admin server exited with error: {err}");
    }
    if let Err(err) = device_res {
        error!("device server exited with error: {err}");
    }

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
