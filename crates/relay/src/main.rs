use anyhow::Context;
use globechat_relay::{
    app::{build_router, AppState},
    cleanup::spawn_expiry_sweep,
    config::RelayConfig,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_filter)).init();

    let state = AppState::from_config(&config);
    let sweep = spawn_expiry_sweep(
        state.store.clone(),
        state.dispatcher.clone(),
        config.cleanup_interval,
        config.thread_ttl,
    );
    let app = build_router(state, config.cors_origins.as_deref());

    let addr = config.listen_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {addr}"))?;

    info!(
        listen_addr = %addr,
        thread_ttl_secs = config.thread_ttl.as_secs(),
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        "starting relay server"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");

    sweep.abort();
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
