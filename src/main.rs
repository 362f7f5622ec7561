use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use enrichment_hub::{config, routes, server, state};

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("ENRICH_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("enrichment-hub").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".enrichment-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "enrichment-hub.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "enrichment_hub=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "enrichment_hub::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::load();
    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, listen_addr = %config.listen_addr, "invalid listen address, exiting");
            std::process::exit(1);
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        chunks_db_path = %config.chunks_db_path,
        embedding_backend_url = %config.embedding_backend_url,
        router_backend_url = %config.router_backend_url,
        log_dir = %log_dir,
        "enrichment hub starting"
    );

    // Failures here are configuration or storage problems discovered before
    // the server ever starts serving traffic (spec §6 exit code 1); a crash
    // once the listener is up is an unrecoverable runtime error (exit code
    // 2) and is handled separately below.
    let app_state = match state::AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "fatal configuration or storage error during startup, exiting");
            std::process::exit(1);
        }
    };

    routes::health::init_shutdown_notify();

    let app = server::create_app(app_state.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listen address, exiting");
            std::process::exit(1);
        }
    };
    info!("enrichment hub listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "unrecoverable runtime error, exiting");
        std::process::exit(2);
    }

    info!("enrichment hub shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("received HTTP shutdown request, initiating shutdown"); },
    }

    info!("shutdown signal received");
}
