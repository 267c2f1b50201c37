use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod config;
mod embedder;
mod engine;
mod error;
mod index;
mod pipeline;
mod provider;
mod retrieval;
mod routes;
mod server;
mod session;
mod similarity;
mod state;
#[cfg(test)]
mod testutil;
mod types;

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (platform data dir or from env)
    let log_dir = std::env::var("RAG_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("ragserve").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".ragserve-logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ragserve.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Build tracing subscriber with both stdout + file output using layers
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ragserve=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Install panic hook that logs before aborting
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
        error!(target: "ragserve::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    if config.api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY is not set; provider calls will fail until configured");
    }

    info!(
        listen_addr = %config.listen_addr,
        provider_base_url = %config.provider_base_url,
        embedding_model = %config.embedding_model,
        generation_model = %config.generation_model,
        session_ttl_secs = config.session_defaults.session_ttl_secs,
        max_documents = config.session_defaults.max_documents,
        max_file_size_bytes = config.session_defaults.max_file_size_bytes,
        log_dir = %log_dir,
        "ragserve starting"
    );

    let app_state = state::AppState::new(config);

    routes::health::init_shutdown_notify();

    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ragserve listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ragserve shutdown complete");
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

    // Also wait for HTTP-based shutdown request
    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("Received HTTP shutdown request, initiating shutdown"); },
    }

    info!("Shutdown signal received");
}
