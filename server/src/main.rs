//! transcode-server - On-demand HLS transcoding proxy.
//!
//! Exposes arbitrary source video files as adaptive-bitrate HLS streams,
//! launching FFmpeg on demand to produce segments near the requested
//! playhead.

use std::sync::Arc;

use tracing::{error, info};
use transcode_server::api::server::{ApiServer, ApiServerConfig, AppState};
use transcode_server::collaborators::{FfprobeProber, SingleRungArgvBuilderFactory};
use transcode_server::config::AppConfig;
use transcode_server::logging::init_logging;
use transcode_server::registry::SourceRegistry;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let (logging_config, _guard) = init_logging(&log_dir)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    logging_config.start_retention_cleanup(tokio_util::sync::CancellationToken::new());

    info!("starting transcode-server v{}", env!("CARGO_PKG_VERSION"));

    let app_config = AppConfig::from_env()?;
    std::fs::create_dir_all(&app_config.store_root)?;
    std::fs::create_dir_all(&app_config.source_root)?;

    let registry = SourceRegistry::new(
        app_config.store_root.clone(),
        app_config.ffmpeg_binary.clone(),
        Arc::new(FfprobeProber::new(app_config.ffprobe_binary.clone())),
        Arc::new(SingleRungArgvBuilderFactory::new(
            app_config.engine.segment_duration_secs,
        )),
        app_config.compatible_codec.clone(),
        app_config.engine.clone(),
    );

    let state = AppState::new(registry, app_config.source_root.clone());
    let server = ApiServer::new(ApiServerConfig::from_env_or_default(), state);

    let cancel_token = server.cancel_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = wait_for_sigterm() => {
                info!("received SIGTERM, initiating shutdown...");
            }
        }
        cancel_token.cancel();
    });

    info!("transcode-server started successfully");

    if let Err(e) = server.run().await {
        error!("API server error: {e}");
    }

    info!("transcode-server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// Wait for SIGTERM signal (Windows - uses ctrl_c as fallback).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
