use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tts_core::SynthesisEngine;

use tts_server::{backend_loader, config::ServerConfig, serve, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting streaming TTS server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: backend={:?}, device={}, model_source={}, default_voice={}",
        config.backend,
        config.device,
        config.model_source.display(),
        config.default_voice
    );

    let engine = Arc::new(SynthesisEngine::new(config.engine_config()).context("invalid engine configuration")?);

    // Model loading is blocking; nothing is served until it succeeds
    let loader = backend_loader(&config);
    let init_engine = Arc::clone(&engine);
    let ready = tokio::task::spawn_blocking(move || init_engine.initialize(loader.as_ref()))
        .await
        .context("model initialization task failed")?
        .context("TTS model could not be loaded on any device")?;
    info!(
        "Model ready on {} at {} Hz with {} voice(s)",
        ready.device,
        ready.sample_rate,
        ready.voices.len()
    );

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    let (state, shutdown_tx) = AppState::new(engine, config);
    let metrics = Arc::clone(&state.metrics);
    info!("WebSocket server listening on ws://{addr}");

    serve(listener, state, async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    // Give sessions a moment to send their close frames
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while metrics.sessions_active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
