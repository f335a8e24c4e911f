//! Avatar speech core entry point
//!
//! Runs one headless avatar session against the configured control channel
//! until Ctrl+C or SIGTERM.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use avatar_app::{init_metrics, AvatarRuntime, Collaborators, ConsoleSpeechEngine, HeadlessPlayer};
use avatar_config::{load_catalog, load_settings, Settings};
use avatar_core::{CloudSpeechProvider, LocalSpeechEngine, StateField};
use avatar_pipeline::HttpCloudTts;
use avatar_transport::WsConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env} > config/default > defaults
    let env = std::env::var("AVATAR_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => {
            // tracing is not up yet
            eprintln!(
                "Loaded configuration (env: {})",
                env.as_deref().unwrap_or("default")
            );
            settings
        }
        Err(e) => {
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&settings);

    tracing::info!("Starting avatar speech core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?settings.environment,
        endpoint = settings.connection.endpoint.as_deref().unwrap_or("<none>"),
        "Configuration loaded"
    );

    if settings.observability.metrics_enabled {
        match init_metrics(settings.observability.metrics_port) {
            Ok(addr) => tracing::info!(%addr, "Prometheus metrics listening"),
            Err(e) => tracing::warn!(error = %e, "Metrics disabled"),
        }
    }

    let catalog = load_catalog(&settings.catalog);
    tracing::info!(clips = catalog.len(), "Catalog ready");

    let cloud: Option<Arc<dyn CloudSpeechProvider>> =
        match HttpCloudTts::new(settings.cloud_tts.clone()) {
            Ok(tts) if tts.is_configured() => Some(Arc::new(tts)),
            Ok(_) => {
                tracing::info!("Cloud speech not configured, using local speech only");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cloud speech client unavailable");
                None
            }
        };
    let local: Arc<dyn LocalSpeechEngine> =
        Arc::new(ConsoleSpeechEngine::new(settings.speech.ms_per_char));

    let runtime = AvatarRuntime::new(
        &settings,
        catalog,
        Collaborators {
            connector: Arc::new(WsConnector::new(
                settings.connection.outbound_buffer,
                CONNECT_TIMEOUT,
            )),
            player: Arc::new(HeadlessPlayer::default()),
            cloud,
            local: Some(local),
        },
    )
    .context("failed to build avatar runtime")?;

    let _speaking = runtime.store().watch(StateField::Speaking, |new, old| {
        tracing::debug!(?old, ?new, "Speaking state changed");
    });

    tracing::info!(session_id = %runtime.session_id(), "Avatar session started");
    runtime.set_avatar_ready(true);
    if settings.connection.endpoint.is_some() {
        runtime.start();
    } else {
        tracing::warn!("No control channel endpoint configured, waiting idle");
    }

    shutdown_signal().await;

    runtime.destroy();
    tracing::info!("Avatar session shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!(
            "avatar_app={level},avatar_pipeline={level},avatar_transport={level},\
             avatar_config={level},avatar_core={level}"
        )
        .into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
