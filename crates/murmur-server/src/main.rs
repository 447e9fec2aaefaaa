use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use murmur_api::AppStateInner;
use murmur_api::rate_limit::RateLimiter;
use murmur_api::token::TokenIssuer;
use murmur_db::{Database, DocumentArchive, MessageArchive};
use murmur_gateway::ConnectionHub;
use murmur_server::config::Config;
use murmur_server::socket::{self, SocketState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    // Flushes the file writer on drop; must live until main returns.
    let _log_guard = init_logging(&config)?;
    if config.uses_placeholder_secret() {
        warn!("MURMUR_JWT_SECRET is unset or still a placeholder; set a real secret before deploying");
    }

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let archive: Arc<dyn MessageArchive> = Arc::new(
        DocumentArchive::open(&config.archive_path)
            .with_context(|| format!("opening {}", config.archive_path.display()))?,
    );

    let tokens = TokenIssuer::new(&config.token_config());
    let app_state = AppStateInner::new(db, archive.clone(), tokens);
    let (hub, dispatcher) = ConnectionHub::spawn(archive, config.hub_config());

    let api = murmur_api::router(
        app_state.clone(),
        RateLimiter::per_minute(config.rate_limit_per_minute),
    )
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let realtime = socket::router(SocketState {
        app: app_state,
        hub: hub.clone(),
        require_auth: config.ws_require_auth,
    })
    .layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        let hub = hub.clone();
        async move {
            shutdown_signal().await;
            hub.close_all().await;
            shutdown.cancel();
        }
    });

    let api_listener = TcpListener::bind(config.http_addr).await?;
    info!("Murmur API listening on {}", config.http_addr);
    let socket_listener = TcpListener::bind(config.socket_addr).await?;
    info!(
        "Murmur realtime listening on {} (auth {})",
        config.socket_addr,
        if config.ws_require_auth { "required" } else { "off" }
    );

    let api_server = axum::serve(
        api_listener,
        api.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let socket_server = axum::serve(socket_listener, realtime)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::try_join!(api_server.into_future(), socket_server.into_future())?;

    dispatcher.abort();
    info!("Murmur stopped");
    Ok(())
}

/// Stdout always; `<log_dir>/murmur.log` as well when a log directory is set.
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix("murmur.log")
                .build(dir)
                .with_context(|| format!("opening log file in {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(dir) = &config.log_dir {
        info!("Writing logs to {}", dir.join("murmur.log").display());
    }
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
