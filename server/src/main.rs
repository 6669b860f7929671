use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::auth::admin::AdminAuth;
use parley_server::auth::media_token::{MediaTokenIssuer, WebhookVerifier};
use parley_server::config::ServerConfig;
use parley_server::engine::reaper::spawn_reapers;
use parley_server::engine::voice_engine::VoiceEngine;
use parley_server::web::app_state::{AppState, ConnectionTimeouts};
use parley_server::web::rate_limit::{ApiRateLimiters, LIMITER_IDLE, spawn_limiter_sweep};
use parley_server::web::router::build_router;

#[derive(Parser)]
#[command(name = "parley-server", about = "Voice room coordination server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "parley.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    if config.admin.password == "admin123" {
        warn!("admin password is the built-in default; set ADMIN_PASSWORD");
    }

    let issuer = MediaTokenIssuer::new(
        &config.media.api_key,
        &config.media.api_secret,
        &config.media.url,
    )
    .with_ttl(config.token_ttl());
    let admin_auth = AdminAuth::new(&config.admin.password, config.admin.allowed_ips.clone());

    // Create the shared voice engine
    let engine = Arc::new(VoiceEngine::new(
        Arc::new(issuer),
        admin_auth,
        config.engine_settings(),
    ));

    let lobby = engine
        .ensure_room(&config.rooms.lobby_name, config.rooms.lobby_capacity)
        .context("failed to create lobby room")?;
    info!(room = %lobby.name, capacity = lobby.capacity, "lobby ready");

    let cancel = CancellationToken::new();
    let mut reapers = spawn_reapers(engine.clone(), config.reaper_schedule(), cancel.clone());

    let rate_limiters = Arc::new(ApiRateLimiters::default());
    reapers.push(spawn_limiter_sweep(
        rate_limiters.clone(),
        LIMITER_IDLE,
        LIMITER_IDLE,
        cancel.clone(),
    ));

    let app_state = Arc::new(AppState {
        engine,
        webhook_verifier: WebhookVerifier::new(&config.media.api_key, &config.media.api_secret),
        timeouts: ConnectionTimeouts {
            ping_interval: config.connection.ping_interval(),
            idle_timeout: config.connection.idle_timeout(),
            write_timeout: config.connection.write_timeout(),
        },
        rate_limiters,
    });

    let app = build_router(app_state, &config.server.allowed_origins);

    let web_addr = &config.server.web_address;
    let listener = tokio::net::TcpListener::bind(web_addr)
        .await
        .with_context(|| format!("failed to bind web listener on {web_addr}"))?;

    info!(
        address = %web_addr,
        media_url = %config.media.url,
        "Parley server starting"
    );

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        shutdown.cancel();
    })
    .await
    .context("server error")?;

    cancel.cancel();
    for reaper in reapers {
        let _ = reaper.await;
    }
    info!("Parley server stopped");
    Ok(())
}
