/*****************************************************************************************
 *
 *  otp-relay – SMS one-time passcode relay
 *  ---------------------------------------
 *
 *  The phone POSTs a code, the browser extension GETs it. Both sides land on
 *  the same channel when they resolve to the same city.
 *
 *****************************************************************************************/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use axum::serve;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

use otp_relay::app;
use otp_relay::config::AppConfig;
use otp_relay::services::broker::RendezvousBroker;
use otp_relay::services::fingerprint::{FreeIpApiResolver, LocationFingerprinter};
use otp_relay::state::AppState;

/// Explicit config path, overriding the lookup next to the executable.
const CONFIG_ENV: &str = "OTP_RELAY_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //
    // ────────────────────────────────────────────────────────
    //  Load configuration
    // ────────────────────────────────────────────────────────
    //
    let config_path = locate_config()?;

    let mut cfg = AppConfig::load_from_file(&config_path)?;
    cfg.apply_env_overrides();
    cfg.validate()?;

    //
    // ────────────────────────────────────────────────────────
    //  Configure logging
    // ────────────────────────────────────────────────────────
    //
    let level = match cfg.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info"  => LevelFilter::INFO,
        "warn"  => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    tracing::info!("Starting otp-relay {}…", cfg.server_version);
    tracing::info!("Loaded config from {}", config_path.display());
    tracing::info!(
        publisher_timeout_ms = cfg.publisher_timeout_ms,
        subscriber_timeout_ms = cfg.subscriber_timeout_ms,
        geo_lookup_url = %cfg.geo_lookup_url,
        trusted_proxies = cfg.trusted_proxies.len(),
        "Rendezvous settings"
    );

    //
    // ────────────────────────────────────────────────────────
    //  Broker and fingerprinter
    // ────────────────────────────────────────────────────────
    //
    let resolver = FreeIpApiResolver::new(cfg.geo_lookup_url.clone(), cfg.geo_lookup_timeout())
        .context("failed to build geolocation client")?;
    let fingerprinter = LocationFingerprinter::new(Arc::new(resolver));
    let broker = Arc::new(RendezvousBroker::new());

    let port = cfg.port;
    let state = AppState::new(cfg, broker, fingerprinter);

    //
    // ────────────────────────────────────────────────────────
    //  Bind server and start listening
    // ────────────────────────────────────────────────────────
    //
    let app = app::build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("Listening on http://{}", addr);

    // Peer addresses are needed to locate clients.
    serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown())
    .await
    .context("server error")?;

    Ok(())
}

/// `$OTP_RELAY_CONFIG`, else config.json next to the executable, else one
/// directory up.
fn locate_config() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    let exe_path = std::env::current_exe().context("cannot get executable path")?;
    let exe_dir = exe_path
        .parent()
        .context("cannot get executable directory")?;

    let beside = exe_dir.join("config.json");
    if beside.exists() {
        return Ok(beside);
    }

    let fallback = exe_dir.join("..").join("config.json");
    if fallback.exists() {
        return Ok(fallback);
    }

    bail!(
        "config.json not found in:\n  {}\n  {}\nCopy config.json to one of these paths or set {}.",
        beside.display(),
        fallback.display(),
        CONFIG_ENV
    )
}

//
// ─────────────────────────────────────────────────────────────
//  Graceful shutdown handler
// ─────────────────────────────────────────────────────────────
//
async fn shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }

    // Pending codes are ephemeral; nothing to flush.
    tracing::warn!("CTRL+C received, shutting down.");
}
