//! Column Sync Service: binary entrypoint.
//! Loads configuration, restores state, starts the sync ticker and serves the
//! Axum router.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use column_sync::{app, build_engine, SyncConfig};

/// Enable tracing logs.
/// Activation requires SYNC_LOG=1 or an explicit RUST_LOG.
/// SYNC_LOG_FORMAT=json switches to JSON lines.
fn enable_tracing() {
    let flag = std::env::var("SYNC_LOG").ok().is_some_and(|v| v == "1");
    let has_filter = std::env::var("RUST_LOG").is_ok();
    if !(flag || has_filter) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sync=info,warn"));
    let json = std::env::var("SYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    // Shuttle may already have installed a subscriber.
    let _ = result;
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    enable_tracing();

    let cfg = SyncConfig::load_default()?;
    let engine = build_engine(cfg).await?;
    engine.spawn_ticker();

    let router = app(engine)?;
    Ok(router.into())
}
