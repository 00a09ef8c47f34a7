// src/lib.rs
// Public library surface for integration tests (and the binary).

pub mod api;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use shuttle_axum::axum::Router;

pub use crate::api::{router, AppState};
pub use crate::config::SyncConfig;
pub use crate::engine::{ColumnView, SyncEngine};

use crate::sync::http::{ReqwestClient, StaticTokens};
use crate::sync::persist::{JsonFileStore, StateStore};

/// Build the production engine: reqwest client, env tokens, optional JSON
/// snapshot store. Restores the last snapshot before returning.
pub async fn build_engine(cfg: SyncConfig) -> Result<Arc<SyncEngine>> {
    let http = Arc::new(ReqwestClient::new(&cfg.fetch)?);
    let tokens = Arc::new(StaticTokens::from_env());
    let store: Option<Arc<dyn StateStore>> = cfg.persist.state_path.clone().map(|p| {
        let store = JsonFileStore::new(p);
        tracing::info!(target: "sync", path = %store.path().display(), "snapshot store");
        Arc::new(store) as Arc<dyn StateStore>
    });

    let engine = SyncEngine::new(cfg, http, tokens, store);
    engine.restore().await.context("restoring sync state")?;
    Ok(engine)
}

/// Full in-process app: API routes plus `/metrics`.
pub fn app(engine: Arc<SyncEngine>) -> Result<Router> {
    let metrics = metrics::Metrics::init(engine.config())?;
    Ok(router(AppState { engine }).merge(metrics.router()))
}
