//! weapon_api - HTTP service for weapon detection
//!
//! This daemon:
//! 1. Loads `ServiceConfig` (WEAPON_CONFIG file plus env overrides)
//! 2. Opens the query history database
//! 3. Serves the detection API until Ctrl-C
//!
//! The detection backend loads on the first processing request.

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use weapon_detect::{
    api::{ApiConfig, ApiServer},
    DetectionPipeline, LazyBackend, ServiceConfig, SqliteHistoryStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;
    let store = SqliteHistoryStore::open(&config.db_path)?;
    let pipeline = DetectionPipeline::new(
        config.detector.clone(),
        LazyBackend::from_settings(config.backend.clone()),
    );

    let api_handle = ApiServer::new(
        ApiConfig::from_service(&config),
        pipeline,
        Box::new(store),
    )
    .spawn()?;
    log::info!(
        "weapon_api running on {} (history {}, backend {:?})",
        api_handle.addr,
        config.db_path,
        config.backend.kind
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("weapon_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
