//! firewatchd - detection service daemon
//!
//! This daemon:
//! 1. Loads configuration (FIREWATCH_CONFIG plus environment overrides)
//! 2. Loads one detector backend per profile and warms it up
//! 3. Opens the detection log and the credential store
//! 4. Serves the HTTP API until Ctrl-C

use anyhow::{Context, Result};
use std::sync::mpsc;

use firewatch::{
    api::{ApiConfig, ApiServer, ApiState},
    config::FirewatchConfig,
    DetectionLogWriter, Orchestrator, SqliteDetectionLogStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FirewatchConfig::load()?;

    let registry = config.build_registry()?;
    registry.warm_up_all().context("backend warm-up")?;
    let profiles = config.build_profiles(&registry)?;

    let store = SqliteDetectionLogStore::open(&config.db_path)
        .with_context(|| format!("open detection log {}", config.db_path))?;
    let orchestrator = Orchestrator::new(
        config.artifact_store()?,
        DetectionLogWriter::new(store),
        config.frame_sampler()?,
    );
    let verifier = config.build_verifier()?;

    let state = ApiState {
        orchestrator,
        profiles,
        registry,
        verifier,
    };
    let api_handle = ApiServer::new(ApiConfig::from_settings(&config), state).spawn()?;
    log::info!(
        "firewatchd running on {}. log={} staging={} artifacts={} (mounted at {})",
        api_handle.addr,
        config.db_path,
        config.storage.staging_dir.display(),
        config.storage.artifact_dir.display(),
        config.storage.artifact_mount
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
