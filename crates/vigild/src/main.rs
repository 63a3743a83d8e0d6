use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vigil_camera::{CameraManager, FrameCallback, SourceKind, V4lBackend};
use vigil_core::{
    CameraStatus, FullFrameDetector, IdentityStore, PatchAnalyzer, RecognitionEngine,
};
use vigil_store::SqliteStore;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env();
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.snapshot_dir)?;

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    store.initialize()?;
    tracing::info!(db = %config.db_path.display(), "store opened");

    let analyzer = Box::new(PatchAnalyzer::new(FullFrameDetector));
    let engine = Arc::new(RecognitionEngine::new(
        store.clone(),
        analyzer,
        config.engine_config(),
    ));

    // An empty identity set is a legitimate (if degraded) start; camera
    // supervision proceeds either way.
    match engine.load_known_faces() {
        Ok(count) => tracing::info!(count, "identity cache loaded"),
        Err(e) => tracing::warn!(error = %e, "initial identity load failed; starting with an empty cache"),
    }

    let frame_engine = Arc::clone(&engine);
    let on_frame: FrameCallback = Arc::new(move |source_id, frame| {
        frame_engine.process_frame(source_id, &frame);
    });

    let backend = Arc::new(V4lBackend::with_resolution(
        config.frame_width,
        config.frame_height,
    ));
    let mut manager = CameraManager::new(backend, store.clone(), on_frame, config.worker_config());

    ensure_default_source(&store)?;

    for (spec, status) in store.fetch_sources()? {
        if status == CameraStatus::Disabled {
            tracing::debug!(source = spec.id, name = %spec.name, "source disabled; skipping");
            continue;
        }
        manager.upsert(spec);
    }

    tracing::info!(active = manager.active_count(), "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");
    manager.stop_all();

    Ok(())
}

/// Ensure at least one enabled source exists: when every configured
/// camera is disabled (or none exist), fall back to the default local
/// device at index 0, re-enabling it if it was disabled.
fn ensure_default_source(store: &SqliteStore) -> Result<()> {
    let sources = store.fetch_sources()?;
    if sources.iter().any(|(_, status)| *status != CameraStatus::Disabled) {
        return Ok(());
    }

    let default_local = sources
        .iter()
        .find(|(spec, _)| spec.kind == SourceKind::LocalDevice && spec.target == "0");

    match default_local {
        Some((spec, _)) => {
            tracing::info!(source = spec.id, "re-enabling default local camera");
            store.set_source_status(spec.id, CameraStatus::Offline)?;
        }
        None => {
            let id = store.add_source("Default local camera", SourceKind::LocalDevice, "0")?;
            tracing::info!(source = id, "registered default local camera");
        }
    }
    Ok(())
}
