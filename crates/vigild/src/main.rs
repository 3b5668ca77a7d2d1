use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vigil_core::{FaceIndex, OnnxProvider, RecognitionEngine, EMBEDDING_DIM};
use vigil_stream::FfmpegConnector;

mod config;
mod enroll;
mod error;
mod events;
mod gate;
mod http;
mod hub;
mod presence;
mod state;
mod store;
mod worker;
mod workers;

use config::Config;
use enroll::EnrollmentCoordinator;
use gate::AttendanceGate;
use hub::Hub;
use presence::PresenceTracker;
use state::AppState;
use store::Store;
use worker::WorkerContext;
use workers::WorkerManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    // 1. Load configuration
    let config = Config::from_env();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        addr = %config.http_addr,
        threshold = config.confidence_threshold,
        "configuration loaded"
    );
    std::fs::create_dir_all(config.images_dir()).context("create images dir")?;
    std::fs::create_dir_all(config.snapshots_dir()).context("create snapshots dir")?;

    // 2. Open the store
    let store = Store::open(&config.db_path())?;

    // 3. Load the similarity index; a corrupt snapshot starts empty
    let index = match FaceIndex::load(
        EMBEDDING_DIM,
        &config.index_vectors_path(),
        &config.index_slots_path(),
    ) {
        Ok(index) => index,
        Err(err) => {
            tracing::error!(error = %err, "index load failed; starting with an empty index");
            FaceIndex::new(EMBEDDING_DIM)
        }
    };
    let reference_rows = store.count_all_reference_images().await?;
    if reference_rows as usize != index.size() {
        tracing::warn!(
            db_rows = reference_rows,
            index_slots = index.size(),
            "index and store disagree; run `vigil rebuild` to reconcile"
        );
    }
    let index = Arc::new(RwLock::new(index));

    // 4. Load ONNX models (fail-fast if files are missing)
    let detection_threshold = config.recognize_min_quality.min(config.enroll_min_quality);
    let provider: Arc<dyn vigil_core::EmbeddingProvider> = Arc::new(
        OnnxProvider::load(
            &config.scrfd_model_path(),
            &config.arcface_model_path(),
            detection_threshold,
        )
        .context("load face models")?,
    );
    tracing::info!("face models loaded");

    let engine = Arc::new(RecognitionEngine::new(
        provider.clone(),
        index.clone(),
        config.recognize_min_quality,
        config.min_face_area,
        config.confidence_threshold,
    ));

    // 5. Wire up services
    let hub = Arc::new(Hub::new(config.subscriber_queue));
    let (presence, presence_changes) = PresenceTracker::new(config.presence_ttl);
    let gate = AttendanceGate::new(store.clone(), config.attendance_min, config.utc_offset);
    let coordinator = EnrollmentCoordinator::new(store.clone(), index.clone(), provider.clone(), &config);

    let worker_ctx = Arc::new(WorkerContext::new(
        engine.clone(),
        gate.clone(),
        presence.clone(),
        hub.clone(),
        store.clone(),
        Arc::new(FfmpegConnector::new()),
        &config,
    ));
    let workers = WorkerManager::new(worker_ctx, config.max_streams, config.shutdown_grace);

    // 6. Background tasks: eviction sweep and presence aggregator
    let background = CancellationToken::new();
    let sweep = tokio::spawn(presence::run_eviction_sweep(
        presence.clone(),
        config.eviction_period,
        background.clone(),
    ));
    let aggregator = tokio::spawn(presence::run_aggregator(
        store.clone(),
        presence.clone(),
        hub.clone(),
        presence_changes,
        config.refresh_period,
        background.clone(),
    ));

    // 7. Serve
    let http_addr = config.http_addr.clone();
    let state: state::SharedState = Arc::new(AppState {
        config,
        store,
        index,
        provider,
        engine,
        coordinator,
        gate,
        presence,
        hub,
        workers,
    });

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind {http_addr}"))?;
    tracing::info!(addr = %http_addr, "vigild ready");

    axum::serve(listener, http::router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // 8. Drain: stop workers, background tasks, snapshot the index
    state.workers.stop_all().await;
    background.cancel();
    let _ = sweep.await;
    let _ = aggregator.await;

    {
        let index = state.index.read();
        if let Err(err) = index.persist(
            &state.config.index_vectors_path(),
            &state.config.index_slots_path(),
        ) {
            tracing::error!(error = %err, "final index persist failed");
        }
    }

    tracing::info!("vigild stopped");
    Ok(())
}
