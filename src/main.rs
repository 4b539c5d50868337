use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use montage::api::{self, AppState};
use montage::cache::{CacheAdmin, NormalizationCache};
use montage::config::Config;
use montage::engine::{ProcessEngine, RenderEngine};
use montage::jobs::JobStore;
use montage::media::toolchain::{FfmpegToolchain, MediaToolchain};
use montage::scheduler::RenderScheduler;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt::init();

    config
        .ensure_dirs()
        .expect("Failed to create data directories");

    let store = Arc::new(JobStore::load(config.job_table_path()));
    let _persist_task =
        store.spawn_persist_task(Duration::from_millis(config.persist_debounce_ms));

    let toolchain: Arc<dyn MediaToolchain> = Arc::new(FfmpegToolchain::new(
        config.ffmpeg_bin.clone(),
        config.ffprobe_bin.clone(),
    ));
    let cache = Arc::new(NormalizationCache::new(
        Arc::clone(&toolchain),
        config.cache_video_dir(),
        config.cache_audio_dir(),
    ));
    let engine: Arc<dyn RenderEngine> = Arc::new(ProcessEngine::new(
        config.engine_bin.clone(),
        config.bundle_dir(),
    ));

    // The engine cannot render without its deployable bundle; build it once
    // if the directory is empty.
    let bundle_missing = std::fs::read_dir(config.bundle_dir())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true);
    if bundle_missing {
        info!("preparing rendering-engine bundle");
        if let Err(e) = engine.prepare_bundle().await {
            warn!("bundle preparation failed, renders will fail until it succeeds: {e}");
        }
    }

    let scheduler = RenderScheduler::new(
        Arc::clone(&store),
        cache,
        Arc::clone(&toolchain),
        Arc::clone(&engine),
        config.output_dir(),
    );
    let admin = Arc::new(CacheAdmin::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&engine),
    ));

    let app = api::router(AppState {
        config: config.clone(),
        store,
        scheduler,
        admin,
    });

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    info!("listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
