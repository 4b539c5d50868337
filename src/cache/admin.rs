//! Cache administration: disk accounting, the all-or-nothing wipe, and
//! per-asset purges.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cache::sanitize_asset_id;
use crate::config::Config;
use crate::engine::RenderEngine;
use crate::error::JobError;
use crate::jobs::JobStore;
use crate::scheduler::RenderScheduler;

#[derive(Debug, Error)]
pub enum AdminError {
    /// Active render work blocks the wipe unless forced.
    #[error("{0}")]
    Busy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// File count and byte total for one storage bucket.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Per-bucket disk usage plus the grand total.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub uploads: BucketStats,
    pub cache_video: BucketStats,
    pub cache_audio: BucketStats,
    pub outputs: BucketStats,
    pub bundle: BucketStats,
    pub job_table: BucketStats,
    pub total_bytes: u64,
}

/// Outcome of a cache wipe, reported back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearOutcome {
    pub before: CacheStats,
    pub after: CacheStats,
}

pub struct CacheAdmin {
    config: Config,
    store: Arc<JobStore>,
    scheduler: Arc<RenderScheduler>,
    engine: Arc<dyn RenderEngine>,
}

impl CacheAdmin {
    pub fn new(
        config: Config,
        store: Arc<JobStore>,
        scheduler: Arc<RenderScheduler>,
        engine: Arc<dyn RenderEngine>,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
            engine,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let uploads = dir_stats(&self.config.upload_dir());
        let cache_video = dir_stats(&self.config.cache_video_dir());
        let cache_audio = dir_stats(&self.config.cache_audio_dir());
        let outputs = dir_stats(&self.config.output_dir());
        let bundle = dir_stats(&self.config.bundle_dir());
        let job_table = file_stats(&self.config.job_table_path());

        let total_bytes = [uploads, cache_video, cache_audio, outputs, bundle, job_table]
            .iter()
            .map(|b| b.total_bytes)
            .sum();

        CacheStats {
            uploads,
            cache_video,
            cache_audio,
            outputs,
            bundle,
            job_table,
            total_bytes,
        }
    }

    /// Wipe every derived artifact and all job state, then rebuild the
    /// directory skeleton and the engine bundle. Refuses while render work is
    /// active unless forced; forcing cancels every live controller first.
    pub async fn clear(&self, force: bool) -> Result<ClearOutcome, AdminError> {
        let before = self.stats();

        let busy = self.scheduler.has_active_work() || self.store.has_live_jobs();
        if busy {
            if !force {
                return Err(AdminError::Busy(
                    "render work is active; retry with force to cancel it".to_string(),
                ));
            }
            info!("cache clear forced while work is active, cancelling render jobs");
            self.scheduler.abort_all();
        }

        // Aborted pipelines observe their tokens at the next checkpoint; any
        // late store update lands on a missing id and no-ops.
        self.scheduler.drop_pending();
        self.store.clear();

        for dir in [
            self.config.upload_dir(),
            self.config.cache_video_dir(),
            self.config.cache_audio_dir(),
            self.config.output_dir(),
            self.config.bundle_dir(),
        ] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match tokio::fs::remove_file(self.config.job_table_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.config.ensure_dirs()?;
        self.engine.prepare_bundle().await?;

        let after = self.stats();
        info!(
            "cache cleared: {} bytes -> {} bytes",
            before.total_bytes, after.total_bytes
        );
        Ok(ClearOutcome { before, after })
    }

    /// Delete every upload and cache artifact belonging to one asset,
    /// matched by sanitized-id prefix. Unrelated files are untouched and
    /// missing directories are fine.
    pub fn purge_asset(&self, asset_id: &str) -> std::io::Result<u64> {
        let prefix = format!("{}-", sanitize_asset_id(asset_id));
        let mut removed = 0u64;

        for dir in [
            self.config.upload_dir(),
            self.config.cache_video_dir(),
            self.config.cache_audio_dir(),
        ] {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("purged {} file(s) for asset {}", removed, asset_id);
        } else {
            warn!("purge for asset {} matched nothing", asset_id);
        }
        Ok(removed)
    }
}

/// Recursive walk; a missing directory counts as empty, not an error.
fn dir_stats(path: &Path) -> BucketStats {
    let mut stats = BucketStats::default();
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            stats.file_count += 1;
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    stats
}

fn file_stats(path: &Path) -> BucketStats {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => BucketStats {
            file_count: 1,
            total_bytes: meta.len(),
        },
        _ => BucketStats::default(),
    }
}
