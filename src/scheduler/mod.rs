//! Single-slot render scheduler.
//!
//! Owns the FIFO queue, the render-slot busy flag and the per-job
//! cancellation tokens as one mutex-guarded unit, so checking the slot and
//! claiming it are atomic with respect to concurrent submissions. At most one
//! job is ever normalizing or rendering; everything else waits in line.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::NormalizationCache;
use crate::engine::{AudioPlan, ClipPlan, CompositionPlan, RenderEngine};
use crate::error::JobError;
use crate::jobs::{
    BgmMode, BgmSpec, ExportQuality, Job, JobPatch, JobStatus, JobStore, VideoSlot,
    CANCELLED_MESSAGE,
};
use crate::media::toolchain::{MediaToolchain, TARGET_FPS};

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<String>,
    busy: bool,
    /// One cancellation token per in-flight job. Cancelling it is both the
    /// soft checkpoint signal and the hard kill for whatever external process
    /// the job is currently running.
    controllers: HashMap<String, CancellationToken>,
}

pub struct RenderScheduler {
    state: Mutex<SchedulerState>,
    store: Arc<JobStore>,
    cache: Arc<NormalizationCache>,
    toolchain: Arc<dyn MediaToolchain>,
    engine: Arc<dyn RenderEngine>,
    output_dir: PathBuf,
}

impl RenderScheduler {
    pub fn new(
        store: Arc<JobStore>,
        cache: Arc<NormalizationCache>,
        toolchain: Arc<dyn MediaToolchain>,
        engine: Arc<dyn RenderEngine>,
        output_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
            store,
            cache,
            toolchain,
            engine,
            output_dir,
        })
    }

    /// Enqueue a new job and kick the queue. Returns the job id immediately;
    /// rendering happens in the background.
    pub fn submit(
        self: &Arc<Self>,
        name: String,
        export_quality: ExportQuality,
        video1: VideoSlot,
        video2: Option<VideoSlot>,
        bgm: Option<BgmSpec>,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        self.store.create(Job {
            job_id: job_id.clone(),
            name,
            export_quality,
            video1,
            video2,
            bgm,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            output_url: None,
            output_path: None,
            created_at: Utc::now(),
        });

        self.state.lock().unwrap().queue.push_back(job_id.clone());
        info!("job {} queued", job_id);
        self.pump();
        job_id
    }

    /// Start the next queued job if the render slot is free. Slot check and
    /// claim happen under one lock so concurrent submissions can never start
    /// two renders.
    fn pump(self: &Arc<Self>) {
        let (job_id, cancel) = {
            let mut state = self.state.lock().unwrap();
            if state.busy {
                return;
            }
            let Some(job_id) = state.queue.pop_front() else {
                return;
            };
            state.busy = true;
            let cancel = CancellationToken::new();
            state.controllers.insert(job_id.clone(), cancel.clone());
            (job_id, cancel)
        };

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = scheduler.run_job(&job_id, &cancel).await;
            scheduler.finalize(&job_id, &cancel, result);
            {
                let mut state = scheduler.state.lock().unwrap();
                state.busy = false;
                state.controllers.remove(&job_id);
            }
            scheduler.pump();
        });
    }

    async fn run_job(&self, job_id: &str, cancel: &CancellationToken) -> Result<(), JobError> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| JobError::Input(format!("job {job_id} no longer exists")))?;

        self.store.update(
            job_id,
            JobPatch {
                status: Some(JobStatus::Normalizing),
                progress: Some(1),
                ..Default::default()
            },
        );

        let video1 = ClipPlan {
            path: self
                .cache
                .normalize_video(&slot_asset_id(&job.video1), &job.video1.path, cancel)
                .await?,
            duration: job.video1.duration,
        };
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let video2 = match &job.video2 {
            Some(slot) => {
                let path = self
                    .cache
                    .normalize_video(&slot_asset_id(slot), &slot.path, cancel)
                    .await?;
                if cancel.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                Some(ClipPlan {
                    path,
                    duration: slot.duration,
                })
            }
            None => None,
        };

        let audio = match &job.bgm {
            Some(bgm) => {
                let asset_id = bgm
                    .asset_id
                    .clone()
                    .or_else(|| file_stem_of(&bgm.path))
                    .unwrap_or_else(|| "bgm".to_string());
                let path = self.cache.normalize_audio(&asset_id, &bgm.path, cancel).await?;
                if cancel.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                // Source duration decides whether looping is implied.
                let source_duration = self.toolchain.probe(&bgm.path).await?.duration;
                Some(resolve_bgm_plan(
                    bgm,
                    job.video1.duration,
                    job.video2.as_ref().map(|v| v.duration),
                    path,
                    source_duration,
                ))
            }
            None => None,
        };
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        self.store.update(
            job_id,
            JobPatch {
                status: Some(JobStatus::Rendering),
                progress: Some(5),
                ..Default::default()
            },
        );

        let (width, height) = job.export_quality.dimensions();
        let output = self.output_dir.join(format!("{job_id}.mp4"));
        let plan = CompositionPlan {
            job_id: job_id.to_string(),
            width,
            height,
            fps: TARGET_FPS,
            video1,
            video2,
            audio,
            output: output.clone(),
        };

        // Progress flows through a channel into the store; updates are
        // suppressed once cancellation is flagged so pollers never see the
        // bar move on a dying job.
        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<f64>(16);
        let store = Arc::clone(&self.store);
        let progress_job = job_id.to_string();
        let progress_cancel = cancel.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(frac) = progress_rx.recv().await {
                if progress_cancel.is_cancelled() {
                    continue;
                }
                store.update(&progress_job, JobPatch::progress(map_engine_progress(frac)));
            }
        });

        let render_result = self.engine.render(&plan, progress_tx, cancel).await;
        let _ = progress_task.await;
        render_result?;

        self.store.update(
            job_id,
            JobPatch {
                status: Some(JobStatus::Completed),
                progress: Some(100),
                output_url: Some(format!("/api/download/{job_id}")),
                output_path: Some(output),
                ..Default::default()
            },
        );
        info!("job {} completed", job_id);
        Ok(())
    }

    /// Record the terminal state. Any failure observed while the token is
    /// cancelled is the cancellation surfacing through whichever operation
    /// was interrupted, not a real error.
    fn finalize(&self, job_id: &str, cancel: &CancellationToken, result: Result<(), JobError>) {
        let Err(e) = result else { return };

        if cancel.is_cancelled() || e.is_cancelled() {
            info!("job {} cancelled", job_id);
            self.store.update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    error: Some(CANCELLED_MESSAGE.to_string()),
                    ..Default::default()
                },
            );
        } else {
            error!("job {} failed: {}", job_id, e);
            self.store.update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            );
        }
    }

    /// Cancel a job wherever it currently is: still queued, in flight, or
    /// already finished (a no-op).
    pub fn cancel(&self, job_id: &str) -> Result<(), String> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| format!("unknown job {job_id}"))?;

        if job.status.is_terminal() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|id| id == job_id) {
            let _ = state.queue.remove(pos);
            drop(state);
            self.store.update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    error: Some(CANCELLED_MESSAGE.to_string()),
                    ..Default::default()
                },
            );
            info!("job {} cancelled while queued", job_id);
            return Ok(());
        }

        if let Some(token) = state.controllers.get(job_id) {
            token.cancel();
            drop(state);
            self.store.update(job_id, JobPatch::status(JobStatus::Cancelling));
            info!("job {} cancelling", job_id);
            return Ok(());
        }

        // Between finalize and slot release; the terminal write is imminent.
        Ok(())
    }

    /// True while anything is queued or holds the render slot.
    pub fn has_active_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.busy || !state.queue.is_empty() || !state.controllers.is_empty()
    }

    /// Fire every live controller. Running external processes die immediately;
    /// the pipelines observe the tokens at their next checkpoint.
    pub fn abort_all(&self) {
        let state = self.state.lock().unwrap();
        for token in state.controllers.values() {
            token.cancel();
        }
    }

    /// Drop all queued work and controller handles. Used by the cache wipe
    /// after `abort_all`.
    pub fn drop_pending(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.controllers.clear();
    }
}

fn slot_asset_id(slot: &VideoSlot) -> String {
    slot.asset_id
        .clone()
        .or_else(|| file_stem_of(&slot.path))
        .unwrap_or_else(|| "asset".to_string())
}

fn file_stem_of(path: &std::path::Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Map the engine's fractional progress into the 5..=100 band reserved for
/// the rendering phase.
pub fn map_engine_progress(frac: f64) -> u8 {
    let frac = frac.clamp(0.0, 1.0);
    let scaled = (5.0 + frac * 95.0).round();
    scaled.max(5.0) as u8
}

/// Resolve BGM placement against the window its mode selects. Start offset
/// and play length are clamped into the window; looping is explicit or
/// implied when the requested length exceeds what the source can supply.
pub fn resolve_bgm_plan(
    bgm: &BgmSpec,
    video1_duration: f64,
    video2_duration: Option<f64>,
    audio_path: PathBuf,
    source_duration: f64,
) -> AudioPlan {
    let d2 = video2_duration.unwrap_or(0.0);
    let (window_start, window_len) = match bgm.mode {
        BgmMode::Full => (0.0, video1_duration + d2),
        BgmMode::Video1Only => (0.0, video1_duration),
        BgmMode::Video2Only => (video1_duration, d2),
    };

    let start = bgm.start_time.clamp(0.0, window_len);
    let play_length = if bgm.play_length > 0.0 {
        bgm.play_length.min(window_len - start)
    } else {
        window_len - start
    };
    let looped = bgm.looped || play_length > source_duration;

    AudioPlan {
        path: audio_path,
        timeline_offset: window_start + start,
        play_length,
        gain: bgm.resolved_gain(),
        looped,
    }
}
