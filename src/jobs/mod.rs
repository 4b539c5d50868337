//! Job records: the canonical description of one render request and its
//! externally visible lifecycle.

pub mod store;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::JobStore;

/// Error text recorded on jobs that were in flight when the server died.
pub const RESTART_FAILURE_REASON: &str = "server restarted before the render completed";

/// Standard message recorded on cancelled jobs regardless of which underlying
/// operation the cancellation interrupted.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

/// BGM gain is clamped to this dB window before conversion to a linear factor.
pub const MIN_GAIN_DB: f64 = -60.0;
pub const MAX_GAIN_DB: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Normalizing,
    Rendering,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active means the single render slot is occupied by this job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Normalizing | JobStatus::Rendering | JobStatus::Cancelling
        )
    }
}

/// Requested export resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportQuality {
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "480p")]
    Sd480,
}

impl ExportQuality {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ExportQuality::Hd1080 => (1920, 1080),
            ExportQuality::Hd720 => (1280, 720),
            ExportQuality::Sd480 => (854, 480),
        }
    }
}

/// One source-video reference: an uploaded file plus its declared duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSlot {
    pub path: PathBuf,
    /// Declared duration in seconds
    pub duration: f64,
    /// Logical asset id, used to prefix derived cache artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

/// Which part of the timeline the background music is anchored against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BgmMode {
    #[default]
    #[serde(rename = "FULL")]
    Full,
    #[serde(rename = "VIDEO1_ONLY")]
    Video1Only,
    #[serde(rename = "VIDEO2_ONLY")]
    Video2Only,
}

/// Background-music specification as submitted by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgmSpec {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    /// How many seconds of music to play
    pub play_length: f64,
    /// Offset into the target window, in seconds
    #[serde(default)]
    pub start_time: f64,
    /// Gain in decibels; takes precedence over `volume`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_db: Option<f64>,
    /// Linear gain factor, accepted as an alternative to `volumeDb`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default)]
    pub mode: BgmMode,
    #[serde(default, rename = "loop")]
    pub looped: bool,
}

impl BgmSpec {
    /// Resolve the requested gain to a linear factor. Decibel values are
    /// clamped to [MIN_GAIN_DB, MAX_GAIN_DB] first.
    pub fn resolved_gain(&self) -> f64 {
        if let Some(db) = self.volume_db {
            return db_to_linear(db);
        }
        self.volume.unwrap_or(1.0).max(0.0)
    }
}

pub fn db_to_linear(db: f64) -> f64 {
    let clamped = db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
    10f64.powf(clamped / 20.0)
}

/// Canonical job record. The Job Store owns the only mutable copy; everything
/// the API hands out is a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub export_quality: ExportQuality,
    pub video1: VideoSlot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video2: Option<VideoSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgm: Option<BgmSpec>,
    pub status: JobStatus,
    /// 0-100, non-decreasing while the job is live
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Partial update merged into a job record. Fields left `None` are untouched,
/// so concurrent writers never clobber each other's fields.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub output_url: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn apply(self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            // Polling clients must never observe progress moving backwards.
            job.progress = job.progress.max(progress.min(100));
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if let Some(url) = self.output_url {
            job.output_url = Some(url);
        }
        if let Some(path) = self.output_path {
            job.output_path = Some(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_fixture() -> Job {
        Job {
            job_id: "j1".into(),
            name: "test".into(),
            export_quality: ExportQuality::Hd1080,
            video1: VideoSlot {
                path: PathBuf::from("/data/uploads/a-clip.mp4"),
                duration: 3.0,
                asset_id: Some("a".into()),
            },
            video2: None,
            bgm: None,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            output_url: None,
            output_path: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn patch_merges_without_clobbering() {
        let mut job = job_fixture();
        JobPatch::progress(40).apply(&mut job);
        assert_eq!(job.progress, 40);
        assert_eq!(job.status, JobStatus::Queued);

        JobPatch::status(JobStatus::Rendering).apply(&mut job);
        assert_eq!(job.progress, 40);
        assert_eq!(job.status, JobStatus::Rendering);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = job_fixture();
        JobPatch::progress(50).apply(&mut job);
        JobPatch::progress(30).apply(&mut job);
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn progress_is_capped_at_100() {
        let mut job = job_fixture();
        JobPatch::progress(250).apply(&mut job);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn db_gain_is_clamped_then_converted() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-9);
        assert!((db_to_linear(-6.0) - 0.501187).abs() < 1e-5);
        // Below the floor, clamps to -60 dB
        assert!((db_to_linear(-120.0) - db_to_linear(-60.0)).abs() < 1e-12);
        // Above the ceiling, clamps to +6 dB
        assert!((db_to_linear(40.0) - db_to_linear(6.0)).abs() < 1e-12);
    }

    #[test]
    fn volume_db_takes_precedence_over_linear_volume() {
        let bgm = BgmSpec {
            path: PathBuf::from("/x.mp3"),
            asset_id: None,
            play_length: 6.0,
            start_time: 0.0,
            volume_db: Some(-14.0),
            volume: Some(0.9),
            mode: BgmMode::Full,
            looped: false,
        };
        assert!((bgm.resolved_gain() - db_to_linear(-14.0)).abs() < 1e-12);
    }

    #[test]
    fn status_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
        assert!(JobStatus::Normalizing.is_active());
        assert!(!JobStatus::Queued.is_active());
    }

    #[test]
    fn wire_format_matches_ui_contract() {
        let json = serde_json::to_value(job_fixture()).unwrap();
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["exportQuality"], "1080p");

        let bgm: BgmSpec = serde_json::from_str(
            r#"{"path":"/m.mp3","playLength":2.0,"startTime":1.0,"volumeDb":-14,"mode":"VIDEO1_ONLY","loop":true}"#,
        )
        .unwrap();
        assert_eq!(bgm.mode, BgmMode::Video1Only);
        assert!(bgm.looped);
        assert!((bgm.start_time - 1.0).abs() < 1e-12);
    }
}
