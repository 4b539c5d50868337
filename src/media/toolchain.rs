//! Async wrappers around the external media toolchain (ffmpeg/ffprobe).
//!
//! Each operation spawns one process, captures its output and resolves from
//! the exit status. There are no retries; a toolchain failure is fatal for the
//! enclosing job. A cancellation token may be supplied so a long-running
//! transcode can be killed from outside.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::media::probe::{FfprobeData, MediaInfo};

/// Target normalization profile: everything fed to the rendering engine is
/// constant-frame-rate h264/yuv420p video and uncompressed 48 kHz stereo audio.
pub const TARGET_FPS: f64 = 24.0;
pub const TARGET_VIDEO_CODEC: &str = "h264";
pub const TARGET_PIX_FMT: &str = "yuv420p";
pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const TARGET_CHANNELS: u32 = 2;

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait MediaToolchain: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, JobError>;

    async fn transcode_video(
        &self,
        src: &Path,
        dst: &Path,
        has_audio: bool,
        cancel: &CancellationToken,
    ) -> Result<(), JobError>;

    async fn transcode_audio(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), JobError>;
}

/// The real toolchain, shelling out to configurable ffmpeg/ffprobe binaries.
pub struct FfmpegToolchain {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl FfmpegToolchain {
    pub fn new(ffmpeg_bin: String, ffprobe_bin: String) -> Self {
        Self {
            ffmpeg_bin,
            ffprobe_bin,
        }
    }
}

#[async_trait]
impl MediaToolchain for FfmpegToolchain {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, JobError> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_format")
            .arg("-show_streams")
            .arg("-print_format")
            .arg("json")
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(JobError::Toolchain {
                tool: "ffprobe",
                code: output.status.code().unwrap_or(-1),
                stderr: stderr_tail(String::from_utf8_lossy(&output.stderr).into_owned()),
            });
        }

        let data: FfprobeData = serde_json::from_slice(&output.stdout)
            .map_err(|e| JobError::Probe(format!("{} ({})", e, path.display())))?;
        MediaInfo::from_ffprobe(data)
    }

    async fn transcode_video(
        &self,
        src: &Path,
        dst: &Path,
        has_audio: bool,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(video_transcode_args(src, dst, has_audio));
        run_cancellable(cmd, "ffmpeg", cancel).await
    }

    async fn transcode_audio(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(audio_transcode_args(src, dst));
        run_cancellable(cmd, "ffmpeg", cancel).await
    }
}

/// Arguments that re-encode a video to the constant-frame-rate target profile.
/// `-fps_mode cfr` forces one frame per interval even for variable-frame-rate
/// sources; audio is carried along re-encoded to AAC or stripped entirely.
pub fn video_transcode_args(src: &Path, dst: &Path, has_audio: bool) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        src.display().to_string(),
        "-vf".to_string(),
        format!("fps={TARGET_FPS}"),
        "-fps_mode".to_string(),
        "cfr".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "18".to_string(),
        "-pix_fmt".to_string(),
        TARGET_PIX_FMT.to_string(),
    ];

    if has_audio {
        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-ar".to_string(),
            TARGET_SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            TARGET_CHANNELS.to_string(),
        ]);
    } else {
        args.push("-an".to_string());
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        dst.display().to_string(),
    ]);
    args
}

/// Arguments that decode any audio source to uncompressed fixed-rate PCM.
pub fn audio_transcode_args(src: &Path, dst: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        src.display().to_string(),
        "-vn".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-ar".to_string(),
        TARGET_SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        TARGET_CHANNELS.to_string(),
        dst.display().to_string(),
    ]
}

/// Run a command to completion, racing it against the cancellation token.
/// Cancellation kills the child immediately and reaps it before returning.
async fn run_cancellable(
    mut cmd: Command,
    tool: &'static str,
    cancel: &CancellationToken,
) -> Result<(), JobError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(JobError::Cancelled);
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(JobError::Toolchain {
            tool,
            code: status.code().unwrap_or(-1),
            stderr: stderr_tail(stderr),
        });
    }
    Ok(())
}

/// ffmpeg writes its banner and progress to stderr; only the tail carries the
/// actual failure reason.
fn stderr_tail(stderr: String) -> String {
    const MAX: usize = 2048;
    if stderr.len() <= MAX {
        return stderr.trim_end().to_string();
    }
    let start = stderr.len() - MAX;
    let start = stderr
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(start);
    stderr[start..].trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn video_args_force_cfr_at_target_rate() {
        let args = video_transcode_args(
            &PathBuf::from("/in/clip.mov"),
            &PathBuf::from("/out/clip.mp4"),
            true,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-vf fps=24"));
        assert!(joined.contains("-fps_mode cfr"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-c:a aac"));
        assert_eq!(args.last().unwrap(), "/out/clip.mp4");
    }

    #[test]
    fn video_args_strip_audio_when_source_has_none() {
        let args = video_transcode_args(
            &PathBuf::from("/in/clip.mov"),
            &PathBuf::from("/out/clip.mp4"),
            false,
        );
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.contains(&"aac".to_string()));
    }

    #[test]
    fn audio_args_decode_to_fixed_rate_pcm() {
        let args = audio_transcode_args(
            &PathBuf::from("/in/track.mp3"),
            &PathBuf::from("/out/track.wav"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-acodec pcm_s16le"));
        assert!(joined.contains("-ar 48000"));
        assert!(joined.contains("-ac 2"));
        assert!(args.contains(&"-vn".to_string()));
    }

    #[test]
    fn stderr_tail_keeps_short_output_intact() {
        assert_eq!(stderr_tail("boom\n".to_string()), "boom");
    }

    #[test]
    fn stderr_tail_truncates_long_output_from_the_front() {
        let long = "x".repeat(5000) + "actual error";
        let tail = stderr_tail(long);
        assert!(tail.len() <= 2048);
        assert!(tail.ends_with("actual error"));
    }

    #[tokio::test]
    async fn run_cancellable_reports_exit_code_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'no such codec' >&2; exit 3");
        let cancel = CancellationToken::new();

        let err = run_cancellable(cmd, "ffmpeg", &cancel).await.unwrap_err();
        match err {
            JobError::Toolchain { tool, code, stderr } => {
                assert_eq!(tool, "ffmpeg");
                assert_eq!(code, 3);
                assert!(stderr.contains("no such codec"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_cancellable_kills_child_on_cancel() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = std::time::Instant::now();
        let err = run_cancellable(cmd, "ffmpeg", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed().as_secs() < 5);
    }
}
