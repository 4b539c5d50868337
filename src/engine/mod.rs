//! Rendering-engine adapter.
//!
//! The engine itself is an external collaborator: it consumes a resolved
//! composition plan and produces the final MP4. This module owns the process
//! plumbing around it -- serializing the plan, forwarding fractional progress
//! lines, and killing the engine on cancellation. What the engine does with
//! the plan is its own contract.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::JobError;

/// One video clip on the timeline, already normalized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipPlan {
    pub path: PathBuf,
    pub duration: f64,
}

/// Background music, with placement resolved to absolute timeline values.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPlan {
    pub path: PathBuf,
    /// Seconds from the start of the output timeline where the music begins
    pub timeline_offset: f64,
    /// Seconds of music to play
    pub play_length: f64,
    /// Linear gain factor
    pub gain: f64,
    pub looped: bool,
}

/// The fully resolved composition handed to the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionPlan {
    pub job_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video1: ClipPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video2: Option<ClipPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioPlan>,
    pub output: PathBuf,
}

impl CompositionPlan {
    /// Duration of the concatenated video timeline.
    pub fn total_duration(&self) -> f64 {
        self.video1.duration + self.video2.as_ref().map_or(0.0, |v| v.duration)
    }
}

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait RenderEngine: Send + Sync {
    /// Rebuild the engine's deployable bundle. Expensive; runs at startup when
    /// the bundle is missing and after a full cache wipe.
    async fn prepare_bundle(&self) -> Result<(), JobError>;

    /// Render the composition to `plan.output`, emitting fractional progress
    /// (0..=1) into the channel as the engine reports it.
    async fn render(
        &self,
        plan: &CompositionPlan,
        progress: mpsc::Sender<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError>;
}

/// Engine adapter that drives the configured engine command as a child
/// process. Progress arrives as `progress=<fraction>` lines on stdout.
pub struct ProcessEngine {
    engine_bin: String,
    bundle_dir: PathBuf,
    progress_re: Regex,
}

impl ProcessEngine {
    pub fn new(engine_bin: String, bundle_dir: PathBuf) -> Self {
        Self {
            engine_bin,
            bundle_dir,
            progress_re: progress_regex(),
        }
    }
}

#[async_trait]
impl RenderEngine for ProcessEngine {
    async fn prepare_bundle(&self) -> Result<(), JobError> {
        let output = Command::new(&self.engine_bin)
            .arg("bundle")
            .arg("--out")
            .arg(&self.bundle_dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(JobError::Engine(format!(
                "bundle build exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(())
    }

    async fn render(
        &self,
        plan: &CompositionPlan,
        progress: mpsc::Sender<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let plan_path = std::env::temp_dir().join(format!("montage-plan-{}.json", plan.job_id));
        tokio::fs::write(&plan_path, serde_json::to_vec(plan)?).await?;

        let mut cmd = Command::new(&self.engine_bin);
        cmd.arg("render")
            .arg("--bundle")
            .arg(&self.bundle_dir)
            .arg("--plan")
            .arg(&plan_path)
            .arg("--output")
            .arg(&plan.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = self.drive_render(cmd, progress, cancel).await;
        let _ = tokio::fs::remove_file(&plan_path).await;
        result
    }
}

impl ProcessEngine {
    async fn drive_render(
        &self,
        mut cmd: Command,
        progress: mpsc::Sender<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut child = cmd.spawn()?;

        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Engine("engine stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(frac) = parse_progress_line(&self.progress_re, &line) {
                            let _ = progress.send(frac).await;
                        } else {
                            debug!("engine: {}", line);
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(JobError::Cancelled);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(JobError::Engine(format!(
                "render exited with code {}: {}",
                status.code().unwrap_or(-1),
                stderr.trim_end()
            )));
        }
        Ok(())
    }
}

fn progress_regex() -> Regex {
    Regex::new(r"^progress=([0-9]*\.?[0-9]+)\s*$").unwrap()
}

fn parse_progress_line(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line.trim())?;
    let frac: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(frac.clamp(0.0, 1.0))
}
