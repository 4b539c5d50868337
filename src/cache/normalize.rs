//! Content-addressed normalization cache.
//!
//! Every video handed to the rendering engine must be constant-frame-rate at
//! the target profile, and every audio track must be uncompressed fixed-rate
//! PCM. Derived artifacts are keyed by a hash of the source bytes, so the
//! same source re-used across jobs (even under a different asset id) is
//! re-encoded exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::sanitize_asset_id;
use crate::error::JobError;
use crate::media::probe::VideoInfo;
use crate::media::toolchain::{
    MediaToolchain, TARGET_FPS, TARGET_PIX_FMT, TARGET_VIDEO_CODEC,
};

/// Tolerance for frame-rate equality; probed rational rates round unevenly.
pub const FPS_EPSILON: f64 = 0.05;

const VIDEO_PROFILE_TAG: &str = "cfr24";
const AUDIO_PROFILE_TAG: &str = "pcm48";

pub struct NormalizationCache {
    toolchain: Arc<dyn MediaToolchain>,
    video_dir: PathBuf,
    audio_dir: PathBuf,
}

impl NormalizationCache {
    pub fn new(toolchain: Arc<dyn MediaToolchain>, video_dir: PathBuf, audio_dir: PathBuf) -> Self {
        Self {
            toolchain,
            video_dir,
            audio_dir,
        }
    }

    /// Resolve a source video to a path the rendering engine can consume.
    ///
    /// Sources already at the target profile are returned unchanged -- the
    /// zero-cost path. Everything else is re-encoded into the cache, keyed by
    /// content hash so the lookup is independent of the asset id wrapper.
    pub async fn normalize_video(
        &self,
        asset_id: &str,
        src: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let info = self.toolchain.probe(src).await?;
        let video = info
            .video
            .as_ref()
            .ok_or_else(|| JobError::Input(format!("{} has no video stream", src.display())))?;

        if matches_target_profile(video) {
            debug!("{} already at target profile, skipping re-encode", src.display());
            return Ok(src.to_path_buf());
        }

        let hash = hash_file(src).await?;
        let suffix = format!("-{}-{}.mp4", &hash[..16], VIDEO_PROFILE_TAG);

        if let Some(hit) = find_cached(&self.video_dir, &suffix) {
            debug!("normalization cache hit for {}", src.display());
            return Ok(hit);
        }

        let dst = self
            .video_dir
            .join(format!("{}{}", sanitize_asset_id(asset_id), suffix));
        info!("normalizing video {} -> {}", src.display(), dst.display());

        let part = part_path(&dst);
        match self
            .toolchain
            .transcode_video(src, &part, info.audio.is_some(), cancel)
            .await
        {
            Ok(()) => {
                tokio::fs::rename(&part, &dst).await?;
                Ok(dst)
            }
            Err(e) => {
                // Never leave a half-written file under a name that would be
                // served as a valid cache hit.
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    /// Resolve a source audio track to uncompressed fixed-rate PCM.
    ///
    /// There is no fast path: the engine needs this exact format for
    /// frame-accurate mixing, so every distinct source is decoded once and
    /// cached by content hash.
    pub async fn normalize_audio(
        &self,
        asset_id: &str,
        src: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let hash = hash_file(src).await?;
        let suffix = format!("-{}-{}.wav", &hash[..16], AUDIO_PROFILE_TAG);

        if let Some(hit) = find_cached(&self.audio_dir, &suffix) {
            debug!("normalization cache hit for {}", src.display());
            return Ok(hit);
        }

        let dst = self
            .audio_dir
            .join(format!("{}{}", sanitize_asset_id(asset_id), suffix));
        info!("normalizing audio {} -> {}", src.display(), dst.display());

        let part = part_path(&dst);
        match self.toolchain.transcode_audio(src, &part, cancel).await {
            Ok(()) => {
                tokio::fs::rename(&part, &dst).await?;
                Ok(dst)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

/// A video needs no re-encode when codec and pixel format already match and
/// the measured frame rate sits at the target within tolerance. The declared
/// rate must agree with the measured one: a variable-frame-rate source can
/// declare 24 fps while actually drifting, and the engine cannot sequence
/// those frames accurately.
pub fn matches_target_profile(video: &VideoInfo) -> bool {
    video.codec == TARGET_VIDEO_CODEC
        && video.pix_fmt == TARGET_PIX_FMT
        && (video.avg_fps - TARGET_FPS).abs() <= FPS_EPSILON
        && (video.declared_fps - video.avg_fps).abs() <= FPS_EPSILON
}

/// Sha256 over the source bytes, streamed in chunks.
pub async fn hash_file(path: &Path) -> Result<String, JobError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Look up a cached artifact by its content-hash suffix, ignoring whatever
/// asset-id prefix it was first written under.
fn find_cached(dir: &Path, suffix: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(suffix) {
            return Some(entry.path());
        }
    }
    None
}

/// Transcodes write to `<name>.part` and rename into place on success.
fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dst.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::probe::{AudioInfo, MediaInfo};
    use crate::media::toolchain::MockMediaToolchain;
    use tempfile::tempdir;

    fn video_info(codec: &str, pix_fmt: &str, avg_fps: f64, declared_fps: f64) -> MediaInfo {
        MediaInfo {
            duration: 3.0,
            video: Some(VideoInfo {
                codec: codec.to_string(),
                pix_fmt: pix_fmt.to_string(),
                width: 1920,
                height: 1080,
                avg_fps,
                declared_fps,
            }),
            audio: Some(AudioInfo {
                codec: "aac".to_string(),
                sample_rate: 44_100,
                channels: 2,
            }),
        }
    }

    fn cache_with(toolchain: MockMediaToolchain, root: &Path) -> NormalizationCache {
        let video_dir = root.join("video");
        let audio_dir = root.join("audio");
        std::fs::create_dir_all(&video_dir).unwrap();
        std::fs::create_dir_all(&audio_dir).unwrap();
        NormalizationCache::new(Arc::new(toolchain), video_dir, audio_dir)
    }

    #[test]
    fn target_profile_check_uses_epsilon() {
        // 24000/1001 is not 24 fps; 23.98 is out of tolerance
        assert!(!matches_target_profile(
            video_info("h264", "yuv420p", 23.976, 23.976).video.as_ref().unwrap()
        ));
        // Rounding within epsilon passes
        assert!(matches_target_profile(
            video_info("h264", "yuv420p", 24.01, 24.0).video.as_ref().unwrap()
        ));
        // Wrong codec or pixel format always re-encodes
        assert!(!matches_target_profile(
            video_info("hevc", "yuv420p", 24.0, 24.0).video.as_ref().unwrap()
        ));
        assert!(!matches_target_profile(
            video_info("h264", "yuv420p10le", 24.0, 24.0).video.as_ref().unwrap()
        ));
    }

    #[test]
    fn vfr_sources_fail_the_fast_path() {
        // Declared 24 but measured 30: declared/average disagreement means VFR
        assert!(!matches_target_profile(
            video_info("h264", "yuv420p", 24.0, 30.0).video.as_ref().unwrap()
        ));
    }

    #[tokio::test]
    async fn conforming_source_returns_unchanged_with_zero_transcodes() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("a-clip.mp4");
        std::fs::write(&src, b"conforming source bytes").unwrap();

        let mut toolchain = MockMediaToolchain::new();
        toolchain
            .expect_probe()
            .times(1)
            .returning(|_| Box::pin(async { Ok(video_info("h264", "yuv420p", 24.0, 24.0)) }));
        toolchain.expect_transcode_video().times(0);

        let cache = cache_with(toolchain, tmp.path());
        let resolved = cache
            .normalize_video("a", &src, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved, src);
    }

    #[tokio::test]
    async fn non_conforming_source_is_encoded_once_then_cached() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("a-clip.mov");
        std::fs::write(&src, b"same source bytes").unwrap();

        let mut toolchain = MockMediaToolchain::new();
        toolchain
            .expect_probe()
            .times(2)
            .returning(|_| Box::pin(async { Ok(video_info("prores", "yuv422p", 29.97, 29.97)) }));
        // Exactly one transcode across both calls: the second is a cache hit.
        toolchain
            .expect_transcode_video()
            .times(1)
            .returning(|_, dst, _, _| {
                std::fs::write(dst, b"normalized output").unwrap();
                Box::pin(async { Ok(()) })
            });

        let cache = cache_with(toolchain, tmp.path());
        let cancel = CancellationToken::new();

        let first = cache.normalize_video("asset-a", &src, &cancel).await.unwrap();
        // Different asset id, same bytes: hash lookup must still hit.
        let second = cache.normalize_video("asset-b", &src, &cancel).await.unwrap();

        assert_eq!(first, second);
        assert!(first.exists());
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("asset-a-"));
    }

    #[tokio::test]
    async fn failed_transcode_leaves_no_artifact_behind() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("bad.mov");
        std::fs::write(&src, b"doomed bytes").unwrap();

        let mut toolchain = MockMediaToolchain::new();
        toolchain
            .expect_probe()
            .returning(|_| Box::pin(async { Ok(video_info("prores", "yuv422p", 30.0, 30.0)) }));
        toolchain
            .expect_transcode_video()
            .times(1)
            .returning(|_, dst, _, _| {
                // Simulate a tool dying after writing part of the file
                std::fs::write(dst, b"half-written").unwrap();
                Box::pin(async {
                    Err(JobError::Toolchain {
                        tool: "ffmpeg",
                        code: 1,
                        stderr: "Invalid data found".into(),
                    })
                })
            });

        let cache = cache_with(toolchain, tmp.path());
        let err = cache
            .normalize_video("bad", &src, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Toolchain { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("video"))
            .unwrap()
            .flatten()
            .collect();
        assert!(leftovers.is_empty(), "cache dir not empty: {leftovers:?}");
    }

    #[tokio::test]
    async fn audio_always_re_encodes_but_caches_by_hash() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("track.wav");
        std::fs::write(&src, b"already-pcm bytes").unwrap();

        let mut toolchain = MockMediaToolchain::new();
        // No probe, no fast path: audio goes straight to the hash key.
        toolchain.expect_probe().times(0);
        toolchain
            .expect_transcode_audio()
            .times(1)
            .returning(|_, dst, _| {
                std::fs::write(dst, b"pcm output").unwrap();
                Box::pin(async { Ok(()) })
            });

        let cache = cache_with(toolchain, tmp.path());
        let cancel = CancellationToken::new();

        let first = cache.normalize_audio("bgm", &src, &cancel).await.unwrap();
        let second = cache.normalize_audio("bgm", &src, &cancel).await.unwrap();
        assert_eq!(first, second);
        assert!(first.to_string_lossy().ends_with(".wav"));
    }

    #[tokio::test]
    async fn same_hash_different_content_kind_do_not_collide() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("clip.mov");
        std::fs::write(&src, b"shared bytes").unwrap();

        let mut toolchain = MockMediaToolchain::new();
        toolchain
            .expect_probe()
            .returning(|_| Box::pin(async { Ok(video_info("prores", "yuv422p", 30.0, 30.0)) }));
        toolchain
            .expect_transcode_video()
            .times(1)
            .returning(|_, dst, _, _| {
                std::fs::write(dst, b"v").unwrap();
                Box::pin(async { Ok(()) })
            });
        toolchain
            .expect_transcode_audio()
            .times(1)
            .returning(|_, dst, _| {
                std::fs::write(dst, b"a").unwrap();
                Box::pin(async { Ok(()) })
            });

        let cache = cache_with(toolchain, tmp.path());
        let cancel = CancellationToken::new();

        // The same source bytes normalized as video and as audio produce two
        // distinct artifacts under their own profile tags.
        let video = cache.normalize_video("x", &src, &cancel).await.unwrap();
        let audio = cache.normalize_audio("x", &src, &cancel).await.unwrap();
        assert_ne!(video, audio);
    }

    #[tokio::test]
    async fn hashes_are_stable_and_content_addressed() {
        let tmp = tempdir().unwrap();
        let a = tmp.path().join("a.bin");
        let b = tmp.path().join("b.bin");
        let c = tmp.path().join("c.bin");
        std::fs::write(&a, b"identical").unwrap();
        std::fs::write(&b, b"identical").unwrap();
        std::fs::write(&c, b"different").unwrap();

        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
        assert_ne!(hash_file(&a).await.unwrap(), hash_file(&c).await.unwrap());
    }
}
