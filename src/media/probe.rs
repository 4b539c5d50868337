//! Typed view over ffprobe's JSON output.

use serde::Deserialize;

use crate::error::JobError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeData {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub pix_fmt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<i64>,
}

/// Parsed probe result handed to the normalization cache and scheduler.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// Container duration in seconds
    pub duration: f64,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub codec: String,
    pub pix_fmt: String,
    pub width: i64,
    pub height: i64,
    /// Measured average frame rate over the whole stream
    pub avg_fps: f64,
    /// Frame rate the container declares (r_frame_rate). Disagreement with
    /// avg_fps indicates a variable-frame-rate source.
    pub declared_fps: f64,
}

#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl MediaInfo {
    /// Build the typed view from raw ffprobe JSON. The first video stream and
    /// the first audio stream win; other streams are ignored.
    pub fn from_ffprobe(data: FfprobeData) -> Result<Self, JobError> {
        let duration = data
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| JobError::Probe("format.duration missing or unparsable".into()))?;

        let video = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .map(|s| VideoInfo {
                codec: s.codec_name.clone().unwrap_or_default(),
                pix_fmt: s.pix_fmt.clone().unwrap_or_default(),
                width: s.width.unwrap_or(0),
                height: s.height.unwrap_or(0),
                avg_fps: s
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .unwrap_or(0.0),
                declared_fps: s
                    .r_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .unwrap_or(0.0),
            });

        let audio = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .map(|s| AudioInfo {
                codec: s.codec_name.clone().unwrap_or_default(),
                sample_rate: s
                    .sample_rate
                    .as_deref()
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(0),
                channels: s.channels.unwrap_or(0) as u32,
            });

        Ok(MediaInfo {
            duration,
            video,
            audio,
        })
    }
}

/// Parse a frame rate as ffprobe reports it: a rational like "24000/1001" or
/// a plain decimal like "29.97".
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some(slash_pos) = frame_rate_str.find('/') {
        let num_str = &frame_rate_str[..slash_pos];
        let den_str = &frame_rate_str[slash_pos + 1..];
        if let (Ok(num), Ok(den)) = (num_str.parse::<f64>(), den_str.parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }

    frame_rate_str
        .parse::<f64>()
        .ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_fixture() -> FfprobeData {
        serde_json::from_value(json!({
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "pix_fmt": "yuv420p",
                    "width": 1920,
                    "height": 1080,
                    "avg_frame_rate": "24/1",
                    "r_frame_rate": "24/1"
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "sample_rate": "44100",
                    "channels": 2
                }
            ],
            "format": { "duration": "3.254000" }
        }))
        .unwrap()
    }

    #[test]
    fn parses_video_and_audio_streams() {
        let info = MediaInfo::from_ffprobe(probe_fixture()).unwrap();
        assert!((info.duration - 3.254).abs() < 1e-9);

        let video = info.video.unwrap();
        assert_eq!(video.codec, "h264");
        assert_eq!(video.pix_fmt, "yuv420p");
        assert_eq!(video.width, 1920);
        assert_eq!(video.height, 1080);
        assert!((video.avg_fps - 24.0).abs() < 1e-9);
        assert!((video.declared_fps - 24.0).abs() < 1e-9);

        let audio = info.audio.unwrap();
        assert_eq!(audio.codec, "aac");
        assert_eq!(audio.sample_rate, 44100);
        assert_eq!(audio.channels, 2);
    }

    #[test]
    fn audio_only_source_has_no_video() {
        let data: FfprobeData = serde_json::from_value(json!({
            "streams": [
                { "codec_type": "audio", "codec_name": "mp3", "sample_rate": "48000", "channels": 2 }
            ],
            "format": { "duration": "6.0" }
        }))
        .unwrap();

        let info = MediaInfo::from_ffprobe(data).unwrap();
        assert!(info.video.is_none());
        assert!(info.audio.is_some());
    }

    #[test]
    fn missing_duration_is_a_probe_error() {
        let data: FfprobeData = serde_json::from_value(json!({
            "streams": [],
            "format": {}
        }))
        .unwrap();

        let err = MediaInfo::from_ffprobe(data).unwrap_err();
        assert!(matches!(err, JobError::Probe(_)));
    }

    #[test]
    fn parses_rational_frame_rates() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert!((parse_frame_rate("29.97").unwrap() - 29.97).abs() < 1e-9);
    }

    #[test]
    fn rejects_degenerate_frame_rates() {
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("0/1"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
        assert_eq!(parse_frame_rate(""), None);
    }
}
