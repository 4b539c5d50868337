//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

/// Runtime configuration for the montage server.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Root directory holding uploads, cache, outputs, bundle and the job table
    pub data_dir: PathBuf,
    /// ffmpeg binary name or path
    pub ffmpeg_bin: String,
    /// ffprobe binary name or path
    pub ffprobe_bin: String,
    /// Rendering engine command name or path
    pub engine_bin: String,
    /// Debounce for job-table writes, in milliseconds
    pub persist_debounce_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            data_dir: PathBuf::from(
                env::var("DATA_DIR").unwrap_or_else(|_| String::from("./data")),
            ),
            ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or_else(|_| String::from("ffmpeg")),
            ffprobe_bin: env::var("FFPROBE_BIN").unwrap_or_else(|_| String::from("ffprobe")),
            engine_bin: env::var("ENGINE_BIN")
                .unwrap_or_else(|_| String::from("montage-engine")),
            persist_debounce_ms: env::var("PERSIST_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn cache_video_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("video")
    }

    pub fn cache_audio_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("audio")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.data_dir.join("bundle")
    }

    pub fn job_table_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    /// Create the on-disk directory skeleton. Safe to call repeatedly.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.upload_dir(),
            self.cache_video_dir(),
            self.cache_audio_dir(),
            self.output_dir(),
            self.bundle_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
