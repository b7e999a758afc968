use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use frame_pipe::{MediaTools, TransformTool, probe::UNSUPPORTED_SIDE_CODECS};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "UPSCALE_VIDEO_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "upscale-video.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Upscayl install root; when set, binary and models are derived from it.
    pub upscayl_path: Option<PathBuf>,
    pub transform_binary: PathBuf,
    pub model_dir: PathBuf,
    pub transform_threads: Option<String>,
    pub jpeg_quality: u8,
    pub excluded_codecs: Vec<String>,
    pub progress_interval_ms: u64,
    pub muxer_capacity: usize,
    pub muxer_start_timeout_ms: u64,
    pub bind: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            upscayl_path: None,
            transform_binary: PathBuf::from("upscayl-bin"),
            model_dir: PathBuf::from("models"),
            transform_threads: None,
            jpeg_quality: 2,
            excluded_codecs: UNSUPPORTED_SIDE_CODECS.iter().map(|c| c.to_string()).collect(),
            progress_interval_ms: 1000,
            muxer_capacity: frame_pipe::muxer::DEFAULT_CAPACITY,
            muxer_start_timeout_ms: frame_pipe::muxer::DEFAULT_START_TIMEOUT.as_millis() as u64,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads `path`; a missing or unreadable file falls back to defaults.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Config: {} not found, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("Config: cannot read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: invalid {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// First CLI argument, then `UPSCALE_VIDEO_CONFIG`, then `./upscale-video.json`.
    pub fn default_path() -> PathBuf {
        std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Transform binary and model directory.
    pub fn transform_paths(&self) -> (PathBuf, PathBuf) {
        match &self.upscayl_path {
            Some(root) => {
                let resources = root.join("resources");
                let binary = if cfg!(windows) {
                    "upscayl-bin.exe"
                } else {
                    "upscayl-bin"
                };
                (resources.join("bin").join(binary), resources.join("models"))
            }
            None => (self.transform_binary.clone(), self.model_dir.clone()),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }

    pub fn muxer_start_timeout(&self) -> Duration {
        Duration::from_millis(self.muxer_start_timeout_ms)
    }
}

/// Shared, read-only services handed to the queue and every pipeline.
#[derive(Debug)]
pub struct AppContext {
    pub config: AppConfig,
    pub media: MediaTools,
    pub transform: TransformTool,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let media = MediaTools::new(&config.ffmpeg_path, &config.ffprobe_path)
            .with_jpeg_quality(config.jpeg_quality);
        let (binary, models) = config.transform_paths();
        let transform = TransformTool::new(binary, models)
            .with_threads(config.transform_threads.clone());
        Self {
            config,
            media,
            transform,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
