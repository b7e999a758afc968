use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use frame_pipe::{DecodeOptions, ImageFormat, MediaProbe};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

pub const DEFAULT_CHUNK_SIZE: u32 = 1000;
pub const DEFAULT_SCALE: u32 = 4;
pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

/// Where the final container takes its non-video streams from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum MergeMode {
    /// Extracted sidecar files (side streams + ffmetadata).
    #[default]
    Sidecars,
    /// The original source, optionally limited to some subtitle streams.
    Source { subtitles: Option<Vec<u32>> },
}

/// One video to upscale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleJob {
    pub id: JobId,
    pub source: PathBuf,
    pub working_dir: PathBuf,
    pub output: PathBuf,
    pub probe: MediaProbe,
    pub chunk_size: u32,
    pub scale: u32,
    pub model: String,
    pub devices: Vec<u32>,
    pub tile_size: u32,
    pub image_format: ImageFormat,
    pub interpolate_fps: Option<f64>,
    pub widescreen_crop: Option<f32>,
    pub merge: MergeMode,
    pub delete_working_dir: bool,
    pub status: JobStatus,
    pub elapsed: Option<Duration>,
    pub error: Option<String>,
}

impl UpscaleJob {
    /// Job with default settings; working dir and output sit next to the source.
    pub fn new(source: impl Into<PathBuf>, probe: MediaProbe) -> Self {
        let source = source.into();
        let parent = source.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = file_stem(&source);
        let ext = container_extension(&source);

        Self {
            id: Uuid::new_v4(),
            working_dir: parent.join(format!("{}_Working", stem)),
            output: parent.join(format!("{}_upscaled{}", stem, ext)),
            source,
            probe,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scale: DEFAULT_SCALE,
            model: DEFAULT_MODEL.to_string(),
            devices: Vec::new(),
            tile_size: 0,
            image_format: ImageFormat::default(),
            interpolate_fps: None,
            widescreen_crop: None,
            merge: MergeMode::default(),
            delete_working_dir: true,
            status: JobStatus::Queued,
            elapsed: None,
            error: None,
        }
    }

    pub fn expected_frames(&self) -> u64 {
        self.probe.expected_frames()
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            widescreen_crop: self.widescreen_crop,
        }
    }

    /// Container extension of the source including the dot, `.mkv` if none.
    pub fn container_extension(&self) -> String {
        container_extension(&self.source)
    }

    pub fn layout(&self) -> WorkLayout {
        WorkLayout::new(self)
    }
}

fn container_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".mkv".to_string())
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

/// Paths inside a job's working directory.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    pub root: PathBuf,
    pub frames: PathBuf,
    pub batches: PathBuf,
    pub side_streams: PathBuf,
    pub metadata: PathBuf,
    pub encoded_video: PathBuf,
}

impl WorkLayout {
    fn new(job: &UpscaleJob) -> Self {
        let root = job.working_dir.clone();
        let ext = job.container_extension();
        Self {
            frames: root.join("Frames"),
            batches: root.join("Upscale"),
            side_streams: root.join(format!("Audio{}", ext)),
            metadata: root.join("Metadata.ffmeta"),
            encoded_video: root.join(format!("{}-video{}", file_stem(&job.source), ext)),
            root,
        }
    }

    pub fn new_batch_dir(&self) -> PathBuf {
        self.batches.join(Uuid::new_v4().to_string())
    }
}

/// Compact view of a job for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub source: PathBuf,
    pub output: PathBuf,
    pub status: JobStatus,
    pub expected_frames: u64,
    pub elapsed: Option<Duration>,
    pub error: Option<String>,
}

impl From<&UpscaleJob> for JobSummary {
    fn from(job: &UpscaleJob) -> Self {
        Self {
            id: job.id,
            source: job.source.clone(),
            output: job.output.clone(),
            status: job.status,
            expected_frames: job.expected_frames(),
            elapsed: job.elapsed,
            error: job.error.clone(),
        }
    }
}
