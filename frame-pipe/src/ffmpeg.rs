//! ffmpeg invocations: frame decode/encode pipes and the stream-copy steps
//! around them.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    framer::ImageFormat,
    probe::{self, MediaProbe},
    process::{ToolError, run_tool},
};

const DEFAULT_JPEG_QUALITY: u8 = 2;

/// Options applied to the decode side before frames are written out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Crop to 16:9 keeping the full width; value is the vertical offset (0..=1).
    pub widescreen_crop: Option<f32>,
}

/// How the final container is assembled.
#[derive(Debug, Clone, Copy)]
pub enum MergeSources<'a> {
    /// Side streams and metadata from previously extracted sidecar files.
    Sidecars {
        streams: Option<&'a Path>,
        metadata: Option<&'a Path>,
    },
    /// Side streams, chapters and metadata straight from the source.
    Source {
        source: &'a Path,
        subtitles: Option<&'a [u32]>,
    },
}

/// Paths and settings for the ffmpeg/ffprobe pair.
#[derive(Debug, Clone)]
pub struct MediaTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    jpeg_quality: u8,
}

impl MediaTools {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    /// mjpeg `-q:v`; values outside 1..=31 fall back to the default.
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = if (1..=31).contains(&quality) {
            quality
        } else {
            DEFAULT_JPEG_QUALITY
        };
        self
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub async fn probe(&self, path: &Path) -> anyhow::Result<MediaProbe> {
        probe::probe(&self.ffprobe, path).await
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd
    }

    /// Decoder writing concatenated `format` images to stdout.
    pub fn decode_command(
        &self,
        source: &Path,
        rate: f64,
        format: ImageFormat,
        options: DecodeOptions,
    ) -> Command {
        let mut filters = Vec::new();
        if let Some(offset) = options.widescreen_crop {
            filters.push(format!(
                "crop=iw:iw*9/16:0:(ih-iw*9/16)*{}",
                offset.clamp(0.0, 1.0)
            ));
        }
        filters.push("scale='max(iw,iw*sar)':'max(ih,ih/sar)'".to_string());

        let mut cmd = self.base_command();
        cmd.arg("-i")
            .arg(source)
            .arg("-r")
            .arg(rate.to_string())
            .arg("-vf")
            .arg(filters.join(","));
        if format == ImageFormat::Jpeg {
            cmd.arg("-q:v").arg(self.jpeg_quality.to_string());
        }
        cmd.args(["-c:v", format.pipe_encoder(), "-f", "image2pipe", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    /// Encoder reading concatenated `format` images from stdin.
    pub fn encode_command(
        &self,
        output: &Path,
        rate: f64,
        format: ImageFormat,
        interpolate_fps: Option<f64>,
    ) -> Command {
        let rate = rate.to_string();
        let mut cmd = self.base_command();
        cmd.args(["-y", "-framerate", rate.as_str(), "-f", "image2pipe"])
            .args(["-c:v", format.pipe_decoder(), "-i", "-"]);

        let mut filters = vec!["format=yuv420p".to_string()];
        match interpolate_fps {
            Some(fps) => filters.push(format!("minterpolate='fps={}'", fps)),
            None => {
                cmd.args(["-r", rate.as_str()]);
            }
        }
        filters.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string());

        cmd.arg("-vf")
            .arg(filters.join(","))
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    pub fn copy_streams_command(&self, source: &Path, output: &Path, streams: &[u32]) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-y").arg("-i").arg(source);
        for index in streams {
            cmd.arg("-map").arg(format!("0:{}", index));
        }
        cmd.args(["-c", "copy"]).arg(output);
        cmd
    }

    pub fn metadata_command(&self, source: &Path, output: &Path) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-f", "ffmetadata"])
            .arg(output);
        cmd
    }

    pub fn merge_command(&self, video: &Path, sources: MergeSources<'_>, output: &Path) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-y").arg("-i").arg(video);

        match sources {
            MergeSources::Sidecars { streams, metadata } => {
                let mut next_input = 1;
                if let Some(streams) = streams {
                    cmd.arg("-i").arg(streams);
                }
                if let Some(metadata) = metadata {
                    cmd.arg("-i").arg(metadata);
                }
                cmd.args(["-map", "0:v"]);
                if streams.is_some() {
                    cmd.args(["-map", "1:a?", "-map", "1:s?"]);
                    next_input += 1;
                }
                if metadata.is_some() {
                    let meta = next_input.to_string();
                    cmd.args(["-map_metadata", meta.as_str(), "-map_chapters", meta.as_str()]);
                }
            }
            MergeSources::Source { source, subtitles } => {
                cmd.arg("-i").arg(source);
                cmd.args(["-map", "0:v", "-map", "1:a?"]);
                match subtitles {
                    Some(indices) => {
                        for index in indices {
                            cmd.arg("-map").arg(format!("1:{}", index));
                        }
                    }
                    None => {
                        cmd.args(["-map", "1:s?"]);
                    }
                }
                cmd.args(["-map", "1:t?", "-map_chapters", "1", "-map_metadata", "1"]);
            }
        }

        cmd.args(["-c", "copy"]).arg(output);
        cmd
    }

    /// Copies the given side streams of `source` into `output` without re-encoding.
    pub async fn copy_streams(
        &self,
        source: &Path,
        output: &Path,
        streams: &[u32],
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let cmd = self.copy_streams_command(source, output, streams);
        run_tool("ffmpeg (side streams)", cmd, cancel).await
    }

    /// Dumps chapters and global metadata in ffmetadata format.
    pub async fn extract_metadata(
        &self,
        source: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let cmd = self.metadata_command(source, output);
        run_tool("ffmpeg (metadata)", cmd, cancel).await
    }

    pub async fn merge(
        &self,
        video: &Path,
        sources: MergeSources<'_>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let cmd = self.merge_command(video, sources, output);
        run_tool("ffmpeg (merge)", cmd, cancel).await
    }
}

#[cfg(test)]
#[path = "ffmpeg_test.rs"]
mod ffmpeg_test;
