//! Media file metadata as reported by ffprobe.

use std::{fmt, path::Path, process::Stdio, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::process::Command;

use crate::process::stderr_tail;

/// Codecs that cannot be stream-copied into the side-stream sidecar.
pub const UNSUPPORTED_SIDE_CODECS: &[&str] = &["dvd_subtitle", "bin_data"];

/// Format-level info (corresponds to ffprobe format).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    /// Format name, e.g. "mov,mp4,m4a,3gp,3g2,mj2"
    #[serde(default)]
    pub format_name: String,
    /// Duration in seconds; 0 if unknown.
    #[serde(default, deserialize_with = "de_seconds")]
    pub duration: f64,
    #[serde(default)]
    pub nb_streams: u32,
}

/// Per-stream info (corresponds to ffprobe stream).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    /// Type: "video" | "audio" | "subtitle" etc.
    #[serde(default)]
    pub codec_type: String,
    /// Codec name, e.g. "h264", "aac"
    #[serde(default)]
    pub codec_name: String,
    /// Average frame rate in frames per second; 0 if unknown.
    #[serde(default, deserialize_with = "de_rate")]
    pub avg_frame_rate: f64,
    #[serde(default, deserialize_with = "de_rate")]
    pub r_frame_rate: f64,
    /// Stream duration in seconds; 0 if unknown.
    #[serde(default, deserialize_with = "de_seconds")]
    pub duration: f64,
    /// Frame count if the container reports one.
    #[serde(default, deserialize_with = "de_count")]
    pub nb_frames: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.codec_type == "video"
    }
}

/// Full probe result (format + streams, like ffprobe).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaProbe {
    #[serde(default)]
    pub format: FormatInfo,
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
}

impl MediaProbe {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid ffprobe output")
    }

    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.is_video())
    }

    /// Video stream duration, falling back to the container duration.
    pub fn duration(&self) -> Duration {
        let secs = self
            .video_stream()
            .map(|s| s.duration)
            .filter(|d| *d > 0.0)
            .unwrap_or(self.format.duration);
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }

    pub fn frame_rate(&self) -> f64 {
        self.video_stream()
            .map(|s| s.avg_frame_rate)
            .unwrap_or_default()
    }

    /// `floor(duration * frame rate)`; an estimate for progress only.
    pub fn expected_frames(&self) -> u64 {
        let frames = (self.duration().as_secs_f64() * self.frame_rate()).floor();
        if frames.is_finite() && frames > 0.0 {
            frames as u64
        } else {
            0
        }
    }

    /// Non-video streams that can be copied verbatim.
    pub fn side_streams<'a>(&'a self, excluded: &'a [String]) -> impl Iterator<Item = &'a StreamInfo> {
        self.streams.iter().filter(move |s| {
            !s.is_video() && !excluded.iter().any(|codec| codec == &s.codec_name)
        })
    }
}

impl fmt::Display for MediaProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FORMAT]")?;
        writeln!(f, "format_name={}", self.format.format_name)?;
        writeln!(f, "duration={:.3}", self.format.duration)?;
        writeln!(f, "nb_streams={}", self.format.nb_streams)?;
        writeln!(f, "[/FORMAT]")?;
        for s in &self.streams {
            writeln!(f, "[STREAM]")?;
            writeln!(f, "index={}", s.index)?;
            writeln!(f, "codec_type={}", s.codec_type)?;
            writeln!(f, "codec_name={}", s.codec_name)?;
            if s.is_video() {
                writeln!(f, "avg_frame_rate={:.3}", s.avg_frame_rate)?;
            }
            if s.duration > 0.0 {
                writeln!(f, "duration={:.3}", s.duration)?;
            }
            if let Some(n) = s.nb_frames {
                writeln!(f, "nb_frames={}", n)?;
            }
            if let (Some(w), Some(h)) = (s.width, s.height) {
                writeln!(f, "size={}x{}", w, h)?;
            }
            writeln!(f, "[/STREAM]")?;
        }
        Ok(())
    }
}

/// Runs ffprobe on `path` and parses its JSON report.
pub async fn probe(ffprobe: &Path, path: &Path) -> anyhow::Result<MediaProbe> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {}", ffprobe.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed on {}: {}",
            path.display(),
            stderr_tail(&output.stderr)
        );
    }
    MediaProbe::from_json(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `"num/den"` or a plain number; anything malformed is 0.
pub fn parse_rate(s: &str) -> f64 {
    let s = s.trim();
    let value = match s.find('/') {
        None | Some(0) => s.parse::<f64>().unwrap_or(0.0),
        Some(idx) => {
            let num = s[..idx].trim().parse::<f64>().unwrap_or(0.0);
            let den = s[idx + 1..].trim().parse::<f64>().unwrap_or(0.0);
            if num == 0.0 || den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
    };
    if value.is_finite() { value } else { 0.0 }
}

/// Parses decimal seconds or `H:MM:SS.ffffff`; anything malformed is 0.
pub fn parse_seconds(s: &str) -> f64 {
    let s = s.trim();
    let value = if s.contains(':') {
        s.split(':')
            .try_fold(0.0, |acc, part| part.parse::<f64>().map(|v| acc * 60.0 + v))
            .unwrap_or(0.0)
    } else {
        s.parse::<f64>().unwrap_or(0.0)
    };
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(f64),
    Text(String),
}

fn de_rate<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Number(n)) if n.is_finite() => n,
        Some(Loose::Text(s)) => parse_rate(&s),
        _ => 0.0,
    })
}

fn de_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Number(n)) if n.is_finite() && n > 0.0 => n,
        Some(Loose::Text(s)) => parse_seconds(&s),
        _ => 0.0,
    })
}

fn de_count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Number(n)) if n.is_finite() && n >= 0.0 => Some(n as u64),
        Some(Loose::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
#[path = "probe_test.rs"]
mod probe_test;
