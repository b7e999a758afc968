//! Shell stand-ins for ffmpeg and the transform tool.
//!
//! The fake decoder reads the frame count from the source file and emits
//! that many minimal JPEG frames, then exits 1 or keeps running if the
//! matching switch file exists. The fake encoder copies stdin to its
//! output; every other ffmpeg call writes a placeholder to its last argument.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use frame_pipe::{ImageFormat, MediaProbe, StreamInfo, probe::FormatInfo};
use tempfile::TempDir;

use crate::{
    config::{AppConfig, AppContext},
    job::UpscaleJob,
};

const FAKE_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
dir=$(dirname "$0")
case " $* " in
  *" -i - "*) cat > "$last"; exit 0 ;;
esac
if [ "$last" = "-" ]; then
  src=""; prev=""
  for arg; do
    if [ "$prev" = "-i" ]; then src="$arg"; fi
    prev="$arg"
  done
  echo $$ > "$dir/decoder.pid"
  n=$(cat "$src")
  i=0
  while [ "$i" -lt "$n" ]; do
    printf '\377\330\377\331'
    i=$((i + 1))
  done
  if [ -e "$dir/decoder-fail" ]; then exit 1; fi
  if [ -e "$dir/decoder-hold" ]; then exec sleep 30; fi
  exit 0
fi
echo ok > "$last"
"#;

const FAKE_TRANSFORM_HEAD: &str = r#"#!/bin/sh
in=""; out=""; prev=""
for arg; do
  case "$prev" in
    -i) in="$arg" ;;
    -o) out="$arg" ;;
  esac
  prev="$arg"
done
dir=$(dirname "$0")
count=$(cat "$dir/calls" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$dir/calls"
"#;

const FAKE_TRANSFORM_TAIL: &str = r#"for f in "$in"/*; do
  [ -e "$f" ] || continue
  cp "$f" "$out/"
  echo "0.00%" >&2
  echo "$f -> $out/ Successfully!" >&2
done
"#;

#[derive(Debug, Clone, Copy)]
pub(crate) enum TransformBehaviour {
    Succeed,
    /// Exits with status 3 on the n-th call.
    FailOnCall(u32),
    /// Touches the hang marker and sleeps on the n-th call.
    HangOnCall(u32),
}

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub ctx: Arc<AppContext>,
}

impl Fixture {
    pub fn new(behaviour: TransformBehaviour) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let bin = dir.path().join("bin");
        let models = dir.path().join("models");
        std::fs::create_dir_all(&bin)?;
        std::fs::create_dir_all(&models)?;

        let ffmpeg = bin.join("ffmpeg");
        write_script(&ffmpeg, FAKE_FFMPEG)?;

        let hook = match behaviour {
            TransformBehaviour::Succeed => String::new(),
            TransformBehaviour::FailOnCall(n) => format!(
                "if [ \"$count\" -eq {} ]; then echo \"vkCreateDevice failed\" >&2; exit 3; fi\n",
                n
            ),
            TransformBehaviour::HangOnCall(n) => format!(
                "if [ \"$count\" -eq {} ]; then touch \"$dir/hung\"; exec sleep 30; fi\n",
                n
            ),
        };
        let transform = bin.join("upscayl-bin");
        write_script(
            &transform,
            &format!("{}{}{}", FAKE_TRANSFORM_HEAD, hook, FAKE_TRANSFORM_TAIL),
        )?;

        let config = AppConfig {
            ffmpeg_path: ffmpeg.clone(),
            ffprobe_path: ffmpeg,
            transform_binary: transform,
            model_dir: models,
            progress_interval_ms: 50,
            ..AppConfig::default()
        };
        Ok(Self {
            dir,
            ctx: Arc::new(AppContext::new(config)),
        })
    }

    /// How many times the transform tool has been started.
    pub fn transform_calls(&self) -> u32 {
        std::fs::read_to_string(self.bin().join("calls"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Exists once a hanging transform call is running.
    pub fn hang_marker(&self) -> PathBuf {
        self.bin().join("hung")
    }

    /// The decoder exits 1 after its last frame.
    pub fn fail_decoder(&self) -> std::io::Result<()> {
        std::fs::write(self.bin().join("decoder-fail"), "")
    }

    /// The decoder stays alive after its last frame.
    pub fn hold_decoder(&self) -> std::io::Result<()> {
        std::fs::write(self.bin().join("decoder-hold"), "")
    }

    /// Pid of the most recently started decoder.
    pub fn decoder_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.bin().join("decoder.pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn bin(&self) -> PathBuf {
        self.dir.path().join("bin")
    }

    /// A queued JPEG job over a fake 24 fps source of `frames` frames.
    pub fn job(&self, name: &str, frames: u64, chunk_size: u32) -> anyhow::Result<UpscaleJob> {
        let source = self.dir.path().join(format!("{}.mkv", name));
        std::fs::write(&source, frames.to_string())?;

        let mut job = UpscaleJob::new(source, fake_probe(frames));
        job.chunk_size = chunk_size;
        job.image_format = ImageFormat::Jpeg;
        Ok(job)
    }
}

pub(crate) fn fake_probe(frames: u64) -> MediaProbe {
    let duration = frames as f64 / 24.0;
    MediaProbe {
        format: FormatInfo {
            format_name: "matroska,webm".to_string(),
            duration,
            nb_streams: 2,
        },
        streams: vec![
            StreamInfo {
                index: 0,
                codec_type: "video".to_string(),
                codec_name: "h264".to_string(),
                avg_frame_rate: 24.0,
                r_frame_rate: 24.0,
                duration,
                width: Some(64),
                height: Some(36),
                ..StreamInfo::default()
            },
            StreamInfo {
                index: 1,
                codec_type: "audio".to_string(),
                codec_name: "aac".to_string(),
                ..StreamInfo::default()
            },
        ],
    }
}

fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    std::fs::write(path, body)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

/// True while `pid` names a live (or unreaped) process.
pub(crate) fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Polls `cond` every 20ms for up to five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cond()
}
