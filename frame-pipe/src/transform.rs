//! The per-chunk image transform tool (upscayl-bin compatible).

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::{
    framer::ImageFormat,
    process::{ProcessGuard, ToolError},
};

const TOOL_NAME: &str = "transform";

/// Tiles this small are passed as 0 (automatic).
const MIN_TILE_SIZE: u32 = 32;

/// Signals parsed from the tool's error stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformEvent {
    FrameCompleted,
    Percent(f32),
}

/// Matches lines that end with a fixed phrase.
#[derive(Debug, Clone)]
pub struct SuffixMatcher {
    suffix: &'static str,
}

impl SuffixMatcher {
    pub const fn new(suffix: &'static str) -> Self {
        Self { suffix }
    }

    pub fn matches(&self, line: &str) -> bool {
        line.trim_end().ends_with(self.suffix)
    }
}

/// Captures the percent value of a line like `42.50%`.
#[derive(Debug, Clone)]
pub struct PercentMatcher {
    pattern: Regex,
}

impl Default for PercentMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PercentMatcher {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"^(\d+\.\d+)%?$").expect("static percent pattern"),
        }
    }

    pub fn capture(&self, line: &str) -> Option<f32> {
        self.pattern
            .captures(line.trim())
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Both matchers applied independently to every line.
#[derive(Debug, Clone)]
pub struct LineMatchers {
    completed: SuffixMatcher,
    percent: PercentMatcher,
}

impl Default for LineMatchers {
    fn default() -> Self {
        Self {
            completed: SuffixMatcher::new("Successfully!"),
            percent: PercentMatcher::new(),
        }
    }
}

impl LineMatchers {
    pub fn scan(&self, line: &str, mut emit: impl FnMut(TransformEvent)) {
        if self.completed.matches(line) {
            emit(TransformEvent::FrameCompleted);
        }
        if let Some(percent) = self.percent.capture(line) {
            emit(TransformEvent::Percent(percent));
        }
    }
}

/// One invocation against a staged chunk.
#[derive(Debug, Clone)]
pub struct TransformRequest<'a> {
    pub input_dir: &'a Path,
    pub output_dir: &'a Path,
    pub scale: u32,
    pub model: &'a str,
    pub devices: &'a [u32],
    pub format: ImageFormat,
    pub tile_size: u32,
}

#[derive(Debug, Clone)]
pub struct TransformTool {
    binary: PathBuf,
    model_dir: PathBuf,
    threads: Option<String>,
    matchers: LineMatchers,
}

impl TransformTool {
    pub fn new(binary: impl Into<PathBuf>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model_dir: model_dir.into(),
            threads: None,
            matchers: LineMatchers::default(),
        }
    }

    /// `load:proc:save` thread counts passed as `-j`.
    pub fn with_threads(mut self, threads: Option<String>) -> Self {
        self.threads = threads.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn command(&self, request: &TransformRequest<'_>) -> Command {
        let tile = if request.tile_size < MIN_TILE_SIZE {
            0
        } else {
            request.tile_size
        };

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i")
            .arg(request.input_dir)
            .arg("-o")
            .arg(request.output_dir)
            .arg("-s")
            .arg(request.scale.to_string())
            .arg("-m")
            .arg(&self.model_dir)
            .arg("-n")
            .arg(request.model);
        if !request.devices.is_empty() {
            let devices: Vec<String> = request.devices.iter().map(u32::to_string).collect();
            cmd.arg("-g").arg(devices.join(","));
        }
        cmd.arg("-f")
            .arg(request.format.extension())
            .arg("-t")
            .arg(tile.to_string());
        if let Some(threads) = &self.threads {
            cmd.arg("-j").arg(threads);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Runs the tool until it exits, reporting parsed progress through `on_event`.
    ///
    /// The process is killed if `cancel` fires first.
    pub async fn run(
        &self,
        request: &TransformRequest<'_>,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(TransformEvent),
    ) -> Result<(), ToolError> {
        let mut guard = ProcessGuard::spawn(TOOL_NAME, &mut self.command(request))?;
        let stderr = guard.take_stderr()?;
        let matchers = &self.matchers;

        let run = async {
            let mut segments = BufReader::new(stderr).split(b'\n');
            let mut last_line = String::new();
            while let Some(segment) = segments
                .next_segment()
                .await
                .map_err(|e| ToolError::io(TOOL_NAME, e))?
            {
                let text = String::from_utf8_lossy(&segment);
                for line in text.split('\r').filter(|l| !l.trim().is_empty()) {
                    matchers.scan(line, &mut on_event);
                    last_line = line.trim().to_string();
                }
            }
            match guard.wait().await {
                Err(ToolError::Exit { tool, code, .. }) => Err(ToolError::Exit {
                    tool,
                    code,
                    stderr: last_line,
                }),
                other => other,
            }
        };

        tokio::select! {
            result = run => result,
            _ = cancel.cancelled() => Err(ToolError::cancelled(TOOL_NAME)),
        }
    }
}

#[cfg(test)]
#[path = "transform_test.rs"]
mod transform_test;
