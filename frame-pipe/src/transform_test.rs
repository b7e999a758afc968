use std::path::Path;

use super::{LineMatchers, PercentMatcher, SuffixMatcher, TransformEvent, TransformRequest, TransformTool};
use crate::framer::ImageFormat;

fn request<'a>(devices: &'a [u32], tile_size: u32) -> TransformRequest<'a> {
    TransformRequest {
        input_dir: Path::new("frames"),
        output_dir: Path::new("out"),
        scale: 4,
        model: "realesrgan-x4plus",
        devices,
        format: ImageFormat::Png,
        tile_size,
    }
}

fn args(tool: &TransformTool, request: &TransformRequest<'_>) -> Vec<String> {
    tool.command(request)
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

// ------------------------------------------------------------------------
// Line matchers
// ------------------------------------------------------------------------

#[test]
fn test_suffix_matcher() {
    let m = SuffixMatcher::new("Successfully!");
    assert!(m.matches("frames/00000001.png -> out/00000001.png done Successfully!"));
    assert!(m.matches("Successfully!  "));
    assert!(!m.matches("Successfully! not at the end"));
}

#[test]
fn test_percent_matcher() {
    let m = PercentMatcher::new();
    assert_eq!(m.capture("12.50%"), Some(12.5));
    assert_eq!(m.capture("99.00"), Some(99.0));
    assert_eq!(m.capture(" 3.25% "), Some(3.25));
    assert_eq!(m.capture("50%"), None);
    assert_eq!(m.capture("progress 12.50%"), None);
    assert_eq!(m.capture("garbage"), None);
}

#[test]
fn test_line_matchers_are_independent() {
    let matchers = LineMatchers::default();
    let mut events = Vec::new();
    for line in ["0.00%", "a.png -> b.png Successfully!", "[0 NVIDIA] queue", "100.00%"] {
        matchers.scan(line, |e| events.push(e));
    }
    assert_eq!(
        events,
        vec![
            TransformEvent::Percent(0.0),
            TransformEvent::FrameCompleted,
            TransformEvent::Percent(100.0),
        ]
    );
}

// ------------------------------------------------------------------------
// Command line
// ------------------------------------------------------------------------

#[test]
fn test_command_arguments() {
    let tool = TransformTool::new("upscayl-bin", "models").with_threads(Some("1:2:2".into()));
    let args = args(&tool, &request(&[0, 1], 256));
    assert_eq!(
        args,
        vec![
            "-i", "frames", "-o", "out", "-s", "4", "-m", "models", "-n", "realesrgan-x4plus",
            "-g", "0,1", "-f", "png", "-t", "256", "-j", "1:2:2",
        ]
    );
}

#[test]
fn test_small_tile_becomes_auto_and_optional_args_dropped() {
    let tool = TransformTool::new("upscayl-bin", "models").with_threads(Some("  ".into()));
    let args = args(&tool, &request(&[], 31));
    assert!(!args.iter().any(|a| a == "-g" || a == "-j"));
    let tile = args.iter().position(|a| a == "-t").map(|i| args[i + 1].clone());
    assert_eq!(tile.as_deref(), Some("0"));
}

// ------------------------------------------------------------------------
// Process
// ------------------------------------------------------------------------

#[cfg(unix)]
mod process {
    use std::{os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::request;
    use crate::{
        process::ToolError,
        transform::{TransformEvent, TransformTool},
    };

    fn script(dir: &std::path::Path, body: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join("transform.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[tokio::test]
    async fn test_run_reports_events() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bin = script(
            dir.path(),
            r#"printf '0.00%%\n' >&2
printf 'a.png -> b.png Successfully!\r50.00%%\n' >&2
printf '\377\376 not utf8\n' >&2
echo 'c.png -> d.png Successfully!' >&2
exit 0"#,
        )?;
        let tool = TransformTool::new(bin, dir.path());

        let mut events = Vec::new();
        tool.run(&request(&[], 0), &CancellationToken::new(), |e| events.push(e))
            .await?;
        assert_eq!(
            events,
            vec![
                TransformEvent::Percent(0.0),
                TransformEvent::FrameCompleted,
                TransformEvent::Percent(50.0),
                TransformEvent::FrameCompleted,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bin = script(dir.path(), "echo 'vkCreateInstance failed' >&2\nexit 255")?;
        let tool = TransformTool::new(bin, dir.path());

        let err = tool
            .run(&request(&[], 0), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            ToolError::Exit { code, stderr, .. } => {
                assert_eq!(code, Some(255));
                assert_eq!(stderr, "vkCreateInstance failed");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_run_cancelled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bin = script(dir.path(), "exec sleep 30")?;
        let tool = TransformTool::new(bin, dir.path());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            tool.run(&request(&[], 0), &cancel, |_| {}),
        )
        .await?
        .unwrap_err();
        assert!(err.is_cancelled());
        Ok(())
    }
}
