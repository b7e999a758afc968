#![cfg(unix)]

use std::{process::Stdio, time::Duration};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ProcessGuard, ToolError, run_tool, stderr_tail};

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[tokio::test]
async fn test_run_tool_success() {
    let cancel = CancellationToken::new();
    assert!(run_tool("true", sh("exit 0"), &cancel).await.is_ok());
}

#[tokio::test]
async fn test_run_tool_reports_exit_code_and_stderr() {
    let cancel = CancellationToken::new();
    let err = run_tool("failing", sh("echo noise >&2; echo boom >&2; exit 3"), &cancel)
        .await
        .unwrap_err();
    match err {
        ToolError::Exit { tool, code, stderr } => {
            assert_eq!(tool, "failing");
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_run_tool_cancelled() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = run_tool("sleeper", sh("exec sleep 30"), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_run_tool_missing_binary() {
    let cancel = CancellationToken::new();
    let err = run_tool(
        "missing",
        Command::new("/definitely/not/a/binary"),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ToolError::Spawn { .. }));
}

#[tokio::test]
async fn test_guard_kill_stops_process() -> anyhow::Result<()> {
    let mut cmd = sh("exec sleep 30");
    cmd.stdout(Stdio::null());
    let mut guard = ProcessGuard::spawn("sleeper", &mut cmd)?;
    assert!(guard.is_running());

    guard.kill();
    let result = tokio::time::timeout(Duration::from_secs(5), guard.wait()).await?;
    assert!(matches!(result, Err(ToolError::Exit { code: None, .. })));
    Ok(())
}

#[tokio::test]
async fn test_guard_take_unpiped_stream_fails() -> anyhow::Result<()> {
    let mut cmd = sh("exit 0");
    cmd.stdout(Stdio::null());
    let mut guard = ProcessGuard::spawn("quiet", &mut cmd)?;
    assert!(guard.take_stdout().is_err());
    guard.wait().await?;
    Ok(())
}

#[test]
fn test_stderr_tail() {
    assert_eq!(stderr_tail(b"first\nsecond\n\n  "), "second");
    assert_eq!(stderr_tail(b""), "");
}
