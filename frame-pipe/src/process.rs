//! External process handling shared by every tool invocation.

use std::{io, process::Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Failure of one external tool step.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {}{}", exit_code(.code), stderr_suffix(.stderr))]
    Exit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{tool} i/o error: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }

    pub(crate) fn io(tool: &str, source: io::Error) -> Self {
        ToolError::Io {
            tool: tool.to_string(),
            source,
        }
    }

    pub(crate) fn cancelled(tool: &str) -> Self {
        ToolError::Cancelled {
            tool: tool.to_string(),
        }
    }
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Owns a running child process and kills it when dropped.
pub struct ProcessGuard {
    name: String,
    child: Child,
}

impl ProcessGuard {
    pub fn spawn(name: &str, command: &mut Command) -> Result<Self, ToolError> {
        command.kill_on_drop(true);
        log::debug!("{}: spawning {:?}", name, command.as_std());
        let child = command.spawn().map_err(|source| ToolError::Spawn {
            tool: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, ToolError> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| self.missing_pipe("stdin"))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, ToolError> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| self.missing_pipe("stdout"))
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr, ToolError> {
        self.child
            .stderr
            .take()
            .ok_or_else(|| self.missing_pipe("stderr"))
    }

    fn missing_pipe(&self, pipe: &str) -> ToolError {
        ToolError::io(
            &self.name,
            io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is not piped", pipe)),
        )
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Starts killing the process if it is still alive.
    pub fn kill(&mut self) {
        if self.is_running() {
            log::debug!("{}: killing pid {:?}", self.name, self.child.id());
            if let Err(e) = self.child.start_kill() {
                log::warn!("{}: kill failed: {}", self.name, e);
            }
        }
    }

    pub async fn wait(&mut self) -> Result<(), ToolError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ToolError::io(&self.name, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Exit {
                tool: self.name.clone(),
                code: status.code(),
                stderr: String::new(),
            })
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs a tool to completion, killing it if `cancel` fires first.
pub async fn run_tool(
    tool: &str,
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<(), ToolError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    log::debug!("{}: running {:?}", tool, command.as_std());

    let output = tokio::select! {
        output = command.output() => output.map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })?,
        _ = cancel.cancelled() => return Err(ToolError::cancelled(tool)),
    };

    if output.status.success() {
        Ok(())
    } else {
        Err(ToolError::Exit {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

/// Last non-empty line of a tool's error output.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[path = "process_test.rs"]
mod process_test;
