//! Streams finished frame batches into a running encoder.
//!
//! Batches are directories of sequentially named frame files. They are
//! consumed strictly in the order they were enqueued, each batch's files in
//! filename order, and every batch directory is deleted once written.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    process::{ChildStdin, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    framer::ImageFormat,
    process::{ProcessGuard, ToolError},
};

const ENCODER: &str = "encoder";

pub const DEFAULT_CAPACITY: usize = 4;
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15);

pub struct FrameBatchMuxer {
    encoder: Option<Command>,
    format: ImageFormat,
    capacity: usize,
    start_timeout: Duration,
    cancel: CancellationToken,
    tx: Option<mpsc::Sender<PathBuf>>,
    handle: Option<JoinHandle<anyhow::Result<u64>>>,
}

impl FrameBatchMuxer {
    /// `encoder` must read concatenated `format` frames from a piped stdin.
    pub fn new(encoder: Command, format: ImageFormat, cancel: CancellationToken) -> Self {
        Self {
            encoder: Some(encoder),
            format,
            capacity: DEFAULT_CAPACITY,
            start_timeout: DEFAULT_START_TIMEOUT,
            cancel,
            tx: None,
            handle: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawns the encoder and the batch loop. Calling it again is a no-op.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut command = self
            .encoder
            .take()
            .context("muxer encoder was already consumed")?;

        let mut encoder = ProcessGuard::spawn(ENCODER, &mut command)?;
        let stdin = encoder.take_stdin()?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        let extension = self.format.extension();

        self.handle = Some(tokio::spawn(async move {
            let _ = ready_tx.send(());
            run_loop(encoder, stdin, rx, cancel, extension).await
        }));
        self.tx = Some(tx);

        match tokio::time::timeout(self.start_timeout, ready_rx).await {
            Ok(Ok(())) => {
                log::debug!("Muxer: started");
                Ok(())
            }
            Ok(Err(_)) => Err(anyhow::anyhow!("muxer task exited during startup")),
            Err(_) => {
                self.cancel.cancel();
                Err(anyhow::anyhow!(
                    "muxer did not start within {:?}",
                    self.start_timeout
                ))
            }
        }
    }

    /// Queues a batch directory. Waits only when the muxer is `capacity` batches behind.
    ///
    /// If the loop has already stopped, its terminal error is returned.
    pub async fn enqueue(&mut self, batch: PathBuf) -> anyhow::Result<()> {
        let tx = self.tx.as_ref().context("muxer is not started")?;
        if tx.send(batch).await.is_ok() {
            return Ok(());
        }
        match self.join().await {
            Err(e) => Err(e),
            Ok(_) => Err(anyhow::anyhow!("muxer stopped before all batches were queued")),
        }
    }

    /// Closes the queue, waits for every batch to be written and the encoder to exit.
    ///
    /// Returns the number of frames written.
    pub async fn complete_and_wait(&mut self) -> anyhow::Result<u64> {
        self.tx = None;
        self.join().await
    }

    /// Cancels the loop and waits for the encoder to be torn down.
    pub async fn abort(&mut self) {
        self.cancel.cancel();
        self.tx = None;
        if let Err(e) = self.join().await {
            log::debug!("Muxer: aborted: {:#}", e);
        }
    }

    async fn join(&mut self) -> anyhow::Result<u64> {
        match self.handle.take() {
            Some(handle) => handle.await.context("muxer task panicked")?,
            None => Ok(0),
        }
    }
}

impl Drop for FrameBatchMuxer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
        }
    }
}

async fn run_loop(
    mut encoder: ProcessGuard,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
    extension: &'static str,
) -> anyhow::Result<u64> {
    let mut frames = 0u64;
    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ToolError::cancelled(ENCODER).into()),
                batch = rx.recv() => match batch {
                    Some(dir) => frames += write_batch(&dir, &mut stdin, extension).await?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    // EOF for the encoder
    drop(stdin);

    match result {
        Ok(()) => {
            let exit = tokio::select! {
                exit = encoder.wait() => exit,
                _ = cancel.cancelled() => Err(ToolError::cancelled(ENCODER)),
            };
            exit?;
            log::info!("Muxer: encoder finished after {} frames", frames);
            Ok(frames)
        }
        Err(e) => {
            encoder.kill();
            if !cancel.is_cancelled() {
                log::error!("Muxer: {:#}", e);
            }
            Err(e)
        }
    }
}

async fn write_batch(dir: &Path, stdin: &mut ChildStdin, extension: &str) -> anyhow::Result<u64> {
    let files = list_frames(dir, extension).await?;
    for file in &files {
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read frame {}", file.display()))?;
        stdin
            .write_all(&data)
            .await
            .context("encoder stopped accepting frames")?;
    }
    stdin.flush().await.context("encoder stopped accepting frames")?;

    tokio::fs::remove_dir_all(dir)
        .await
        .with_context(|| format!("failed to delete batch {}", dir.display()))?;
    log::debug!("Muxer: wrote {} frames from {}", files.len(), dir.display());
    Ok(files.len() as u64)
}

/// Frame files in `dir` with the given extension, sorted by name.
pub async fn list_frames(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list batch {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
