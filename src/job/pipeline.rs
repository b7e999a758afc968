//! Drives one job: side-stream extraction, the chunked
//! decode → transform → encode loop, and the final merge.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use frame_pipe::{
    FrameBatchMuxer, FrameReader, MergeSources, ProcessGuard, TransformEvent, TransformRequest,
};
use tokio::sync::watch;
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};

use crate::{
    config::AppContext,
    job::{
        error::{ConfigIssue, JobError},
        progress::{JobProgress, Stage},
        types::{MergeMode, UpscaleJob, WorkLayout},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Not an error; the job can be run again.
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: JobOutcome,
    pub elapsed: Duration,
    pub completed_frames: u64,
    pub chunks: u64,
    /// Working directory removal failed; never changes the outcome.
    pub cleanup_error: Option<String>,
}

/// Processes owned by one run; torn down on every exit path.
#[derive(Default)]
struct PipelineSession {
    decoder: Option<ProcessGuard>,
    muxer: Option<FrameBatchMuxer>,
}

impl PipelineSession {
    async fn teardown(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            if decoder.is_running() {
                decoder.kill();
                // reap it so the pid is gone before the run reports back
                if let Err(e) = decoder.wait().await {
                    log::debug!("{}: {}", decoder.name(), e);
                }
            }
        }
        if let Some(mut muxer) = self.muxer.take() {
            if muxer.is_running() {
                log::debug!("Pipeline: aborting muxer");
            }
            muxer.abort().await;
        }
    }
}

/// Sidecar files produced before streaming starts.
#[derive(Debug, Default)]
struct SideFiles {
    streams: Option<PathBuf>,
    metadata: Option<PathBuf>,
}

pub struct PipelineOrchestrator {
    ctx: Arc<AppContext>,
    job: UpscaleJob,
    cancel: CancellationToken,
    pause: Mutex<CancellationToken>,
    paused: watch::Sender<bool>,
    progress: Arc<JobProgress>,
    started: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineOrchestrator {
    /// The job's cancellation is linked to `parent`.
    pub fn new(ctx: Arc<AppContext>, job: UpscaleJob, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let pause = cancel.child_token();
        let (paused, _) = watch::channel(false);
        let progress = Arc::new(JobProgress::new(job.expected_frames()));
        Self {
            ctx,
            job,
            cancel,
            pause: Mutex::new(pause),
            paused,
            progress,
            started: AtomicBool::new(false),
        }
    }

    pub fn job(&self) -> &UpscaleJob {
        &self.job
    }

    pub fn progress(&self) -> &Arc<JobProgress> {
        &self.progress
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stops the running transform; its chunk restarts from scratch on resume.
    pub fn pause(&self) {
        let token = lock(&self.pause);
        if self.is_paused() {
            return;
        }
        log::info!("Pipeline[{}]: pausing", self.job.id);
        self.paused.send_replace(true);
        token.cancel();
    }

    pub fn resume(&self) {
        let mut token = lock(&self.pause);
        if !self.is_paused() {
            return;
        }
        log::info!("Pipeline[{}]: resuming", self.job.id);
        *token = self.cancel.child_token();
        self.paused.send_replace(false);
    }

    fn pause_token(&self) -> CancellationToken {
        lock(&self.pause).clone()
    }

    /// Runs the job to a terminal outcome. Never returns an error; failures
    /// are reported in the outcome.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        if self.started.swap(true, Ordering::Relaxed) {
            log::warn!("Pipeline[{}]: already started", self.job.id);
            return RunReport {
                outcome: JobOutcome::Failed("pipeline already started".to_string()),
                elapsed: Duration::ZERO,
                completed_frames: 0,
                chunks: 0,
                cleanup_error: None,
            };
        }

        log::info!(
            "Pipeline[{}]: starting {} -> {}",
            self.job.id,
            self.job.source.display(),
            self.job.output.display()
        );

        let ticker_cancel = CancellationToken::new();
        let ticker = self
            .progress
            .spawn_ticker(self.ctx.config.progress_interval(), ticker_cancel.clone());

        let mut session = PipelineSession::default();
        let result = self.run_stages(&mut session).await;
        session.teardown().await;

        let outcome = match result {
            Ok(()) => {
                log::info!(
                    "Pipeline[{}]: completed in {:?}",
                    self.job.id,
                    started.elapsed()
                );
                JobOutcome::Completed
            }
            Err(e) if matches!(e, JobError::Cancelled) || self.cancel.is_cancelled() => {
                log::info!("Pipeline[{}]: cancelled", self.job.id);
                JobOutcome::Cancelled
            }
            Err(e) => {
                log::error!("Pipeline[{}]: failed: {:#}", self.job.id, e);
                JobOutcome::Failed(format!("{:#}", e))
            }
        };

        self.progress.set_stage(Stage::CleaningUp);
        let cleanup_error = self.cleanup().await;
        self.progress.set_stage(Stage::Finished);
        ticker_cancel.cancel();
        if let Err(e) = ticker.await {
            log::warn!("Pipeline[{}]: progress ticker failed: {}", self.job.id, e);
        }

        RunReport {
            outcome,
            elapsed: started.elapsed(),
            completed_frames: self.progress.completed_frames(),
            chunks: self.progress.chunks(),
            cleanup_error,
        }
    }

    async fn run_stages(&self, session: &mut PipelineSession) -> Result<(), JobError> {
        let layout = self.prepare().await?;
        let side = self.extract_side_streams(&layout).await?;
        self.stream_frames(session, &layout).await?;
        self.merge(&layout, &side).await
    }

    async fn prepare(&self) -> Result<WorkLayout, JobError> {
        self.progress.set_stage(Stage::Starting);
        let job = &self.job;

        if !job.source.is_file() {
            return Err(ConfigIssue::InputMissing(job.source.clone()).into());
        }
        if job.chunk_size == 0 {
            return Err(ConfigIssue::InvalidChunkSize.into());
        }
        if job.output.as_os_str().is_empty() {
            return Err(ConfigIssue::OutputPathEmpty.into());
        }
        if job.probe.video_stream().is_none() {
            return Err(ConfigIssue::NoVideoStream.into());
        }
        if job.probe.frame_rate() <= 0.0 {
            return Err(ConfigIssue::UnknownFrameRate.into());
        }

        let transform = &self.ctx.transform;
        if !transform.binary().is_file() {
            return Err(ConfigIssue::TransformBinaryMissing(transform.binary().to_path_buf()).into());
        }
        if !transform.model_dir().is_dir() {
            return Err(ConfigIssue::ModelDirMissing(transform.model_dir().to_path_buf()).into());
        }

        let layout = job.layout();
        tokio::fs::create_dir_all(&layout.root)
            .await
            .map_err(|source| ConfigIssue::WorkingDir {
                path: layout.root.clone(),
                source,
            })?;
        // leftovers of an earlier cancelled run are never resumed
        for dir in [&layout.frames, &layout.batches] {
            reset_dir(dir).await.map_err(|source| ConfigIssue::WorkingDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(layout)
    }

    async fn extract_side_streams(&self, layout: &WorkLayout) -> Result<SideFiles, JobError> {
        let mut side = SideFiles::default();
        if matches!(self.job.merge, MergeMode::Source { .. }) {
            return Ok(side);
        }
        self.progress.set_stage(Stage::ExtractingSideStreams);

        let media = &self.ctx.media;
        let streams: Vec<u32> = self
            .job
            .probe
            .side_streams(&self.ctx.config.excluded_codecs)
            .map(|s| s.index)
            .collect();
        if streams.is_empty() {
            log::info!("Pipeline[{}]: no side streams to copy", self.job.id);
        } else {
            media
                .copy_streams(&self.job.source, &layout.side_streams, &streams, &self.cancel)
                .await?;
            side.streams = Some(layout.side_streams.clone());
        }

        media
            .extract_metadata(&self.job.source, &layout.metadata, &self.cancel)
            .await?;
        side.metadata = Some(layout.metadata.clone());
        Ok(side)
    }

    async fn stream_frames(
        &self,
        session: &mut PipelineSession,
        layout: &WorkLayout,
    ) -> Result<(), JobError> {
        let job = &self.job;
        let media = &self.ctx.media;
        let config = &self.ctx.config;
        let rate = job.probe.frame_rate();

        let mut decode = media.decode_command(&job.source, rate, job.image_format, job.decode_options());
        let decoder = session
            .decoder
            .insert(ProcessGuard::spawn("decoder", &mut decode)?);
        log::debug!("Pipeline[{}]: decoder pid {:?}", job.id, decoder.id());
        let mut reader = FrameReader::new(SyncIoBridge::new(decoder.take_stdout()?), job.image_format);

        let encode = media.encode_command(
            &layout.encoded_video,
            rate,
            job.image_format,
            job.interpolate_fps,
        );
        let muxer = session.muxer.insert(
            FrameBatchMuxer::new(encode, job.image_format, self.cancel.child_token())
                .with_capacity(config.muxer_capacity)
                .with_start_timeout(config.muxer_start_timeout()),
        );
        muxer.start().await?;

        let mut next_index = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            self.progress.set_stage(Stage::ExtractingFrames);
            reset_dir(&layout.frames).await?;

            let frames_dir = layout.frames.clone();
            let chunk_size = job.chunk_size;
            let task = tokio::task::spawn_blocking(move || {
                let staged = stage_frames(&mut reader, &frames_dir, next_index, chunk_size);
                (reader, staged)
            });
            let (returned, staged) = tokio::select! {
                joined = task => joined.context("frame reader panicked")?,
                _ = self.cancel.cancelled() => {
                    if let Some(decoder) = session.decoder.as_mut() {
                        decoder.kill();
                    }
                    return Err(JobError::Cancelled);
                }
            };
            reader = returned;
            let staged = staged.context("failed to stage frames")?;
            if staged == 0 {
                // a decoder that died early also ends the stream
                if let Some(decoder) = session.decoder.as_mut() {
                    tokio::select! {
                        exit = decoder.wait() => exit?,
                        _ = self.cancel.cancelled() => return Err(JobError::Cancelled),
                    }
                }
                break;
            }

            next_index += staged;
            self.progress.add_extracted(staged);
            log::debug!(
                "Pipeline[{}]: staged frames {}..={}",
                job.id,
                next_index - staged + 1,
                next_index
            );

            let batch = layout.new_batch_dir();
            tokio::fs::create_dir_all(&batch).await?;
            self.transform_chunk(&layout.frames, &batch).await?;
            muxer.enqueue(batch).await?;
            self.progress.chunk_enqueued();
        }

        self.progress.set_stage(Stage::Draining);
        let written = muxer.complete_and_wait().await?;
        log::info!(
            "Pipeline[{}]: encoded {} frames in {} chunks",
            job.id,
            written,
            self.progress.chunks()
        );
        Ok(())
    }

    async fn transform_chunk(&self, frames: &Path, batch: &Path) -> Result<(), JobError> {
        let job = &self.job;
        let request = TransformRequest {
            input_dir: frames,
            output_dir: batch,
            scale: job.scale,
            model: &job.model,
            devices: &job.devices,
            format: job.image_format,
            tile_size: job.tile_size,
        };

        loop {
            self.wait_while_paused().await?;
            let pause = self.pause_token();
            self.progress.set_stage(Stage::Upscaling);
            self.progress.set_chunk_percent(0.0);

            let progress = &self.progress;
            let checkpoint = progress.checkpoint();
            let mut last = Instant::now();
            let result = self
                .ctx
                .transform
                .run(&request, &pause, |event| match event {
                    TransformEvent::FrameCompleted => {
                        let now = Instant::now();
                        progress.frame_completed(now - last);
                        last = now;
                    }
                    TransformEvent::Percent(percent) => progress.set_chunk_percent(percent),
                })
                .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() && !self.cancel.is_cancelled() => {
                    log::info!(
                        "Pipeline[{}]: transform interrupted by pause, chunk will restart",
                        job.id
                    );
                    progress.restore(checkpoint);
                    reset_dir(batch).await?;
                }
                Err(e) if e.is_cancelled() => return Err(JobError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_while_paused(&self) -> Result<(), JobError> {
        let mut paused = self.paused.subscribe();
        if !*paused.borrow_and_update() {
            return Ok(());
        }
        self.progress.set_stage(Stage::Paused);
        tokio::select! {
            resumed = paused.wait_for(|p| !*p) => resumed
                .map(|_| ())
                .map_err(|_| JobError::Cancelled),
            _ = self.cancel.cancelled() => Err(JobError::Cancelled),
        }
    }

    async fn merge(&self, layout: &WorkLayout, side: &SideFiles) -> Result<(), JobError> {
        self.progress.set_stage(Stage::Merging);
        let job = &self.job;
        let sources = match &job.merge {
            MergeMode::Sidecars => MergeSources::Sidecars {
                streams: side.streams.as_deref(),
                metadata: side.metadata.as_deref(),
            },
            MergeMode::Source { subtitles } => MergeSources::Source {
                source: &job.source,
                subtitles: subtitles.as_deref(),
            },
        };

        if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.ctx
            .media
            .merge(&layout.encoded_video, sources, &job.output, &self.cancel)
            .await?;
        log::info!("Pipeline[{}]: wrote {}", job.id, job.output.display());
        Ok(())
    }

    async fn cleanup(&self) -> Option<String> {
        if !self.job.delete_working_dir {
            return None;
        }
        match tokio::fs::remove_dir_all(&self.job.working_dir).await {
            Ok(()) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                let message = format!(
                    "failed to delete working directory {}: {}",
                    self.job.working_dir.display(),
                    e
                );
                log::warn!("Pipeline[{}]: {}", self.job.id, message);
                Some(message)
            }
        }
    }
}

async fn reset_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Writes up to `count` frames as `{n:08}.{ext}`, numbered from `first + 1`.
///
/// Returns the number written; 0 means the stream is exhausted.
fn stage_frames<R: Read>(
    reader: &mut FrameReader<R>,
    dir: &Path,
    first: u64,
    count: u32,
) -> io::Result<u64> {
    let ext = reader.format().extension();
    let mut written = 0u64;
    while written < u64::from(count) {
        let frame = reader.next_frame()?;
        if frame.is_empty() {
            break;
        }
        if reader.last_truncated() {
            log::warn!(
                "Pipeline: dropping truncated trailing frame ({} bytes)",
                frame.len()
            );
            break;
        }
        std::fs::write(dir.join(format!("{:08}.{}", first + written + 1, ext)), &frame)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
