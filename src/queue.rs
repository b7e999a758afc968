//! Single-flight job scheduler.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppContext,
    job::{
        JobId, JobOutcome, JobStatus, JobSummary, PipelineOrchestrator, ProgressSnapshot,
        RunReport, UpscaleJob,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub processing: bool,
    pub paused: bool,
    pub current: Option<JobId>,
    pub progress: Option<ProgressSnapshot>,
    pub queued: usize,
    /// Current job plus every other queued job at the current frame rate.
    pub eta: Option<Duration>,
}

struct RunnerState {
    active: bool,
    handle: Option<JoinHandle<()>>,
    run: CancellationToken,
}

struct QueueInner {
    ctx: Arc<AppContext>,
    jobs: RwLock<Vec<UpscaleJob>>,
    current: RwLock<Option<Arc<PipelineOrchestrator>>>,
    runner: Mutex<RunnerState>,
    busy: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Ordered jobs processed one at a time in list order.
///
/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Every run is cancelled once `shutdown` fires.
    pub fn new(ctx: Arc<AppContext>, shutdown: &CancellationToken) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                ctx,
                jobs: RwLock::new(Vec::new()),
                current: RwLock::new(None),
                runner: Mutex::new(RunnerState {
                    active: false,
                    handle: None,
                    run: CancellationToken::new(),
                }),
                busy,
                shutdown: shutdown.child_token(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.inner.ctx
    }

    /// Appends `job` as Queued and optionally starts the runner.
    pub async fn enqueue(&self, mut job: UpscaleJob, start: bool) -> JobId {
        let id = job.id;
        job.status = JobStatus::Queued;
        job.error = None;
        job.elapsed = None;
        log::info!("Queue: added {} ({})", id, job.source.display());
        self.inner.jobs.write().await.push(job);
        if start {
            self.start().await;
        }
        id
    }

    /// Starts processing queued jobs. Returns false if already running or
    /// shut down.
    pub async fn start(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            log::warn!("Queue: shut down, not starting");
            return false;
        }
        let mut state = self.inner.runner.lock().await;
        if state.active {
            return false;
        }
        let run = self.inner.shutdown.child_token();
        state.active = true;
        state.run = run.clone();
        self.inner.busy.send_replace(true);
        state.handle = Some(tokio::spawn(self.clone().run_jobs(run)));
        true
    }

    /// Removes a job unless it is running.
    pub async fn remove(&self, id: JobId) -> bool {
        let mut jobs = self.inner.jobs.write().await;
        match jobs.iter().position(|j| j.id == id) {
            Some(index) if jobs[index].status != JobStatus::Running => {
                jobs.remove(index);
                true
            }
            Some(_) => {
                log::warn!("Queue: {} is running, not removed", id);
                false
            }
            None => false,
        }
    }

    /// Drops every job except the running one.
    pub async fn clear(&self) {
        self.inner
            .jobs
            .write()
            .await
            .retain(|j| j.status == JobStatus::Running);
    }

    /// Cancels the running job and waits for the runner to stop.
    ///
    /// The job goes back to Queued; other jobs are untouched.
    pub async fn cancel_current(&self) -> bool {
        let (handle, run) = {
            let mut state = self.inner.runner.lock().await;
            if !state.active {
                return false;
            }
            (state.handle.take(), state.run.clone())
        };
        log::info!("Queue: cancelling current run");
        run.cancel();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Queue: runner task failed: {}", e);
            }
        }
        true
    }

    pub async fn pause_current(&self) -> bool {
        match self.inner.current.read().await.as_ref() {
            Some(pipeline) => {
                pipeline.pause();
                true
            }
            None => false,
        }
    }

    pub async fn resume_current(&self) -> bool {
        match self.inner.current.read().await.as_ref() {
            Some(pipeline) => {
                pipeline.resume();
                true
            }
            None => false,
        }
    }

    pub async fn jobs(&self) -> Vec<JobSummary> {
        self.inner.jobs.read().await.iter().map(JobSummary::from).collect()
    }

    pub async fn job(&self, id: JobId) -> Option<UpscaleJob> {
        self.inner
            .jobs
            .read()
            .await
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn is_processing(&self) -> bool {
        *self.inner.busy.borrow()
    }

    pub async fn status(&self) -> QueueStatus {
        let current = self.inner.current.read().await.clone();
        let (queued, queued_frames) = {
            let jobs = self.inner.jobs.read().await;
            jobs.iter()
                .filter(|j| j.status == JobStatus::Queued)
                .fold((0usize, 0u64), |(n, frames), j| (n + 1, frames + j.expected_frames()))
        };

        let Some(pipeline) = current else {
            return QueueStatus {
                processing: self.is_processing(),
                paused: false,
                current: None,
                progress: None,
                queued,
                eta: None,
            };
        };

        let progress = pipeline.progress().snapshot();
        let eta = match (progress.eta, progress.average_frame_time) {
            (Some(current), Some(average)) => {
                Some(current + average.mul_f64(queued_frames as f64))
            }
            _ => None,
        };
        QueueStatus {
            processing: self.is_processing(),
            paused: pipeline.is_paused(),
            current: Some(pipeline.job().id),
            progress: Some(progress),
            queued,
            eta,
        }
    }

    /// Resolves once the runner has stopped.
    #[cfg(test)]
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        if busy.wait_for(|b| !*b).await.is_err() {
            log::warn!("Queue: busy channel closed");
        }
    }

    /// Cancels the running job for good; later `start` calls are refused.
    pub async fn shutdown(&self) {
        log::info!("Queue: shutting down");
        self.inner.shutdown.cancel();
        self.cancel_current().await;
    }

    async fn run_jobs(self, run: CancellationToken) {
        log::info!("Queue: runner started");
        loop {
            let job = {
                let mut state = self.inner.runner.lock().await;
                let next = if run.is_cancelled() {
                    None
                } else {
                    self.claim_next().await
                };
                match next {
                    Some(job) => job,
                    None => {
                        state.active = false;
                        self.inner.busy.send_replace(false);
                        break;
                    }
                }
            };

            let id = job.id;
            log::info!("Queue: running {}", id);
            let pipeline = Arc::new(PipelineOrchestrator::new(
                Arc::clone(&self.inner.ctx),
                job,
                &run,
            ));
            *self.inner.current.write().await = Some(Arc::clone(&pipeline));
            let report = pipeline.run().await;
            *self.inner.current.write().await = None;

            if report.outcome == JobOutcome::Cancelled {
                // stop after requeueing; nothing else starts until `start`
                run.cancel();
            }
            self.finish(id, report).await;
        }
        log::info!("Queue: runner stopped");
    }

    /// Marks the first Queued job Running and returns a copy of it.
    async fn claim_next(&self) -> Option<UpscaleJob> {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs.iter_mut().find(|j| j.status == JobStatus::Queued)?;
        job.status = JobStatus::Running;
        job.error = None;
        Some(job.clone())
    }

    async fn finish(&self, id: JobId, report: RunReport) {
        let mut jobs = self.inner.jobs.write().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            log::warn!("Queue: finished job {} no longer listed", id);
            return;
        };
        job.elapsed = Some(report.elapsed);
        match report.outcome {
            JobOutcome::Completed => {
                log::info!(
                    "Queue: {} completed in {:?}, {} frames in {} chunks",
                    id,
                    report.elapsed,
                    report.completed_frames,
                    report.chunks
                );
                job.status = JobStatus::Completed;
                job.error = report.cleanup_error;
            }
            JobOutcome::Cancelled => {
                log::info!(
                    "Queue: {} requeued after {} of its chunks",
                    id,
                    report.chunks
                );
                job.status = JobStatus::Queued;
                job.error = None;
            }
            JobOutcome::Failed(message) => {
                log::warn!("Queue: {} failed: {}", id, message);
                job.status = JobStatus::Failed;
                job.error = Some(message);
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
