use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use frame_pipe::RateAverager;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Starting,
    ExtractingSideStreams,
    ExtractingFrames,
    Upscaling,
    Paused,
    Draining,
    Merging,
    CleaningUp,
    Finished,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub total_frames: u64,
    pub extracted_frames: u64,
    pub completed_frames: u64,
    pub chunks: u64,
    pub chunk_percent: u32,
    pub overall_percent: u32,
    pub average_frame_time: Option<Duration>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ProgressCheckpoint {
    completed: u64,
    averager: RateAverager,
}

/// Counters of one running job.
///
/// Written by the pipeline and the transform output callback, read by the
/// periodic ticker and the queue.
#[derive(Debug)]
pub struct JobProgress {
    total_frames: u64,
    extracted: AtomicU64,
    completed: AtomicU64,
    chunks: AtomicU64,
    chunk_percent: AtomicU32,
    stage: Mutex<Stage>,
    averager: Mutex<RateAverager>,
    started: Instant,
    snapshot: watch::Sender<ProgressSnapshot>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobProgress {
    pub fn new(total_frames: u64) -> Self {
        let (snapshot, _) = watch::channel(ProgressSnapshot {
            total_frames,
            ..ProgressSnapshot::default()
        });
        Self {
            total_frames,
            extracted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            chunk_percent: AtomicU32::new(0),
            stage: Mutex::new(Stage::Starting),
            averager: Mutex::new(RateAverager::default()),
            started: Instant::now(),
            snapshot,
        }
    }

    pub fn stage(&self) -> Stage {
        *lock(&self.stage)
    }

    pub fn set_stage(&self, stage: Stage) {
        *lock(&self.stage) = stage;
    }

    pub fn add_extracted(&self, frames: u64) {
        self.extracted.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn chunk_enqueued(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn completed_frames(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Completed count and frame timings, to roll back to when a chunk restarts.
    pub fn checkpoint(&self) -> ProgressCheckpoint {
        ProgressCheckpoint {
            completed: self.completed_frames(),
            averager: lock(&self.averager).clone(),
        }
    }

    pub fn restore(&self, checkpoint: ProgressCheckpoint) {
        self.completed.store(checkpoint.completed, Ordering::Relaxed);
        *lock(&self.averager) = checkpoint.averager;
    }

    pub fn frame_completed(&self, took: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut averager = lock(&self.averager);
        averager.push(took);
        if averager.average_ready() {
            let average = averager.get_average(true);
            log::debug!("Progress: average frame time {:?}", average);
        }
    }

    pub fn set_chunk_percent(&self, percent: f32) {
        let percent = percent.clamp(0.0, 100.0).round() as u32;
        self.chunk_percent.store(percent, Ordering::Relaxed);
    }

    /// Recomputes and publishes the snapshot.
    pub fn refresh(&self) -> ProgressSnapshot {
        let completed = self.completed_frames();
        let remaining = self.total_frames.saturating_sub(completed);
        let (average_frame_time, eta) = {
            let averager = lock(&self.averager);
            let average = averager.average();
            ((!average.is_zero()).then_some(average), averager.eta(remaining))
        };
        let overall_percent = if self.total_frames == 0 {
            0
        } else {
            (completed.saturating_mul(100) / self.total_frames).min(100) as u32
        };

        let snapshot = ProgressSnapshot {
            stage: self.stage(),
            total_frames: self.total_frames,
            extracted_frames: self.extracted.load(Ordering::Relaxed),
            completed_frames: completed,
            chunks: self.chunks(),
            chunk_percent: self.chunk_percent.load(Ordering::Relaxed),
            overall_percent,
            average_frame_time,
            eta,
            elapsed: self.started.elapsed(),
        };
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshot.subscribe()
    }

    /// Refreshes the snapshot every `interval` until `cancel` fires.
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let progress = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        progress.refresh();
                    }
                }
            }
            progress.refresh();
        })
    }
}

#[cfg(test)]
#[path = "progress_test.rs"]
mod progress_test;
