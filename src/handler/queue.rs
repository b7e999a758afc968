use std::path::PathBuf;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use frame_pipe::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::{
    handler::{ApiError, ApiJsonResult},
    job::{JobId, JobSummary, MergeMode, UpscaleJob},
    queue::{JobQueue, QueueStatus},
};

pub fn queue_router(queue: JobQueue) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/list", get(list_jobs))
        .route("/add", post(add_job))
        .route("/job/{id}", get(get_job))
        .route("/remove/{id}", get(remove_job))
        .route("/clear", post(clear_jobs))
        .route("/start", post(start_queue))
        .route("/cancel", post(cancel_current))
        .route("/pause", post(pause_current))
        .route("/resume", post(resume_current))
        .route("/status", get(queue_status))
        .with_state(queue)
}

/// Job settings; anything omitted keeps the job defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AddJobRequest {
    source: PathBuf,
    output: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    chunk_size: Option<u32>,
    scale: Option<u32>,
    model: Option<String>,
    devices: Option<Vec<u32>>,
    tile_size: Option<u32>,
    image_format: Option<ImageFormat>,
    interpolate_fps: Option<f64>,
    widescreen_crop: Option<f32>,
    merge: Option<MergeMode>,
    delete_working_dir: Option<bool>,
    start: bool,
}

impl AddJobRequest {
    fn apply(self, job: &mut UpscaleJob) {
        if let Some(output) = self.output {
            job.output = output;
        }
        if let Some(working_dir) = self.working_dir {
            job.working_dir = working_dir;
        }
        if let Some(chunk_size) = self.chunk_size {
            job.chunk_size = chunk_size;
        }
        if let Some(scale) = self.scale {
            job.scale = scale;
        }
        if let Some(model) = self.model {
            job.model = model;
        }
        if let Some(devices) = self.devices {
            job.devices = devices;
        }
        if let Some(tile_size) = self.tile_size {
            job.tile_size = tile_size;
        }
        if let Some(format) = self.image_format {
            job.image_format = format;
        }
        if let Some(merge) = self.merge {
            job.merge = merge;
        }
        if let Some(delete) = self.delete_working_dir {
            job.delete_working_dir = delete;
        }
        job.interpolate_fps = self.interpolate_fps;
        job.widescreen_crop = self.widescreen_crop;
    }
}

#[derive(Debug, Serialize)]
struct Accepted {
    ok: bool,
}

impl Accepted {
    fn json(ok: bool) -> Json<Self> {
        Json(Self { ok })
    }
}

async fn index() -> &'static str {
    "queue route!"
}

async fn list_jobs(State(queue): State<JobQueue>) -> Json<Vec<JobSummary>> {
    Json(queue.jobs().await)
}

async fn add_job(
    State(queue): State<JobQueue>,
    Json(req): Json<AddJobRequest>,
) -> ApiJsonResult<JobSummary> {
    if req.source.as_os_str().is_empty() {
        return Err(ApiError::bad_request("source is required"));
    }
    if !req.source.is_file() {
        return Err(ApiError::bad_request(format!(
            "source not found: {}",
            req.source.display()
        )));
    }
    if req.chunk_size == Some(0) {
        return Err(ApiError::bad_request("chunk_size must be greater than zero"));
    }

    let probe = queue.context().media.probe(&req.source).await?;
    if probe.video_stream().is_none() {
        return Err(ApiError::bad_request("source has no video stream"));
    }

    let start = req.start;
    let mut job = UpscaleJob::new(req.source.clone(), probe);
    req.apply(&mut job);
    let summary = JobSummary::from(&job);
    queue.enqueue(job, start).await;
    Ok(Json(summary))
}

async fn get_job(
    State(queue): State<JobQueue>,
    Path(id): Path<JobId>,
) -> Json<Option<UpscaleJob>> {
    Json(queue.job(id).await)
}

async fn remove_job(State(queue): State<JobQueue>, Path(id): Path<JobId>) -> Json<Accepted> {
    Accepted::json(queue.remove(id).await)
}

async fn clear_jobs(State(queue): State<JobQueue>) -> Json<Accepted> {
    queue.clear().await;
    Accepted::json(true)
}

async fn start_queue(State(queue): State<JobQueue>) -> Json<Accepted> {
    Accepted::json(queue.start().await)
}

async fn cancel_current(State(queue): State<JobQueue>) -> Json<Accepted> {
    Accepted::json(queue.cancel_current().await)
}

async fn pause_current(State(queue): State<JobQueue>) -> Json<Accepted> {
    Accepted::json(queue.pause_current().await)
}

async fn resume_current(State(queue): State<JobQueue>) -> Json<Accepted> {
    Accepted::json(queue.resume_current().await)
}

async fn queue_status(State(queue): State<JobQueue>) -> Json<QueueStatus> {
    Json(queue.status().await)
}

#[cfg(all(test, unix))]
#[path = "queue_test.rs"]
mod queue_test;
