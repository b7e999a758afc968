pub mod error;
pub mod pipeline;
pub mod progress;
pub mod types;

pub use pipeline::{JobOutcome, PipelineOrchestrator, RunReport};
pub use progress::ProgressSnapshot;
pub use types::{JobId, JobStatus, JobSummary, MergeMode, UpscaleJob};
