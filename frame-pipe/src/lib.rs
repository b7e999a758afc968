//! Frame plumbing for chunked video upscaling: splitting an image pipe into
//! frames, feeding finished batches back into an encoder, and driving the
//! external tools involved.

pub mod average;
pub mod ffmpeg;
pub mod framer;
pub mod muxer;
pub mod probe;
pub mod process;
pub mod transform;

pub use average::RateAverager;
pub use ffmpeg::{DecodeOptions, MediaTools, MergeSources};
pub use framer::{FrameReader, ImageFormat, next_frame};
pub use muxer::FrameBatchMuxer;
pub use probe::{MediaProbe, StreamInfo};
pub use process::{ProcessGuard, ToolError};
pub use transform::{TransformEvent, TransformRequest, TransformTool};
