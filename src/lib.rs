//! `squeeze`: a small, focused video compression library.
//!
//! This crate provides:
//! - Track inspection, resolution planning and codec selection
//! - A polling decode → encode → mux pipeline per track, with a remux fast path
//! - A shared container muxer that defers start until every track is known
//! - Throttled, monotonic progress reporting
//! - An output guard that never leaves a file larger than the source
//!
//! Codecs and containers sit behind the [`Backend`] trait. The `ffmpeg` feature provides one built
//! on FFmpeg; tests and other platforms can bring their own.

// High-level API (most consumers should start here).
pub mod compressor;
pub mod managed;
pub mod opts;

// Error taxonomy.
pub mod error;

// Source inspection and planning.
pub mod codec;
pub mod plan;
pub mod track;

// The transcode core.
pub mod backend;
pub mod cancel;
pub mod muxer;
pub mod pipeline;
pub mod sample;

// Progress and output handling.
pub mod guard;
pub mod progress;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use backend::Backend;
pub use cancel::CancelToken;
pub use codec::{AudioCodec, VideoCodec};
pub use compressor::{CompressionJob, CompressionOutcome, Compressor};
pub use error::{Error, ErrorCode, Result};
pub use managed::{ManagedCompressor, ManagedTransform, TransformProgress};
pub use opts::{Opts, PipelineConfig, ScalePolicy};
pub use progress::{Progress, ProgressSink};
