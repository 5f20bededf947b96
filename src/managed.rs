//! The managed-transform variant.
//!
//! Some platforms ship a high-level transform primitive that runs the whole
//! decode → encode → mux loop internally and only exposes start / progress / completion. We model
//! that as [`ManagedTransform`] and drive it with [`ManagedCompressor`], which keeps every
//! guarantee of the polling path:
//! - the same argument validation, planning and output handling
//! - monotonic, throttled progress ending in exactly one 100
//! - the output guard
//! - the same error taxonomy, with cancellation checked at every poll

use std::path::Path;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::backend::reclassify;
use crate::cancel::CancelToken;
use crate::compressor::{CompressionOutcome, discard_output, finalize, prepare_output};
use crate::error::{Error, Result};
use crate::opts::{Opts, PipelineConfig};
use crate::plan::EncodePlan;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::track::{TrackDescriptor, select_tracks};

/// Progress as a managed transform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformProgress {
    /// The transform can't estimate progress right now.
    Unavailable,
    /// Percent complete, `0..=100`.
    Available(u8),
    /// The transform decided the input needs no work.
    NoTransformation,
}

/// A platform transform primitive that owns its codec loop.
pub trait ManagedTransform {
    /// Enumerate the input's tracks.
    fn probe(&mut self, input: &Path) -> Result<Vec<TrackDescriptor>>;

    /// Begin writing `output` from `input` according to `plan`.
    fn start(&mut self, input: &Path, output: &Path, plan: &EncodePlan) -> Result<()>;

    fn poll_progress(&mut self) -> TransformProgress;

    /// Wait up to `timeout` for the transform to end. `Ok(true)` once it completed successfully.
    fn poll_completion(&mut self, timeout: Duration) -> Result<bool>;

    /// Stop a running transform. Must be safe to call when nothing is running.
    fn cancel(&mut self);
}

/// Drives a [`ManagedTransform`] with the same contract as [`crate::Compressor`].
pub struct ManagedCompressor<T: ManagedTransform> {
    transform: T,
    config: PipelineConfig,
}

impl<T: ManagedTransform> ManagedCompressor<T> {
    pub fn new(transform: T) -> Self {
        Self {
            transform,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn compress(
        &mut self,
        opts: &Opts,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CompressionOutcome> {
        let job = Uuid::new_v4();
        let span = tracing::info_span!("compress", job = %job, managed = true);
        let _enter = span.enter();

        opts.validate()?;
        prepare_output(opts)?;

        let res = self.run(opts, sink, cancel);
        if let Err(err) = &res {
            discard_output(&opts.output);
            tracing::error!(code = %err.code(), error = %err, "managed compression failed");
        }
        res
    }

    fn run(
        &mut self,
        opts: &Opts,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CompressionOutcome> {
        let started = Instant::now();

        let tracks = self
            .transform
            .probe(&opts.input)
            .map_err(reclassify(Error::ReaderStartFailed))?;
        let tracks = select_tracks(&tracks)?;
        let plan = EncodePlan::new(opts, &tracks, self.config.scale_policy)?;

        self.transform
            .start(&opts.input, &opts.output, &plan)
            .map_err(reclassify(Error::WriterInputError))?;
        tracing::debug!(
            width = plan.final_width,
            height = plan.final_height,
            "managed transform started"
        );

        let mut reporter = ProgressReporter::new(sink, self.config.progress_interval, 0);
        loop {
            if cancel.is_cancelled() {
                self.transform.cancel();
                return Err(Error::Cancelled);
            }

            match self.transform.poll_progress() {
                TransformProgress::Available(percent) => reporter.observe_percent(percent),
                TransformProgress::NoTransformation => {
                    tracing::debug!("managed transform reports nothing to do");
                    reporter.observe_percent(100);
                }
                TransformProgress::Unavailable => {}
            }

            let done = self
                .transform
                .poll_completion(self.config.poll_timeout)
                .map_err(reclassify(Error::WriteFailed));
            match done {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    self.transform.cancel();
                    return Err(err);
                }
            }
        }

        let outcome = finalize(opts, started)?;
        reporter.finish();
        Ok(outcome)
    }
}
