//! High-level API for compressing a video file.
//!
//! `Compressor` wires the pieces together for one request:
//! validate → clear output → open source → inspect → plan → check outputs → create writer →
//! run the pipelines → finish container → output guard → final progress.
//!
//! The video pipeline runs on the calling thread; the audio pipeline (when the source has audio)
//! runs on a scoped thread next to it. Both write into one [`ContainerMuxer`]. If either pipeline
//! fails, we cancel a child token so the other one stops at its next poll instead of running to
//! completion for nothing.
//!
//! Exit guarantees:
//! - on success exactly one file exists at `opts.output`
//! - on failure (including cancellation) nothing is left at `opts.output`
//! - the source handle and every codec are released on all paths

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use uuid::Uuid;

use crate::backend::{Backend, SourceContainer, reclassify};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::guard;
use crate::muxer::ContainerMuxer;
use crate::opts::{Opts, PipelineConfig};
use crate::pipeline::{PipelineSummary, TranscodePipeline};
use crate::plan::EncodePlan;
use crate::progress::{self, ProgressEvents, ProgressReporter, ProgressSink};
use crate::track::{self, MediaType, TrackDescriptor};

/// Result of a successful compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionOutcome {
    /// The output path (always `opts.output`).
    pub output: PathBuf,
    pub input_bytes: u64,
    /// Size of the file left at `output`.
    pub output_bytes: u64,
    /// `true` when the transcoded file wasn't smaller and `output` is a copy of the input.
    pub kept_original: bool,
}

/// Compresses videos with a given [`Backend`].
///
/// A `Compressor` holds no per-request state, so one instance can serve many requests, including
/// concurrently.
pub struct Compressor<B: Backend> {
    backend: B,
    config: PipelineConfig,
}

impl<B: Backend> Compressor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Compress `opts.input` into `opts.output`.
    ///
    /// Progress goes to `sink`; the sequence is non-decreasing and, on success, ends with exactly
    /// one 100 right before this returns.
    pub fn compress(
        &self,
        opts: &Opts,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CompressionOutcome> {
        let job = Uuid::new_v4();
        let span = tracing::info_span!("compress", job = %job);
        let _enter = span.enter();

        opts.validate()?;
        prepare_output(opts)?;

        let res = self.run(opts, sink, cancel);
        if let Err(err) = &res {
            discard_output(&opts.output);
            if err.is_cancelled() {
                tracing::info!("compression cancelled");
            } else {
                tracing::error!(code = %err.code(), error = %err, "compression failed");
            }
        }
        res
    }

    /// Like [`Compressor::compress`], returning only the output path.
    pub fn compress_path(
        &self,
        opts: &Opts,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        self.compress(opts, sink, cancel).map(|outcome| outcome.output)
    }

    fn run(
        &self,
        opts: &Opts,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CompressionOutcome> {
        let started = Instant::now();

        let source = self
            .backend
            .open_source(&opts.input)
            .map_err(reclassify(Error::ReaderStartFailed))?;
        let tracks = track::inspect(&source)?;
        let plan = EncodePlan::new(opts, &tracks, self.config.scale_policy)?;

        let video_remux = plan.video_is_passthrough(&tracks.video);
        let audio_remux = tracks
            .audio
            .as_ref()
            .is_some_and(|audio| plan.audio_is_passthrough(audio));

        tracing::info!(
            input = %opts.input.display(),
            output = %opts.output.display(),
            source_width = tracks.video.width,
            source_height = tracks.video.height,
            rotation = plan.rotation.degrees(),
            width = plan.final_width,
            height = plan.final_height,
            video_codec = %plan.target_video_codec,
            bitrate = plan.target_bitrate,
            source_bitrate = tracks.video.bitrate_or(u64::from(plan.target_bitrate)),
            has_audio = tracks.audio.is_some(),
            video_remux,
            audio_remux,
            "compression started"
        );

        self.backend
            .check_outputs(&plan, tracks.audio.is_some())
            .map_err(reclassify(Error::WriterInputError))?;

        let writer = self
            .backend
            .create_writer(&opts.output, &plan)
            .map_err(reclassify(Error::WriterInputError))?;

        let mut expected = vec![MediaType::Video];
        if tracks.audio.is_some() {
            expected.push(MediaType::Audio);
        }
        let muxer = ContainerMuxer::new(writer, &expected);

        let mut reporter =
            ProgressReporter::new(sink, self.config.progress_interval, tracks.duration_us());
        let stop = cancel.child();
        let first_fault = OnceLock::new();

        let (video_res, audio_res) = thread::scope(|s| {
            let audio_handle = tracks.audio.as_ref().map(|audio| {
                let (source, plan, muxer, stop, first_fault) =
                    (&source, &plan, &muxer, &stop, &first_fault);
                let span = tracing::Span::current();
                s.spawn(move || {
                    let _enter = span.enter();
                    let res = self.run_audio(source, plan, audio, muxer, stop, audio_remux);
                    on_pipeline_exit(MediaType::Audio, &res, stop, first_fault);
                    res
                })
            });

            let mut observe = |pts_us: i64| reporter.observe_timestamp(pts_us);
            let video_res = self.run_video(
                &source,
                &plan,
                &tracks.video,
                &muxer,
                &stop,
                video_remux,
                &mut observe,
            );
            on_pipeline_exit(MediaType::Video, &video_res, &stop, &first_fault);

            let audio_res = audio_handle.map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::compression("audio pipeline panicked")))
            });
            (video_res, audio_res)
        });

        let summaries = match merge_pipeline_results(video_res, audio_res, first_fault.get()) {
            Ok(summaries) => summaries,
            Err(err) => {
                muxer.abandon();
                return Err(err);
            }
        };

        let stats = muxer.finish()?;
        drop(source);

        for summary in &summaries {
            tracing::debug!(
                media_type = %summary.media_type,
                remuxed = summary.remuxed,
                samples_read = summary.samples_read,
                samples_written = summary.samples_written,
                "pipeline finished"
            );
        }
        tracing::debug!(
            video_samples = stats.video_samples,
            audio_samples = stats.audio_samples,
            "container finalized"
        );

        let outcome = finalize(opts, started)?;
        reporter.finish();
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_video(
        &self,
        source: &B::Source,
        plan: &EncodePlan,
        video: &TrackDescriptor,
        muxer: &ContainerMuxer<B::Writer>,
        cancel: &CancelToken,
        remux: bool,
        observer: &mut dyn FnMut(i64),
    ) -> Result<PipelineSummary> {
        let reader = source
            .open_reader(video)
            .map_err(reclassify(Error::ReadFailed))?;

        let pipeline = if remux {
            let format = source
                .track_format(video)
                .map_err(reclassify(Error::WriterInputError))?;
            TranscodePipeline::remux(MediaType::Video, reader, format, muxer)
        } else {
            let decoder = self.backend.video_decoder(source, video)?;
            let encoder = self
                .backend
                .video_encoder(plan, video)
                .map_err(reclassify(Error::WriterInputError))?;
            TranscodePipeline::transcode(MediaType::Video, reader, decoder, encoder, muxer)
        };

        pipeline
            .with_cancel(cancel.clone())
            .with_poll_timeout(self.config.poll_timeout)
            .with_observer(observer)
            .run()
    }

    fn run_audio(
        &self,
        source: &B::Source,
        plan: &EncodePlan,
        audio: &TrackDescriptor,
        muxer: &ContainerMuxer<B::Writer>,
        cancel: &CancelToken,
        remux: bool,
    ) -> Result<PipelineSummary> {
        let reader = source
            .open_reader(audio)
            .map_err(reclassify(Error::ReadFailed))?;

        let pipeline = if remux {
            let format = source
                .track_format(audio)
                .map_err(reclassify(Error::WriterInputError))?;
            TranscodePipeline::remux(MediaType::Audio, reader, format, muxer)
        } else {
            let decoder = self.backend.audio_decoder(source, audio)?;
            let encoder = self
                .backend
                .audio_encoder(plan, audio)
                .map_err(reclassify(Error::WriterInputError))?;
            TranscodePipeline::transcode(MediaType::Audio, reader, decoder, encoder, muxer)
        };

        pipeline
            .with_cancel(cancel.clone())
            .with_poll_timeout(self.config.poll_timeout)
            .run()
    }
}

impl<B> Compressor<B>
where
    B: Backend + Send + 'static,
{
    /// Run a compression on a worker thread.
    pub fn spawn(self: &Arc<Self>, opts: Opts) -> CompressionJob {
        let compressor = Arc::clone(self);
        let cancel = CancelToken::new();
        let (mut tx, events) = progress::channel();

        let job_cancel = cancel.clone();
        let handle = thread::spawn(move || compressor.compress(&opts, &mut tx, &job_cancel));

        CompressionJob {
            cancel,
            events: Some(events),
            handle,
        }
    }
}

/// A compression running on its own thread.
pub struct CompressionJob {
    cancel: CancelToken,
    events: Option<ProgressEvents>,
    handle: JoinHandle<Result<CompressionOutcome>>,
}

impl CompressionJob {
    /// The job's progress events. Only the first call returns them; the stream can't be restarted.
    pub fn progress(&mut self) -> Option<ProgressEvents> {
        self.events.take()
    }

    /// Ask the job to stop. It ends with [`Error::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the job ends.
    pub fn wait(self) -> Result<CompressionOutcome> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(Error::compression("compression thread panicked")))
    }
}

fn on_pipeline_exit(
    media_type: MediaType,
    res: &Result<PipelineSummary>,
    stop: &CancelToken,
    first_fault: &OnceLock<MediaType>,
) {
    if let Err(err) = res {
        if !err.is_cancelled() {
            let _ = first_fault.set(media_type);
        }
        stop.cancel();
    }
}

/// Pick the error to report when one or both pipelines failed.
///
/// A pipeline that stopped only because its sibling failed reports `Cancelled`; the sibling's
/// fault wins over that. When both faulted on their own, the one that failed first wins.
fn merge_pipeline_results(
    video: Result<PipelineSummary>,
    audio: Option<Result<PipelineSummary>>,
    first_fault: Option<&MediaType>,
) -> Result<Vec<PipelineSummary>> {
    match (video, audio) {
        (Ok(video), None) => Ok(vec![video]),
        (Ok(video), Some(Ok(audio))) => Ok(vec![video, audio]),
        (Err(err), None) | (Err(err), Some(Ok(_))) | (Ok(_), Some(Err(err))) => Err(err),
        (Err(video_err), Some(Err(audio_err))) => {
            let audio_first = first_fault == Some(&MediaType::Audio)
                || (video_err.is_cancelled() && !audio_err.is_cancelled());
            let (primary, secondary) = if audio_first {
                (audio_err, video_err)
            } else {
                (video_err, audio_err)
            };
            if !secondary.is_cancelled() {
                tracing::warn!(error = %secondary, "secondary pipeline failure");
            }
            Err(primary)
        }
    }
}

/// Delete whatever is at the output path before a new compression writes there.
///
/// Refuses when the output is the source itself under another spelling (`..`, a symlink, a hard
/// link): the source would be gone before it was read.
pub(crate) fn prepare_output(opts: &Opts) -> Result<()> {
    if is_same_file(&opts.input, &opts.output) {
        return Err(Error::invalid(format!(
            "`output` {} is the same file as `input`",
            opts.output.display()
        )));
    }

    let output = &opts.output;
    match fs::remove_file(output) {
        Ok(()) => {
            tracing::debug!(output = %output.display(), "removed existing output");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to remove existing {}", output.display()))
            .into()),
    }
}

/// Whether `output` resolves to the file at `input`. A missing input never matches.
fn is_same_file(input: &Path, output: &Path) -> bool {
    let Ok(input_path) = fs::canonicalize(input) else {
        return false;
    };

    // The output usually doesn't exist yet; resolve its directory instead.
    let output_path = fs::canonicalize(output).ok().or_else(|| {
        let name = output.file_name()?;
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::canonicalize(parent).ok().map(|dir| dir.join(name))
    });
    if output_path.as_deref() == Some(input_path.as_path()) {
        return true;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if let (Ok(a), Ok(b)) = (fs::metadata(input), fs::metadata(output)) {
            return a.dev() == b.dev() && a.ino() == b.ino();
        }
    }
    false
}

/// Best-effort removal of a partial output after a failure.
pub(crate) fn discard_output(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => tracing::debug!(output = %output.display(), "removed partial output"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(output = %output.display(), error = %err, "failed to remove partial output")
        }
    }
}

/// Apply the output guard to a closed container and log the compression report.
pub(crate) fn finalize(opts: &Opts, started: Instant) -> Result<CompressionOutcome> {
    let outcome = guard::enforce(&opts.input, &opts.output)?;

    tracing::info!(
        input_bytes = outcome.input_bytes,
        output_bytes = outcome.output_bytes,
        transcoded_bytes = outcome.transcoded_bytes,
        ratio = outcome.ratio(),
        kept_original = outcome.kept_original,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "compression finished"
    );

    Ok(CompressionOutcome {
        output: opts.output.clone(),
        input_bytes: outcome.input_bytes,
        output_bytes: outcome.output_bytes,
        kept_original: outcome.kept_original,
    })
}
