//! The per-track transcode state machine.
//!
//! One `TranscodePipeline` drives one selected track from its reader into the shared
//! [`ContainerMuxer`]. It takes one of two routes:
//! - **Transcode**: reader → decoder → encoder → muxer, using the polling codec contract
//! - **Remux**: reader → muxer, copying compressed samples as they are
//!
//! Every iteration of the loop is a bounded amount of work. Each codec call waits at most
//! `poll_timeout`, so the loop regularly comes back to its cancellation check. "Not ready" answers
//! are never errors: we just come around again.
//!
//! The phase a pipeline is in is tracked as a [`PipelineState`]:
//! - `Feeding`: the reader still has samples for the decoder
//! - `Draining`: the reader is exhausted; decoded output is still flowing into the encoder
//! - `AwaitingFormat`: end-of-stream reached the encoder; we keep draining encoder output (and
//!   registering its format, if that hasn't happened yet) until the encoder ends too
//! - `Finished` / `Failed`: terminal
//!
//! Whatever way the loop ends, the decoder and encoder are released. Release failures are logged
//! and never replace the error that ended the loop.

use std::fmt;
use std::time::Duration;

use crate::backend::{
    CodecInput, ContainerWriter, Decoded, Decoder, Encoded, Encoder, SampleReader, Submitted,
    reclassify,
};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::muxer::{ContainerMuxer, OutputTrackBinding};
use crate::sample::Sample;
use crate::track::MediaType;

/// Phase of a [`TranscodePipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Feeding,
    Draining,
    AwaitingFormat,
    Finished,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Feeding => "feeding",
            Self::Draining => "draining",
            Self::AwaitingFormat => "awaiting_format",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a pipeline did, reported when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub media_type: MediaType,
    pub remuxed: bool,
    pub samples_read: u64,
    pub samples_written: u64,
    pub last_pts_us: Option<i64>,
}

type BoxedDecoder<Fr> = Box<dyn Decoder<Frame = Fr>>;
type BoxedEncoder<Fr, Fmt> = Box<dyn Encoder<Frame = Fr, Format = Fmt>>;

enum Route<Fr, Fmt> {
    Transcode(Codecs<Fr, Fmt>),
    Remux(Fmt),
}

/// Drives one track into the muxer.
pub struct TranscodePipeline<'a, Fr, W: ContainerWriter> {
    route: Route<Fr, W::Format>,
    io: TrackIo<'a, W>,
}

impl<'a, Fr, W: ContainerWriter> TranscodePipeline<'a, Fr, W> {
    /// A decode/encode pipeline.
    pub fn transcode(
        media_type: MediaType,
        reader: Box<dyn SampleReader + 'a>,
        decoder: BoxedDecoder<Fr>,
        encoder: BoxedEncoder<Fr, W::Format>,
        muxer: &'a ContainerMuxer<W>,
    ) -> Self {
        Self {
            route: Route::Transcode(Codecs {
                decoder,
                encoder,
                pending_input: None,
                pending_frame: None,
                input_done: false,
                encoder_input_done: false,
            }),
            io: TrackIo::new(media_type, reader, muxer, PipelineState::Feeding),
        }
    }

    /// A copy-through pipeline for a track that already matches the plan.
    ///
    /// `format` is the source track's format, registered with the muxer as is.
    pub fn remux(
        media_type: MediaType,
        reader: Box<dyn SampleReader + 'a>,
        format: W::Format,
        muxer: &'a ContainerMuxer<W>,
    ) -> Self {
        Self {
            route: Route::Remux(format),
            io: TrackIo::new(media_type, reader, muxer, PipelineState::AwaitingFormat),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.io.cancel = cancel;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.io.poll_timeout = timeout;
        self
    }

    /// Call `observer` with the presentation timestamp of every sample written to the muxer.
    pub fn with_observer(mut self, observer: &'a mut dyn FnMut(i64)) -> Self {
        self.io.observer = Some(observer);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.io.state
    }

    /// Run until the track is fully written, cancelled, or failed.
    pub fn run(mut self) -> Result<PipelineSummary> {
        tracing::debug!(
            media_type = %self.io.media_type,
            remux = matches!(self.route, Route::Remux(_)),
            "pipeline starting"
        );

        let res = self.pump();
        if let Err(err) = &res {
            self.io.set_state(PipelineState::Failed);
            if err.is_cancelled() {
                tracing::debug!(media_type = %self.io.media_type, "pipeline cancelled");
            } else {
                tracing::debug!(media_type = %self.io.media_type, error = %err, "pipeline failed");
            }
        }

        if let Route::Transcode(codecs) = &mut self.route {
            codecs.release(self.io.media_type);
        }

        res.map(|()| self.io.summary(matches!(self.route, Route::Remux(_))))
    }

    fn pump(&mut self) -> Result<()> {
        while self.io.state != PipelineState::Finished {
            self.io.cancel.check()?;

            match &mut self.route {
                Route::Transcode(codecs) => codecs.step(&mut self.io)?,
                Route::Remux(format) => remux_step(format, &mut self.io)?,
            }
        }
        Ok(())
    }
}

/// Everything a pipeline touches besides its codecs.
struct TrackIo<'a, W: ContainerWriter> {
    media_type: MediaType,
    reader: Box<dyn SampleReader + 'a>,
    muxer: &'a ContainerMuxer<W>,
    binding: Option<OutputTrackBinding>,
    state: PipelineState,
    cancel: CancelToken,
    poll_timeout: Duration,
    observer: Option<&'a mut dyn FnMut(i64)>,
    samples_read: u64,
    samples_written: u64,
    last_pts_us: Option<i64>,
}

impl<'a, W: ContainerWriter> TrackIo<'a, W> {
    fn new(
        media_type: MediaType,
        reader: Box<dyn SampleReader + 'a>,
        muxer: &'a ContainerMuxer<W>,
        state: PipelineState,
    ) -> Self {
        Self {
            media_type,
            reader,
            muxer,
            binding: None,
            state,
            cancel: CancelToken::new(),
            poll_timeout: Duration::from_millis(10),
            observer: None,
            samples_read: 0,
            samples_written: 0,
            last_pts_us: None,
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            tracing::debug!(media_type = %self.media_type, from = %self.state, to = %state, "pipeline state");
            self.state = state;
        }
    }

    fn read(&mut self) -> Result<Option<Sample>> {
        let sample = self
            .reader
            .next_sample()
            .map_err(reclassify(Error::ReadFailed))?;
        if sample.is_some() {
            self.samples_read += 1;
        }
        Ok(sample)
    }

    fn register(&mut self, format: &W::Format) -> Result<()> {
        if self.binding.is_some() {
            return Err(Error::WriteFailed(format!(
                "{} output format changed mid-stream",
                self.media_type
            )));
        }
        self.binding = Some(self.muxer.add_track(self.media_type, format)?);
        Ok(())
    }

    fn write(&mut self, sample: Sample) -> Result<()> {
        if !sample.is_writable() {
            tracing::trace!(media_type = %self.media_type, "skipping codec-config/empty sample");
            return Ok(());
        }

        let Some(binding) = self.binding else {
            return Err(Error::WriteFailed(format!(
                "{} encoder produced data before its output format",
                self.media_type
            )));
        };

        let pts = sample.pts_us;
        self.muxer.write_sample(binding, sample)?;
        self.samples_written += 1;
        self.last_pts_us = Some(pts);

        if let Some(observer) = self.observer.as_mut() {
            observer(pts);
        }
        Ok(())
    }

    fn summary(&self, remuxed: bool) -> PipelineSummary {
        PipelineSummary {
            media_type: self.media_type,
            remuxed,
            samples_read: self.samples_read,
            samples_written: self.samples_written,
            last_pts_us: self.last_pts_us,
        }
    }
}

fn remux_step<W: ContainerWriter>(format: &W::Format, io: &mut TrackIo<'_, W>) -> Result<()> {
    if io.binding.is_none() {
        io.register(format)?;
        io.set_state(PipelineState::Feeding);
        return Ok(());
    }

    match io.read()? {
        Some(sample) => io.write(sample),
        None => {
            io.set_state(PipelineState::Finished);
            Ok(())
        }
    }
}

/// The decoder/encoder pair of a transcode route, plus whatever either of them handed back.
struct Codecs<Fr, Fmt> {
    decoder: BoxedDecoder<Fr>,
    encoder: BoxedEncoder<Fr, Fmt>,
    /// Read from the source but not yet accepted by the decoder.
    pending_input: Option<CodecInput<Sample>>,
    /// Decoded but not yet accepted by the encoder.
    pending_frame: Option<CodecInput<Fr>>,
    input_done: bool,
    encoder_input_done: bool,
}

impl<Fr, Fmt> Codecs<Fr, Fmt> {
    fn step<W>(&mut self, io: &mut TrackIo<'_, W>) -> Result<()>
    where
        W: ContainerWriter<Format = Fmt>,
    {
        if !self.input_done {
            self.feed_decoder(io)?;
        }
        if !self.encoder_input_done {
            self.feed_encoder(io)?;
        }
        self.drain_encoder(io)
    }

    fn feed_decoder<W: ContainerWriter>(&mut self, io: &mut TrackIo<'_, W>) -> Result<()> {
        let input = match self.pending_input.take() {
            Some(input) => input,
            None => match io.read()? {
                Some(sample) => CodecInput::Data(sample),
                None => CodecInput::EndOfStream,
            },
        };
        let is_eos = matches!(input, CodecInput::EndOfStream);

        match self
            .decoder
            .submit(input, io.poll_timeout)
            .map_err(reclassify(Error::ReadFailed))?
        {
            Submitted::Accepted if is_eos => {
                self.input_done = true;
                io.set_state(PipelineState::Draining);
            }
            Submitted::Accepted => {}
            Submitted::Busy(input) => self.pending_input = Some(input),
        }
        Ok(())
    }

    /// Move decoded output into the encoder until either side has nothing more for us right now.
    ///
    /// PCM blocks rarely line up with encoder input sizes, so this keeps re-polling the decoder
    /// instead of going back around the whole loop after every block.
    fn feed_encoder<W: ContainerWriter>(&mut self, io: &mut TrackIo<'_, W>) -> Result<()> {
        loop {
            if let Some(frame) = self.pending_frame.take() {
                let is_eos = matches!(frame, CodecInput::EndOfStream);

                match self
                    .encoder
                    .submit(frame, io.poll_timeout)
                    .map_err(reclassify(Error::WriteFailed))?
                {
                    Submitted::Busy(frame) => {
                        self.pending_frame = Some(frame);
                        return Ok(());
                    }
                    Submitted::Accepted if is_eos => {
                        self.encoder_input_done = true;
                        io.set_state(PipelineState::AwaitingFormat);
                        return Ok(());
                    }
                    Submitted::Accepted => {}
                }
            }

            match self
                .decoder
                .poll_output(io.poll_timeout)
                .map_err(reclassify(Error::ReadFailed))?
            {
                Decoded::Frame { frame, .. } => self.pending_frame = Some(CodecInput::Data(frame)),
                Decoded::EndOfStream => self.pending_frame = Some(CodecInput::EndOfStream),
                Decoded::TryAgain => return Ok(()),
            }
        }
    }

    fn drain_encoder<W>(&mut self, io: &mut TrackIo<'_, W>) -> Result<()>
    where
        W: ContainerWriter<Format = Fmt>,
    {
        loop {
            match self
                .encoder
                .poll_output(io.poll_timeout)
                .map_err(reclassify(Error::WriteFailed))?
            {
                Encoded::FormatReady(format) => io.register(&format)?,
                Encoded::Sample(sample) => {
                    let eos = sample.flags.end_of_stream;
                    io.write(sample)?;
                    if eos {
                        return self.encoder_finished(io);
                    }
                }
                Encoded::TryAgain => return Ok(()),
                Encoded::EndOfStream => return self.encoder_finished(io),
            }
        }
    }

    fn encoder_finished<W: ContainerWriter>(&mut self, io: &mut TrackIo<'_, W>) -> Result<()> {
        if !self.encoder_input_done {
            return Err(Error::compression(format!(
                "{} encoder ended before its input did",
                io.media_type
            )));
        }
        if io.binding.is_none() {
            return Err(Error::WriteFailed(format!(
                "{} encoder ended without reporting an output format",
                io.media_type
            )));
        }
        io.set_state(PipelineState::Finished);
        Ok(())
    }

    fn release(&mut self, media_type: MediaType) {
        if let Err(err) = self.decoder.release() {
            tracing::warn!(%media_type, error = %err, "failed to release decoder");
        }
        if let Err(err) = self.encoder.release() {
            tracing::warn!(%media_type, error = %err, "failed to release encoder");
        }
    }
}
