//! Collaborator interfaces for containers and codecs.
//!
//! The transcode core never touches a concrete demuxer, codec or muxer. It drives these traits
//! instead, which keeps the state machine testable and lets platforms plug in whatever codec
//! stack they have (FFmpeg, MediaCodec, VideoToolbox, ...). Hardware selection lives entirely
//! behind these traits.
//!
//! The codec traits follow a *polling* contract:
//! - every dequeue-style call takes a bounded `timeout` and may report "not ready yet"
//!   (`Submitted::Busy`, `Decoded::TryAgain`, `Encoded::TryAgain`)
//! - not-ready is never an error; callers simply poll again
//! - end-of-stream travels in-band (`CodecInput::EndOfStream` in, `EndOfStream` out)

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::plan::EncodePlan;
use crate::sample::Sample;
use crate::track::{MediaType, TrackDescriptor};

/// Input offered to a codec.
#[derive(Debug)]
pub enum CodecInput<T> {
    Data(T),
    EndOfStream,
}

/// Result of offering input to a codec.
#[derive(Debug)]
pub enum Submitted<T> {
    /// The codec took ownership of the input.
    Accepted,

    /// No input slot became free within the timeout; the input is handed back.
    Busy(T),
}

/// Result of polling a decoder for output.
#[derive(Debug)]
pub enum Decoded<F> {
    /// A decoded frame (raw picture or PCM block).
    Frame { pts_us: i64, frame: F },
    TryAgain,
    EndOfStream,
}

/// Result of polling an encoder for output.
#[derive(Debug)]
pub enum Encoded<Fmt> {
    /// The encoder's output format is now known. Signalled once, before any data sample.
    FormatReady(Fmt),
    Sample(Sample),
    TryAgain,
    EndOfStream,
}

/// Sequential reader over one source track's compressed samples.
///
/// Every pipeline gets its own reader so the two pipelines never share a read cursor.
pub trait SampleReader {
    /// The next sample in decode order, or `None` at the end of the track.
    fn next_sample(&mut self) -> Result<Option<Sample>>;
}

/// A decoder for one track.
pub trait Decoder {
    type Frame;

    fn submit(
        &mut self,
        input: CodecInput<Sample>,
        timeout: Duration,
    ) -> Result<Submitted<CodecInput<Sample>>>;

    fn poll_output(&mut self, timeout: Duration) -> Result<Decoded<Self::Frame>>;

    /// Stop the decoder and free its resources. Must be safe to call more than once.
    fn release(&mut self) -> Result<()>;
}

/// An encoder for one track. Any resizing or resampling to the planned format happens in here.
pub trait Encoder {
    type Frame;
    type Format;

    fn submit(
        &mut self,
        input: CodecInput<Self::Frame>,
        timeout: Duration,
    ) -> Result<Submitted<CodecInput<Self::Frame>>>;

    fn poll_output(&mut self, timeout: Duration) -> Result<Encoded<Self::Format>>;

    /// Stop the encoder and free its resources. Must be safe to call more than once.
    fn release(&mut self) -> Result<()>;
}

/// An opened source file.
///
/// The handle is released when dropped, which covers every exit path.
pub trait SourceContainer: Sync {
    type Format;

    /// All tracks, in container order.
    fn tracks(&self) -> &[TrackDescriptor];

    /// Open an independent read cursor positioned at the start of `track`.
    fn open_reader(&self, track: &TrackDescriptor) -> Result<Box<dyn SampleReader + '_>>;

    /// The track's compressed format, as the output container would need it for a remux.
    fn track_format(&self, track: &TrackDescriptor) -> Result<Self::Format>;
}

/// The low-level output container writer.
///
/// [`crate::muxer::ContainerMuxer`] wraps this and enforces call ordering; implementations may
/// assume `add_track* → start → write_sample* → finish`.
pub trait ContainerWriter: Send {
    type Format;

    fn add_track(&mut self, media_type: MediaType, format: &Self::Format) -> Result<usize>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()>;

    /// Flush and close the container.
    fn finish(&mut self) -> Result<()>;
}

/// A complete codec/container stack.
///
/// Codecs are created on the thread that drives them, so codec types need not be `Send`; only the
/// backend itself and the opened source are shared between pipeline threads.
pub trait Backend: Sync {
    type Format: 'static;
    type VideoFrame: 'static;
    type AudioFrame: 'static;
    type Source: SourceContainer<Format = Self::Format>;
    type Writer: ContainerWriter<Format = Self::Format>;

    fn open_source(&self, path: &Path) -> Result<Self::Source>;

    /// Verify that inputs for every planned output track can be attached to the output container.
    fn check_outputs(&self, _plan: &EncodePlan, _has_audio: bool) -> Result<()> {
        Ok(())
    }

    /// Create the output container. The plan's rotation must be recorded as orientation metadata.
    fn create_writer(&self, path: &Path, plan: &EncodePlan) -> Result<Self::Writer>;

    fn video_decoder(
        &self,
        source: &Self::Source,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = Self::VideoFrame>>>;

    fn video_encoder(
        &self,
        plan: &EncodePlan,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = Self::VideoFrame, Format = Self::Format>>>;

    fn audio_decoder(
        &self,
        source: &Self::Source,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = Self::AudioFrame>>>;

    fn audio_encoder(
        &self,
        plan: &EncodePlan,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = Self::AudioFrame, Format = Self::Format>>>;
}

/// Re-label an untyped backend error as the given taxonomy kind.
///
/// Backends mostly report `CompressionError` (often via `anyhow`). Where the failing stage is
/// known (reading, writing, ...), the caller knows better which kind applies. Typed errors such as
/// `Cancelled` or `NoVideoTrack` pass through unchanged.
pub(crate) fn reclassify(kind: fn(String) -> Error) -> impl Fn(Error) -> Error {
    move |err| match err {
        Error::CompressionError(message) => kind(message),
        other => other,
    }
}
