//! FFmpeg backend.
//!
//! We implement the collaborator traits from [`crate::backend`] on top of `ffmpeg-next`:
//! - sources are probed once; every reader opens its own demuxer so pipelines never share a cursor
//! - compressed samples travel with microsecond timestamps
//! - `send_*`/`receive_*` map directly onto the polling contract (`EAGAIN` → not ready)
//! - the video encoder scales to the planned size itself; the audio encoder resamples and
//!   re-frames PCM to the codec's frame size
//! - output is always MP4
//!
//! None of the codec types here are `Send`. That's fine: the pipeline creates each codec on the
//! thread that drives it.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, anyhow};
use ffmpeg_next as ffmpeg;
use ffmpeg::codec::{self, threading};
use ffmpeg::format::{self, Pixel};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::error::EAGAIN;
use ffmpeg::{Dictionary, Packet, Rational, Rescale, encoder, frame, media};

use crate::backend::{
    Backend, CodecInput, ContainerWriter, Decoded, Decoder, Encoded, Encoder, SampleReader,
    SourceContainer, Submitted,
};
use crate::codec::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};
use crate::plan::EncodePlan;
use crate::sample::Sample;
use crate::track::{MediaType, Rotation, TrackDescriptor};

/// Time base of every timestamp that crosses the backend boundary.
const MICROS: Rational = Rational(1, 1_000_000);

/// Output time base for video streams.
const VIDEO_STREAM_TIME_BASE: Rational = Rational(1, 90_000);

/// Nominal frame rate handed to video encoders (rate control only; timestamps come from the source).
const NOMINAL_FPS: i32 = 30;

/// Fallback encoder frame size for codecs that don't announce one.
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;

static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

fn init() -> Result<()> {
    INIT.get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| Error::compression(format!("failed to initialize ffmpeg: {e}")))
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == EAGAIN)
}

fn video_codec_id(codec: VideoCodec) -> codec::Id {
    match codec {
        VideoCodec::H264 => codec::Id::H264,
        VideoCodec::H265 => codec::Id::HEVC,
    }
}

fn audio_codec_id(codec: AudioCodec) -> codec::Id {
    match codec {
        AudioCodec::Aac => codec::Id::AAC,
        AudioCodec::Mp3 => codec::Id::MP3,
        AudioCodec::Alac => codec::Id::ALAC,
    }
}

/// MIME type used in [`TrackDescriptor`]s for an FFmpeg codec id.
fn mime_type(medium: media::Type, id: codec::Id) -> String {
    let known = match id {
        codec::Id::H264 => Some(VideoCodec::H264.mime_type()),
        codec::Id::HEVC => Some(VideoCodec::H265.mime_type()),
        codec::Id::AAC => Some(AudioCodec::Aac.mime_type()),
        codec::Id::MP3 => Some(AudioCodec::Mp3.mime_type()),
        codec::Id::ALAC => Some(AudioCodec::Alac.mime_type()),
        _ => None,
    };
    match (known, medium) {
        (Some(mime), _) => mime.to_string(),
        (None, media::Type::Audio) => format!("audio/x-{}", id.name()),
        (None, _) => format!("video/x-{}", id.name()),
    }
}

/// Clockwise rotation of a stream, from its display matrix or its `rotate` tag.
fn stream_rotation(stream: &format::stream::Stream) -> Rotation {
    for side_data in stream.side_data() {
        if side_data.kind() != codec::packet::side_data::Type::DisplayMatrix {
            continue;
        }
        if let Some(rotation) = matrix_rotation(side_data.data()) {
            return rotation;
        }
    }

    stream
        .metadata()
        .get("rotate")
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(Rotation::from_degrees)
        .unwrap_or_default()
}

/// Size of a display matrix: 3x3 native-endian `i32`s.
const DISPLAY_MATRIX_LEN: usize = 36;

/// Clockwise rotation encoded in a display matrix.
///
/// Entries are 16.16 fixed point except the last column; only the first row matters here.
fn matrix_rotation(data: &[u8]) -> Option<Rotation> {
    if data.len() < DISPLAY_MATRIX_LEN {
        return None;
    }
    let read = |i: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[i * 4..i * 4 + 4]);
        f64::from(i32::from_ne_bytes(raw)) / 65536.0
    };
    let (a, b) = (read(0), read(1));
    if a == 0.0 && b == 0.0 {
        return None;
    }
    Some(Rotation::from_degrees(b.atan2(a).to_degrees().round() as i64))
}

/// Display matrix for a clockwise rotation, laid out the way MP4 `tkhd` stores it.
fn display_matrix(rotation: Rotation) -> [u8; DISPLAY_MATRIX_LEN] {
    let (sin, cos) = match rotation {
        Rotation::Deg0 => (0, 1),
        Rotation::Deg90 => (1, 0),
        Rotation::Deg180 => (0, -1),
        Rotation::Deg270 => (-1, 0),
    };
    let matrix: [i32; 9] = [
        cos << 16,
        sin << 16,
        0,
        -sin << 16,
        cos << 16,
        0,
        0,
        0,
        1 << 30,
    ];

    let mut out = [0u8; DISPLAY_MATRIX_LEN];
    for (chunk, value) in out.chunks_exact_mut(4).zip(matrix) {
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    out
}

/// Compressed format of one stream, as the output container needs it.
pub struct StreamFormat {
    parameters: codec::Parameters,
    time_base: Rational,
}

/// [`Backend`] over FFmpeg.
pub struct FfmpegBackend {
    threads: usize,
}

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        init()?;
        Ok(Self {
            threads: num_cpus::get(),
        })
    }

    /// Limit codec worker threads (defaults to the number of CPUs).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    fn stream_decoder(&self, source: &FfmpegSource, index: usize) -> Result<codec::decoder::Decoder> {
        let input = format::input(&source.path)
            .with_context(|| format!("failed to open {}", source.path.display()))?;
        let stream = input
            .stream(index)
            .ok_or_else(|| anyhow!("stream {index} disappeared"))?;

        let mut ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to create decoder context")?;
        ctx.set_threading(threading::Config::count(self.threads));
        Ok(ctx.decoder())
    }
}

impl Backend for FfmpegBackend {
    type Format = StreamFormat;
    type VideoFrame = frame::Video;
    type AudioFrame = frame::Audio;
    type Source = FfmpegSource;
    type Writer = FfmpegWriter;

    fn open_source(&self, path: &Path) -> Result<FfmpegSource> {
        FfmpegSource::open(path)
    }

    fn check_outputs(&self, plan: &EncodePlan, has_audio: bool) -> Result<()> {
        if encoder::find(video_codec_id(plan.target_video_codec)).is_none() {
            return Err(Error::WriterInputError(format!(
                "no {} encoder available",
                plan.target_video_codec
            )));
        }
        if has_audio && encoder::find(audio_codec_id(plan.target_audio_codec)).is_none() {
            return Err(Error::WriterInputError(format!(
                "no {} encoder available",
                plan.target_audio_codec
            )));
        }
        Ok(())
    }

    fn create_writer(&self, path: &Path, plan: &EncodePlan) -> Result<FfmpegWriter> {
        let octx = format::output_as(path, "mp4")
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(FfmpegWriter {
            octx,
            rotation: plan.rotation,
            time_bases: Vec::new(),
        })
    }

    fn video_decoder(
        &self,
        source: &FfmpegSource,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = frame::Video>>> {
        let decoder = self
            .stream_decoder(source, track.index)?
            .video()
            .context("failed to open video decoder")?;
        Ok(Box::new(FfmpegDecoder {
            inner: VideoDecoding(decoder),
        }))
    }

    fn video_encoder(
        &self,
        plan: &EncodePlan,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = frame::Video, Format = StreamFormat>>> {
        Ok(Box::new(VideoEncoder::open(plan, self.threads)?))
    }

    fn audio_decoder(
        &self,
        source: &FfmpegSource,
        track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = frame::Audio>>> {
        let decoder = self
            .stream_decoder(source, track.index)?
            .audio()
            .context("failed to open audio decoder")?;
        Ok(Box::new(FfmpegDecoder {
            inner: AudioDecoding(decoder),
        }))
    }

    fn audio_encoder(
        &self,
        plan: &EncodePlan,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = frame::Audio, Format = StreamFormat>>> {
        Ok(Box::new(AudioEncoder::open(plan)?))
    }
}

/// A probed source file.
///
/// We keep only the path and the track list; every reader and decoder opens its own demuxer.
pub struct FfmpegSource {
    path: PathBuf,
    tracks: Vec<TrackDescriptor>,
}

impl FfmpegSource {
    fn open(path: &Path) -> Result<Self> {
        let input = format::input(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        // AV_TIME_BASE units are microseconds already.
        let container_duration_us = input.duration().max(0);
        let container_bitrate = u64::try_from(input.bit_rate()).ok().filter(|&b| b > 0);

        let mut tracks = Vec::new();
        for stream in input.streams() {
            let parameters = stream.parameters();
            let medium = parameters.medium();
            let mime = mime_type(medium, parameters.id());

            let duration_us = match stream.duration() {
                d if d > 0 => d.rescale(stream.time_base(), MICROS),
                _ => container_duration_us,
            };

            let ctx = codec::context::Context::from_parameters(parameters)
                .context("failed to read stream parameters")?;

            let track = match medium {
                media::Type::Video => {
                    let decoder = ctx.decoder().video().context("failed to probe video stream")?;
                    let bitrate = Some(decoder.bit_rate() as u64)
                        .filter(|&b| b > 0)
                        .or(container_bitrate);
                    let mut track =
                        TrackDescriptor::video(stream.index(), mime, decoder.width(), decoder.height())
                            .with_rotation(stream_rotation(&stream))
                            .with_duration_us(duration_us);
                    track.source_bitrate = bitrate;
                    track
                }
                media::Type::Audio => {
                    let decoder = ctx.decoder().audio().context("failed to probe audio stream")?;
                    let mut track = TrackDescriptor::audio(
                        stream.index(),
                        mime,
                        decoder.rate(),
                        decoder.ch_layout().channels(),
                    )
                    .with_duration_us(duration_us);
                    track.source_bitrate = Some(decoder.bit_rate() as u64).filter(|&b| b > 0);
                    track
                }
                _ => continue,
            };

            tracing::debug!(
                index = track.index,
                media_type = %track.media_type,
                mime = %track.mime_type,
                width = track.width,
                height = track.height,
                rotation = track.rotation.degrees(),
                duration_us = track.duration_us,
                "probed track"
            );
            tracks.push(track);
        }

        Ok(Self {
            path: path.to_path_buf(),
            tracks,
        })
    }
}

impl SourceContainer for FfmpegSource {
    type Format = StreamFormat;

    fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    fn open_reader(&self, track: &TrackDescriptor) -> Result<Box<dyn SampleReader + '_>> {
        let input = format::input(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let time_base = input
            .stream(track.index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("stream {} disappeared", track.index))?;

        Ok(Box::new(FfmpegReader {
            input,
            stream_index: track.index,
            time_base,
        }))
    }

    fn track_format(&self, track: &TrackDescriptor) -> Result<StreamFormat> {
        let input = format::input(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let stream = input
            .stream(track.index)
            .ok_or_else(|| anyhow!("stream {} disappeared", track.index))?;

        Ok(StreamFormat {
            parameters: stream.parameters(),
            time_base: stream.time_base(),
        })
    }
}

struct FfmpegReader {
    input: format::context::Input,
    stream_index: usize,
    time_base: Rational,
}

impl SampleReader for FfmpegReader {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(err) => return Err(anyhow::Error::new(err).context("failed to read packet").into()),
            }
            if packet.stream() != self.stream_index {
                continue;
            }

            let Some(data) = packet.data() else {
                continue;
            };

            let pts = packet.pts().or(packet.dts()).unwrap_or(0);
            let mut sample = Sample::new(pts.rescale(self.time_base, MICROS), data.to_vec());
            sample.dts_us = packet.dts().map(|dts| dts.rescale(self.time_base, MICROS));
            if packet.is_key() {
                sample = sample.key_frame();
            }
            return Ok(Some(sample));
        }
    }
}

/// The two decoder flavours differ only in their frame type.
trait Decoding {
    type Frame;

    fn opened(&mut self) -> &mut codec::decoder::Opened;
    fn empty_frame() -> Self::Frame;
    fn receive(&mut self, frame: &mut Self::Frame) -> std::result::Result<(), ffmpeg::Error>;
    fn timestamp(frame: &Self::Frame) -> Option<i64>;
}

struct VideoDecoding(codec::decoder::Video);
struct AudioDecoding(codec::decoder::Audio);

impl Decoding for VideoDecoding {
    type Frame = frame::Video;

    fn opened(&mut self) -> &mut codec::decoder::Opened {
        &mut self.0
    }
    fn empty_frame() -> frame::Video {
        frame::Video::empty()
    }
    fn receive(&mut self, frame: &mut frame::Video) -> std::result::Result<(), ffmpeg::Error> {
        self.0.receive_frame(frame)
    }
    fn timestamp(frame: &frame::Video) -> Option<i64> {
        frame.timestamp().or(frame.pts())
    }
}

impl Decoding for AudioDecoding {
    type Frame = frame::Audio;

    fn opened(&mut self) -> &mut codec::decoder::Opened {
        &mut self.0
    }
    fn empty_frame() -> frame::Audio {
        frame::Audio::empty()
    }
    fn receive(&mut self, frame: &mut frame::Audio) -> std::result::Result<(), ffmpeg::Error> {
        self.0.receive_frame(frame)
    }
    fn timestamp(frame: &frame::Audio) -> Option<i64> {
        frame.timestamp().or(frame.pts())
    }
}

struct FfmpegDecoder<D> {
    inner: D,
}

impl<D: Decoding> Decoder for FfmpegDecoder<D> {
    type Frame = D::Frame;

    fn submit(
        &mut self,
        input: CodecInput<Sample>,
        _timeout: Duration,
    ) -> Result<Submitted<CodecInput<Sample>>> {
        let res = match &input {
            CodecInput::Data(sample) => {
                let mut packet = Packet::copy(&sample.payload);
                packet.set_pts(Some(sample.pts_us));
                packet.set_dts(sample.dts_us);
                if sample.flags.key_frame {
                    packet.set_flags(codec::packet::Flags::KEY);
                }
                self.inner.opened().send_packet(&packet)
            }
            CodecInput::EndOfStream => self.inner.opened().send_eof(),
        };

        match res {
            Ok(()) => Ok(Submitted::Accepted),
            Err(err) if is_again(&err) => Ok(Submitted::Busy(input)),
            Err(err) => Err(anyhow::Error::new(err).context("decoder rejected input").into()),
        }
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<Decoded<D::Frame>> {
        let mut frame = D::empty_frame();
        match self.inner.receive(&mut frame) {
            Ok(()) => Ok(Decoded::Frame {
                pts_us: D::timestamp(&frame).unwrap_or(0),
                frame,
            }),
            Err(ffmpeg::Error::Eof) => Ok(Decoded::EndOfStream),
            Err(err) if is_again(&err) => Ok(Decoded::TryAgain),
            Err(err) => Err(anyhow::Error::new(err).context("decode failed").into()),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.inner.opened().flush();
        Ok(())
    }
}

struct VideoEncoder {
    encoder: encoder::video::Encoder,
    format: Option<StreamFormat>,
    scaler: Option<scaling::Context>,
    width: u32,
    height: u32,
}

impl VideoEncoder {
    fn open(plan: &EncodePlan, threads: usize) -> Result<Self> {
        let codec = encoder::find(video_codec_id(plan.target_video_codec)).ok_or_else(|| {
            Error::WriterInputError(format!("no {} encoder available", plan.target_video_codec))
        })?;

        let mut ctx = codec::context::Context::new_with_codec(codec);
        ctx.set_threading(threading::Config::count(threads));
        let mut setup = ctx.encoder().video().context("failed to create video encoder")?;

        setup.set_width(plan.final_width);
        setup.set_height(plan.final_height);
        setup.set_format(Pixel::YUV420P);
        setup.set_time_base(MICROS);
        setup.set_frame_rate(Some(Rational(NOMINAL_FPS, 1)));
        setup.set_bit_rate(plan.target_bitrate as usize);
        setup.set_gop(NOMINAL_FPS as u32);
        setup.set_max_b_frames(0);
        setup.set_flags(codec::Flags::GLOBAL_HEADER);

        let encoder = setup
            .open_with(Dictionary::new())
            .with_context(|| format!("failed to open {} encoder", plan.target_video_codec))?;

        let format = StreamFormat {
            parameters: codec::Parameters::from(&encoder),
            time_base: VIDEO_STREAM_TIME_BASE,
        };

        Ok(Self {
            encoder,
            format: Some(format),
            scaler: None,
            width: plan.final_width,
            height: plan.final_height,
        })
    }

    fn scale(&mut self, frame: &frame::Video) -> Result<frame::Video> {
        let scaler = match &mut self.scaler {
            Some(scaler) => scaler,
            None => self.scaler.insert(
                scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    Pixel::YUV420P,
                    self.width,
                    self.height,
                    scaling::Flags::BILINEAR,
                )
                .context("failed to create scaler")?,
            ),
        };

        let mut scaled = frame::Video::empty();
        scaler.run(frame, &mut scaled).context("failed to scale frame")?;
        scaled.set_pts(frame.timestamp().or(frame.pts()));
        Ok(scaled)
    }
}

impl Encoder for VideoEncoder {
    type Frame = frame::Video;
    type Format = StreamFormat;

    fn submit(
        &mut self,
        input: CodecInput<frame::Video>,
        _timeout: Duration,
    ) -> Result<Submitted<CodecInput<frame::Video>>> {
        let res = match &input {
            CodecInput::Data(frame) => {
                let scaled = self.scale(frame)?;
                self.encoder.send_frame(&scaled)
            }
            CodecInput::EndOfStream => self.encoder.send_eof(),
        };

        match res {
            Ok(()) => Ok(Submitted::Accepted),
            Err(err) if is_again(&err) => Ok(Submitted::Busy(input)),
            Err(err) => Err(anyhow::Error::new(err).context("video encoder rejected input").into()),
        }
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<Encoded<StreamFormat>> {
        if let Some(format) = self.format.take() {
            return Ok(Encoded::FormatReady(format));
        }
        receive_encoded(&mut self.encoder, MICROS)
    }

    fn release(&mut self) -> Result<()> {
        self.scaler = None;
        Ok(())
    }
}

/// Pull one packet out of an opened encoder, with timestamps converted to microseconds.
fn receive_encoded(
    encoder: &mut encoder::Encoder,
    time_base: Rational,
) -> Result<Encoded<StreamFormat>> {
    let mut packet = Packet::empty();
    match encoder.receive_packet(&mut packet) {
        Ok(()) => {
            let payload = packet.data().map(<[u8]>::to_vec).unwrap_or_default();
            let pts = packet.pts().or(packet.dts()).unwrap_or(0);
            let mut sample = Sample::new(pts.rescale(time_base, MICROS), payload);
            sample.dts_us = packet.dts().map(|dts| dts.rescale(time_base, MICROS));
            if packet.is_key() {
                sample = sample.key_frame();
            }
            Ok(Encoded::Sample(sample))
        }
        Err(ffmpeg::Error::Eof) => Ok(Encoded::EndOfStream),
        Err(err) if is_again(&err) => Ok(Encoded::TryAgain),
        Err(err) => Err(anyhow::Error::new(err).context("encode failed").into()),
    }
}

/// PCM buffer that re-frames resampled audio into fixed encoder-sized frames.
///
/// Bytes are kept per plane, so this works for planar and packed sample formats alike.
struct SampleFifo {
    planes: Vec<Vec<u8>>,
    /// Bytes per sample in one plane.
    stride: usize,
}

impl SampleFifo {
    fn new(format: format::Sample, channels: usize) -> Self {
        let (plane_count, stride) = if format.is_planar() {
            (channels, format.bytes())
        } else {
            (1, format.bytes() * channels)
        };
        Self {
            planes: vec![Vec::new(); plane_count],
            stride,
        }
    }

    /// Samples currently buffered (per channel).
    fn len(&self) -> usize {
        self.planes.first().map_or(0, |p| p.len() / self.stride)
    }

    fn push(&mut self, frame: &frame::Audio) {
        let bytes = frame.samples() * self.stride;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&frame.data(index)[..bytes]);
        }
    }

    /// Fill `frame` from the front of the buffer, zero-padding whatever is missing.
    fn pop_into(&mut self, frame: &mut frame::Audio) {
        let wanted = frame.samples() * self.stride;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            let available = plane.len().min(wanted);
            let dst = &mut frame.data_mut(index)[..wanted];
            dst[..available].copy_from_slice(&plane[..available]);
            dst[available..].fill(0);
            plane.drain(..available);
        }
    }
}

struct AudioEncoder {
    encoder: encoder::audio::Encoder,
    format: Option<StreamFormat>,
    resampler: Option<resampling::Context>,
    fifo: SampleFifo,
    sample_format: format::Sample,
    channels: u32,
    rate: u32,
    frame_size: usize,
    next_pts: i64,
    /// A full frame the encoder hasn't taken yet.
    pending: Option<frame::Audio>,
    input_done: bool,
    eof_sent: bool,
}

impl AudioEncoder {
    fn open(plan: &EncodePlan) -> Result<Self> {
        let codec = encoder::find(audio_codec_id(plan.target_audio_codec)).ok_or_else(|| {
            Error::WriterInputError(format!("no {} encoder available", plan.target_audio_codec))
        })?;

        let sample_format = codec
            .audio()
            .ok()
            .and_then(|audio| audio.formats())
            .and_then(|mut formats| formats.next())
            .unwrap_or(format::Sample::F32(format::sample::Type::Planar));
        let rate = plan.audio_sample_rate;

        let ctx = codec::context::Context::new_with_codec(codec);
        let mut setup = ctx.encoder().audio().context("failed to create audio encoder")?;
        setup.set_rate(rate as i32);
        setup.set_ch_layout(ChannelLayout::default_for_channels(plan.audio_channels));
        setup.set_format(sample_format);
        setup.set_bit_rate(plan.audio_bitrate as usize);
        setup.set_time_base(Rational(1, rate as i32));
        setup.set_flags(codec::Flags::GLOBAL_HEADER);

        let encoder = setup
            .open_with(Dictionary::new())
            .with_context(|| format!("failed to open {} encoder", plan.target_audio_codec))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => DEFAULT_AUDIO_FRAME_SIZE,
            n => n,
        };

        let format = StreamFormat {
            parameters: codec::Parameters::from(&encoder),
            time_base: Rational(1, rate as i32),
        };

        Ok(Self {
            encoder,
            format: Some(format),
            resampler: None,
            fifo: SampleFifo::new(sample_format, plan.audio_channels as usize),
            sample_format,
            channels: plan.audio_channels,
            rate,
            frame_size,
            next_pts: 0,
            pending: None,
            input_done: false,
            eof_sent: false,
        })
    }

    fn resample(&mut self, frame: &frame::Audio) -> Result<()> {
        let resampler = match &mut self.resampler {
            Some(resampler) => resampler,
            None => {
                // Mono sources must be declared as such or swr misreads them.
                let source_layout = match frame.ch_layout().channels() {
                    0 | 1 => ChannelLayout::MONO,
                    _ => frame.ch_layout(),
                };
                self.resampler.insert(
                    resampling::Context::get2(
                        frame.format(),
                        source_layout,
                        frame.rate(),
                        self.sample_format,
                        ChannelLayout::default_for_channels(self.channels),
                        self.rate,
                    )
                    .context("failed to create resampler")?,
                )
            }
        };

        let mut resampled = frame::Audio::empty();
        resampler
            .run(frame, &mut resampled)
            .context("failed to resample audio")?;
        if resampled.samples() > 0 {
            self.fifo.push(&resampled);
        }
        Ok(())
    }

    fn flush_resampler(&mut self) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let mut tail = frame::Audio::empty();
        resampler.flush(&mut tail).context("failed to flush resampler")?;
        if tail.samples() > 0 {
            self.fifo.push(&tail);
        }
        Ok(())
    }

    /// Hand buffered PCM to the encoder in `frame_size` frames.
    ///
    /// Returns `false` when the encoder is full and output needs draining first. With `flush`,
    /// the partial tail is zero-padded into one last frame and end-of-stream follows.
    fn pump(&mut self, flush: bool) -> Result<bool> {
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None if self.fifo.len() >= self.frame_size || (flush && self.fifo.len() > 0) => {
                    let mut frame = frame::Audio::new(
                        self.sample_format,
                        self.frame_size,
                        ChannelLayoutMask::default(self.channels as i32),
                    );
                    frame.set_ch_layout(ChannelLayout::default_for_channels(self.channels));
                    frame.set_rate(self.rate);
                    frame.set_pts(Some(self.next_pts));
                    self.fifo.pop_into(&mut frame);
                    self.next_pts += self.frame_size as i64;
                    frame
                }
                None => break,
            };

            match self.encoder.send_frame(&frame) {
                Ok(()) => {}
                Err(err) if is_again(&err) => {
                    self.pending = Some(frame);
                    return Ok(false);
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("audio encoder rejected input")
                        .into());
                }
            }
        }

        if flush && !self.eof_sent {
            match self.encoder.send_eof() {
                Ok(()) => self.eof_sent = true,
                Err(err) if is_again(&err) => return Ok(false),
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("failed to flush audio encoder")
                        .into());
                }
            }
        }
        Ok(true)
    }
}

impl Encoder for AudioEncoder {
    type Frame = frame::Audio;
    type Format = StreamFormat;

    fn submit(
        &mut self,
        input: CodecInput<frame::Audio>,
        _timeout: Duration,
    ) -> Result<Submitted<CodecInput<frame::Audio>>> {
        // Finish what's already buffered before taking more.
        if !self.pump(self.input_done)? {
            return Ok(Submitted::Busy(input));
        }

        match input {
            CodecInput::Data(frame) => {
                self.resample(&frame)?;
                self.pump(false)?;
            }
            CodecInput::EndOfStream => {
                self.input_done = true;
                self.flush_resampler()?;
                self.pump(true)?;
            }
        }
        Ok(Submitted::Accepted)
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<Encoded<StreamFormat>> {
        if let Some(format) = self.format.take() {
            return Ok(Encoded::FormatReady(format));
        }

        let polled = receive_encoded(&mut self.encoder, Rational(1, self.rate as i32))?;

        // Output drained; push whatever input was waiting on it.
        if matches!(polled, Encoded::TryAgain) && (self.pending.is_some() || !self.eof_sent) {
            self.pump(self.input_done)?;
        }
        Ok(polled)
    }

    fn release(&mut self) -> Result<()> {
        self.resampler = None;
        self.pending = None;
        Ok(())
    }
}

/// MP4 writer.
pub struct FfmpegWriter {
    octx: format::context::Output,
    rotation: Rotation,
    time_bases: Vec<Rational>,
}

impl ContainerWriter for FfmpegWriter {
    type Format = StreamFormat;

    fn add_track(&mut self, media_type: MediaType, format: &StreamFormat) -> Result<usize> {
        let mut ost = self
            .octx
            .add_stream(encoder::find(codec::Id::None))
            .with_context(|| format!("failed to add {media_type} stream"))?;
        ost.set_parameters(format.parameters.clone());
        ost.set_time_base(format.time_base);

        // Let the muxer pick the codec tag; a tag copied from another container may not be valid
        // in MP4.
        unsafe {
            (*ost.parameters().as_mut_ptr()).codec_tag = 0;
        }

        // MP4 takes the orientation from display-matrix side data on the codec parameters; a
        // matrix copied from the source is replaced.
        if media_type == MediaType::Video && self.rotation != Rotation::Deg0 {
            let matrix = display_matrix(self.rotation);
            unsafe {
                let par = ost.parameters().as_mut_ptr();
                let side_data = ffmpeg::ffi::av_packet_side_data_new(
                    &mut (*par).coded_side_data,
                    &mut (*par).nb_coded_side_data,
                    codec::packet::side_data::Type::DisplayMatrix.into(),
                    matrix.len(),
                    0,
                );
                if side_data.is_null() || (*side_data).data.is_null() {
                    return Err(Error::compression("failed to attach display matrix"));
                }
                std::ptr::copy_nonoverlapping(matrix.as_ptr(), (*side_data).data, matrix.len());
            }
        }

        Ok(ost.index())
    }

    fn start(&mut self) -> Result<()> {
        self.octx
            .write_header()
            .context("failed to write container header")?;

        // The muxer may adjust stream time bases while writing the header.
        self.time_bases = self.octx.streams().map(|s| s.time_base()).collect();
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()> {
        let time_base = *self
            .time_bases
            .get(track)
            .ok_or_else(|| anyhow!("unknown output track {track}"))?;

        let mut packet = Packet::copy(&sample.payload);
        packet.set_pts(Some(sample.pts_us));
        packet.set_dts(Some(sample.decode_ts_us()));
        if sample.flags.key_frame {
            packet.set_flags(codec::packet::Flags::KEY);
        }
        packet.set_stream(track);
        packet.rescale_ts(MICROS, time_base);
        packet.set_position(-1);

        packet
            .write_interleaved(&mut self.octx)
            .context("failed to write packet")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.octx
            .write_trailer()
            .context("failed to write container trailer")?;
        Ok(())
    }
}
