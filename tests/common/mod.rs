//! An in-memory backend for integration tests.
//!
//! Sources are synthetic track lists; readers generate evenly spaced samples. The codecs follow the
//! polling contract the way real ones do: they occasionally refuse input, report `TryAgain`, emit a
//! codec-config sample and announce their format before any data. The writer writes every payload
//! to a real file, so its size is controlled by `payload_len`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use squeeze::backend::{
    Backend, CodecInput, ContainerWriter, Decoded, Decoder, Encoded, Encoder, SampleReader,
    SourceContainer, Submitted,
};
use squeeze::plan::EncodePlan;
use squeeze::sample::Sample;
use squeeze::track::{MediaType, Rotation, TrackDescriptor};
use squeeze::{Error, Opts, PipelineConfig, Result};

/// Payload size of the compressed samples the fake readers produce.
pub const SOURCE_PAYLOAD_LEN: usize = 64;

/// Output format as the fake stack describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFormat {
    pub media_type: MediaType,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub sample_rate: u32,
    pub channels: u32,
}

impl FakeFormat {
    fn of_track(track: &TrackDescriptor) -> Self {
        Self {
            media_type: track.media_type,
            mime_type: track.mime_type.clone(),
            width: track.width,
            height: track.height,
            bitrate: track.source_bitrate.unwrap_or(0),
            sample_rate: track.sample_rate,
            channels: track.channel_count,
        }
    }

    fn of_plan(media_type: MediaType, plan: &EncodePlan) -> Self {
        match media_type {
            MediaType::Video => Self {
                media_type,
                mime_type: plan.target_video_codec.mime_type().to_string(),
                width: plan.final_width,
                height: plan.final_height,
                bitrate: u64::from(plan.target_bitrate),
                sample_rate: 0,
                channels: 0,
            },
            MediaType::Audio => Self {
                media_type,
                mime_type: plan.target_audio_codec.mime_type().to_string(),
                width: 0,
                height: 0,
                bitrate: u64::from(plan.audio_bitrate),
                sample_rate: plan.audio_sample_rate,
                channels: plan.audio_channels,
            },
        }
    }
}

/// A decoded frame: just the timestamp it carries.
#[derive(Debug, Clone, Copy)]
pub struct FakeFrame {
    pub pts_us: i64,
}

/// Everything the writer was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    AddTrack(MediaType),
    Start,
    Write { track: usize, pts_us: i64 },
    Finish,
}

/// Observations shared between the test and the backend.
#[derive(Debug, Default)]
pub struct Record {
    pub writer_events: Vec<WriterEvent>,
    pub formats: Vec<FakeFormat>,
    pub rotation: Option<Rotation>,
    pub sources_opened: usize,
    pub sources_closed: usize,
    pub decoders_created: usize,
    pub decoders_released: usize,
    pub encoders_created: usize,
    pub encoders_released: usize,
}

/// Where to inject a fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub open_source: bool,
    pub check_outputs: bool,
    /// Fail reading this track at the given sample index.
    pub read: Option<(MediaType, usize)>,
    /// Fail encoding this track at the given output sample index.
    pub encode: Option<(MediaType, usize)>,
}

#[derive(Clone)]
pub struct FakeBackend {
    tracks: Vec<TrackDescriptor>,
    samples_per_track: usize,
    /// Size of every sample the encoders emit.
    pub payload_len: usize,
    pub faults: Faults,
    pub record: Arc<Mutex<Record>>,
}

impl FakeBackend {
    pub fn new(tracks: Vec<TrackDescriptor>) -> Self {
        Self {
            tracks,
            samples_per_track: 30,
            payload_len: 8,
            faults: Faults::default(),
            record: Arc::default(),
        }
    }

    pub fn with_samples(mut self, samples_per_track: usize) -> Self {
        self.samples_per_track = samples_per_track;
        self
    }

    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, f: impl FnOnce(&mut Record)) {
        f(&mut self.record());
    }
}

impl Backend for FakeBackend {
    type Format = FakeFormat;
    type VideoFrame = FakeFrame;
    type AudioFrame = FakeFrame;
    type Source = FakeSource;
    type Writer = FakeWriter;

    fn open_source(&self, _path: &Path) -> Result<FakeSource> {
        if self.faults.open_source {
            return Err(Error::CompressionError("not a media container".into()));
        }
        self.bump(|r| r.sources_opened += 1);
        Ok(FakeSource {
            tracks: self.tracks.clone(),
            samples_per_track: self.samples_per_track,
            read_fault: self.faults.read,
            record: Arc::clone(&self.record),
        })
    }

    fn check_outputs(&self, _plan: &EncodePlan, _has_audio: bool) -> Result<()> {
        if self.faults.check_outputs {
            return Err(Error::CompressionError("no encoder for this container".into()));
        }
        Ok(())
    }

    fn create_writer(&self, path: &Path, plan: &EncodePlan) -> Result<FakeWriter> {
        self.bump(|r| r.rotation = Some(plan.rotation));
        Ok(FakeWriter {
            file: File::create(path)?,
            record: Arc::clone(&self.record),
        })
    }

    fn video_decoder(
        &self,
        _source: &FakeSource,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = FakeFrame>>> {
        self.bump(|r| r.decoders_created += 1);
        Ok(Box::new(FakeDecoder::new(Arc::clone(&self.record))))
    }

    fn video_encoder(
        &self,
        plan: &EncodePlan,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = FakeFrame, Format = FakeFormat>>> {
        self.bump(|r| r.encoders_created += 1);
        Ok(Box::new(FakeEncoder::new(MediaType::Video, plan, self)))
    }

    fn audio_decoder(
        &self,
        _source: &FakeSource,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Decoder<Frame = FakeFrame>>> {
        self.bump(|r| r.decoders_created += 1);
        Ok(Box::new(FakeDecoder::new(Arc::clone(&self.record))))
    }

    fn audio_encoder(
        &self,
        plan: &EncodePlan,
        _track: &TrackDescriptor,
    ) -> Result<Box<dyn Encoder<Frame = FakeFrame, Format = FakeFormat>>> {
        self.bump(|r| r.encoders_created += 1);
        Ok(Box::new(FakeEncoder::new(MediaType::Audio, plan, self)))
    }
}

pub struct FakeSource {
    tracks: Vec<TrackDescriptor>,
    samples_per_track: usize,
    read_fault: Option<(MediaType, usize)>,
    record: Arc<Mutex<Record>>,
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        if let Ok(mut record) = self.record.lock() {
            record.sources_closed += 1;
        }
    }
}

impl SourceContainer for FakeSource {
    type Format = FakeFormat;

    fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    fn open_reader(&self, track: &TrackDescriptor) -> Result<Box<dyn SampleReader + '_>> {
        let count = self.samples_per_track;
        let step = if count == 0 {
            0
        } else {
            track.duration_us / count as i64
        };
        let fail_at = self
            .read_fault
            .filter(|(media_type, _)| *media_type == track.media_type)
            .map(|(_, index)| index);

        Ok(Box::new(FakeReader {
            next: 0,
            count,
            step,
            fail_at,
        }))
    }

    fn track_format(&self, track: &TrackDescriptor) -> Result<FakeFormat> {
        Ok(FakeFormat::of_track(track))
    }
}

struct FakeReader {
    next: usize,
    count: usize,
    step: i64,
    fail_at: Option<usize>,
}

impl SampleReader for FakeReader {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        if self.fail_at == Some(self.next) {
            return Err(Error::CompressionError("corrupt packet".into()));
        }
        if self.next >= self.count {
            return Ok(None);
        }

        let pts = self.next as i64 * self.step;
        self.next += 1;
        Ok(Some(
            Sample::new(pts, vec![0x5A; SOURCE_PAYLOAD_LEN]).key_frame(),
        ))
    }
}

/// Decodes one sample into one frame.
///
/// Every third submission is refused and every other poll reports `TryAgain`.
struct FakeDecoder {
    frames: VecDeque<FakeFrame>,
    eos_in: bool,
    submits: usize,
    polls: usize,
    record: Arc<Mutex<Record>>,
    released: bool,
}

impl FakeDecoder {
    fn new(record: Arc<Mutex<Record>>) -> Self {
        Self {
            frames: VecDeque::new(),
            eos_in: false,
            submits: 0,
            polls: 0,
            record,
            released: false,
        }
    }
}

impl Decoder for FakeDecoder {
    type Frame = FakeFrame;

    fn submit(
        &mut self,
        input: CodecInput<Sample>,
        _timeout: Duration,
    ) -> Result<Submitted<CodecInput<Sample>>> {
        self.submits += 1;
        if self.submits % 3 == 0 {
            return Ok(Submitted::Busy(input));
        }

        match input {
            CodecInput::Data(sample) => self.frames.push_back(FakeFrame {
                pts_us: sample.pts_us,
            }),
            CodecInput::EndOfStream => self.eos_in = true,
        }
        Ok(Submitted::Accepted)
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<Decoded<FakeFrame>> {
        self.polls += 1;
        if self.polls % 2 == 0 {
            return Ok(Decoded::TryAgain);
        }

        match self.frames.pop_front() {
            Some(frame) => Ok(Decoded::Frame {
                pts_us: frame.pts_us,
                frame,
            }),
            None if self.eos_in => Ok(Decoded::EndOfStream),
            None => Ok(Decoded::TryAgain),
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            if let Ok(mut record) = self.record.lock() {
                record.decoders_released += 1;
            }
        }
        Ok(())
    }
}

/// Encodes one frame into one `payload_len` sample.
///
/// Announces its format first, then a codec-config sample. Holds at most two frames before
/// refusing input, and reports `TryAgain` on every fourth poll.
struct FakeEncoder {
    media_type: MediaType,
    format: Option<FakeFormat>,
    config_sent: bool,
    queue: VecDeque<FakeFrame>,
    eos_in: bool,
    polls: usize,
    emitted: usize,
    payload_len: usize,
    fail_at: Option<usize>,
    record: Arc<Mutex<Record>>,
    released: bool,
}

impl FakeEncoder {
    fn new(media_type: MediaType, plan: &EncodePlan, backend: &FakeBackend) -> Self {
        Self {
            media_type,
            format: Some(FakeFormat::of_plan(media_type, plan)),
            config_sent: false,
            queue: VecDeque::new(),
            eos_in: false,
            polls: 0,
            emitted: 0,
            payload_len: backend.payload_len,
            fail_at: backend
                .faults
                .encode
                .filter(|(m, _)| *m == media_type)
                .map(|(_, index)| index),
            record: Arc::clone(&backend.record),
            released: false,
        }
    }
}

impl Encoder for FakeEncoder {
    type Frame = FakeFrame;
    type Format = FakeFormat;

    fn submit(
        &mut self,
        input: CodecInput<FakeFrame>,
        _timeout: Duration,
    ) -> Result<Submitted<CodecInput<FakeFrame>>> {
        if self.queue.len() >= 2 {
            return Ok(Submitted::Busy(input));
        }

        match input {
            CodecInput::Data(frame) => self.queue.push_back(frame),
            CodecInput::EndOfStream => self.eos_in = true,
        }
        Ok(Submitted::Accepted)
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<Encoded<FakeFormat>> {
        if let Some(format) = self.format.take() {
            return Ok(Encoded::FormatReady(format));
        }
        if !self.config_sent {
            self.config_sent = true;
            return Ok(Encoded::Sample(Sample::new(0, vec![0x01, 0x02]).codec_config()));
        }

        self.polls += 1;
        if self.polls % 4 == 0 {
            return Ok(Encoded::TryAgain);
        }

        match self.queue.pop_front() {
            Some(frame) => {
                if self.fail_at == Some(self.emitted) {
                    return Err(Error::CompressionError(format!(
                        "{} encoder fault",
                        self.media_type
                    )));
                }
                self.emitted += 1;
                Ok(Encoded::Sample(
                    Sample::new(frame.pts_us, vec![0xAB; self.payload_len]).key_frame(),
                ))
            }
            None if self.eos_in => Ok(Encoded::EndOfStream),
            None => Ok(Encoded::TryAgain),
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            if let Ok(mut record) = self.record.lock() {
                record.encoders_released += 1;
            }
        }
        Ok(())
    }
}

/// Appends every payload to a real file.
pub struct FakeWriter {
    file: File,
    record: Arc<Mutex<Record>>,
}

impl FakeWriter {
    fn log(&self, event: WriterEvent) {
        if let Ok(mut record) = self.record.lock() {
            record.writer_events.push(event);
        }
    }
}

impl ContainerWriter for FakeWriter {
    type Format = FakeFormat;

    fn add_track(&mut self, media_type: MediaType, format: &FakeFormat) -> Result<usize> {
        self.log(WriterEvent::AddTrack(media_type));
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        record.formats.push(format.clone());
        Ok(record.formats.len() - 1)
    }

    fn start(&mut self) -> Result<()> {
        self.log(WriterEvent::Start);
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()> {
        self.file.write_all(&sample.payload)?;
        self.log(WriterEvent::Write {
            track,
            pts_us: sample.pts_us,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.file.flush()?;
        self.log(WriterEvent::Finish);
        Ok(())
    }
}

/// A 1920x1080 H.264 video track at 8 Mbit/s, 2 seconds long.
pub fn hd_video(index: usize) -> TrackDescriptor {
    TrackDescriptor::video(index, "video/avc", 1920, 1080)
        .with_duration_us(2_000_000)
        .with_bitrate(8_000_000)
}

/// A 48 kHz stereo AAC track at 192 kbit/s, 2 seconds long.
pub fn aac_audio(index: usize) -> TrackDescriptor {
    TrackDescriptor::audio(index, "audio/mp4a-latm", 48_000, 2)
        .with_duration_us(2_000_000)
        .with_bitrate(192_000)
}

/// Pipeline settings that never wait.
pub fn fast() -> PipelineConfig {
    PipelineConfig {
        poll_timeout: Duration::ZERO,
        progress_interval: Duration::ZERO,
        ..PipelineConfig::default()
    }
}

/// A scratch directory with an `input_len`-byte input file and a request targeting `out.mp4`.
pub fn request(input_len: usize, bitrate: u32) -> anyhow::Result<(tempfile::TempDir, Opts)> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("in.mp4");
    fs::write(&input, vec![0x11; input_len])?;
    let opts = Opts::new(input, dir.path().join("out.mp4"), bitrate);
    Ok((dir, opts))
}
