//! Request and pipeline configuration.
//!
//! This module represents *library-level configuration*, not CLI flags or plugin-channel
//! payloads directly. Frontends map their input into these types so that:
//! - the library remains reusable outside of any particular bridge
//! - tests, batch jobs and other frontends can construct options programmatically
//!
//! `Opts::from_json` is the one bridge-shaped entry point: it validates a loosely typed argument
//! map the way a plugin channel hands it over and fails with `InvalidArguments` before any I/O.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::codec::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};

/// Default audio bitrate (bits/sec).
pub const DEFAULT_AUDIO_BITRATE: u32 = 128_000;

/// Default audio sample rate (Hz).
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Default audio channel count.
pub const DEFAULT_AUDIO_CHANNELS: u32 = 2;

/// Options for one compression request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Source file path.
    pub input: PathBuf,

    /// Destination file path. Any existing file here is deleted before processing begins.
    pub output: PathBuf,

    /// Target video bitrate (bits/sec).
    pub bitrate: u32,

    /// Requested output width. Only honored together with `height`.
    pub width: Option<u32>,

    /// Requested output height. Only honored together with `width`.
    pub height: Option<u32>,

    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
}

impl Opts {
    /// Options with every optional field at its documented default.
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, bitrate: u32) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            bitrate,
            width: None,
            height: None,
            video_codec: VideoCodec::default(),
            audio_codec: AudioCodec::default(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE,
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            audio_channels: DEFAULT_AUDIO_CHANNELS,
        }
    }

    /// Request explicit output dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Parse a bridge-style argument map.
    ///
    /// Required: `input`, `output` (strings) and `bitrate` (integer bits/sec).
    /// Optional: `width`/`height` (both or neither), `videoCodec`, `audioCodec`,
    /// `audioBitrate`, `audioSampleRate`, `audioChannels`.
    ///
    /// `null` is treated the same as an absent field.
    pub fn from_json(args: &Value) -> Result<Self> {
        if !args.is_object() {
            return Err(Error::invalid("arguments must be an object"));
        }

        let raw: RawRequest = serde_json::from_value(args.clone())
            .map_err(|e| Error::invalid(format!("malformed arguments: {e}")))?;

        let input = raw.input.ok_or_else(|| Error::invalid("missing `input`"))?;
        let output = raw.output.ok_or_else(|| Error::invalid("missing `output`"))?;
        let bitrate = raw.bitrate.ok_or_else(|| Error::invalid("missing `bitrate`"))?;

        let mut opts = Self::new(input, output, bitrate);
        opts.width = raw.width;
        opts.height = raw.height;
        opts.video_codec = VideoCodec::from_name(raw.video_codec.as_deref());
        opts.audio_codec = AudioCodec::from_name(raw.audio_codec.as_deref());
        opts.audio_bitrate = raw.audio_bitrate.unwrap_or(DEFAULT_AUDIO_BITRATE);
        opts.audio_sample_rate = raw.audio_sample_rate.unwrap_or(DEFAULT_AUDIO_SAMPLE_RATE);
        opts.audio_channels = raw.audio_channels.unwrap_or(DEFAULT_AUDIO_CHANNELS);

        opts.validate()?;
        Ok(opts)
    }

    /// Check invariants that don't need any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(Error::invalid("`input` must not be empty"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(Error::invalid("`output` must not be empty"));
        }
        if self.input == self.output {
            return Err(Error::invalid("`input` and `output` must differ"));
        }
        if self.bitrate == 0 {
            return Err(Error::invalid("`bitrate` must be positive"));
        }

        match (self.width, self.height) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::invalid(
                    "`width` and `height` must be given together",
                ));
            }
            (Some(0), _) | (_, Some(0)) => {
                return Err(Error::invalid("`width` and `height` must be positive"));
            }
            _ => {}
        }

        if self.audio_bitrate == 0 || self.audio_sample_rate == 0 || self.audio_channels == 0 {
            return Err(Error::invalid("audio parameters must be positive"));
        }

        Ok(())
    }
}

/// Wire shape of a request, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    input: Option<String>,
    output: Option<String>,
    bitrate: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    audio_bitrate: Option<u32>,
    audio_sample_rate: Option<u32>,
    audio_channels: Option<u32>,
}

/// What to do with the resolution when the caller doesn't request one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalePolicy {
    /// Keep the (rotation-corrected) source dimensions.
    #[default]
    PreserveOriginal,

    /// Shrink the source to fit inside this box, preserving aspect ratio. Never upscales.
    FitWithin { max_width: u32, max_height: u32 },
}

/// Tunables for the transcode pipelines.
///
/// These used to be process-wide constants; keeping them here lets tests tighten them.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded wait for every codec dequeue-style operation.
    pub poll_timeout: Duration,

    /// Minimum spacing between progress notifications.
    pub progress_interval: Duration,

    /// Resolution policy when no explicit size is requested.
    pub scale_policy: ScalePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
            progress_interval: Duration::from_millis(200),
            scale_policy: ScalePolicy::PreserveOriginal,
        }
    }
}
